//! Pairwise resolution policy between operation classes.
//!
//! When two histories of a resource are spliced, each incoming operation is
//! compared with the current tail of the accumulated history. The matrix says
//! what to do with the pair `(tail, candidate)`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::operation::OperationClass;

/// How a pair of operations is combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// Only one of the two survives.
    TakeOne,
    /// Both survive, ordered deterministically by request id.
    TakeBothAnyOrder,
    /// Both survive, tail first.
    TakeBothKeepOrder,
    /// Both survive, candidate first.
    TakeBothReverseOrder,
}

/// One cell of the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResolutionRule {
    /// Class of the operation already in the history.
    pub before: OperationClass,
    /// Class of the incoming operation.
    pub after: OperationClass,
    /// Policy for the pair.
    pub result: Resolution,
}

/// Lookup table of resolution rules.
///
/// Serialized as a plain list of rules. The first rule matching a pair wins;
/// pairs with no rule keep both operations in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolutionMatrix {
    rules: Vec<ResolutionRule>,
}

impl ResolutionMatrix {
    /// Matrix with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule.
    pub fn with_rule(mut self, before: OperationClass, after: OperationClass, result: Resolution) -> Self {
        self.rules.push(ResolutionRule {
            before,
            after,
            result,
        });
        self
    }

    /// Policy for `(before, after)`.
    pub fn lookup(&self, before: OperationClass, after: OperationClass) -> Resolution {
        self.rules
            .iter()
            .find(|rule| rule.before == before && rule.after == after)
            .map(|rule| rule.result)
            .unwrap_or(Resolution::TakeBothKeepOrder)
    }

    /// All rules, in lookup order.
    pub fn rules(&self) -> &[ResolutionRule] {
        &self.rules
    }

    /// Load a matrix from its JSON list form.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let matrix: Self = serde_json::from_slice(bytes)?;
        for (i, rule) in matrix.rules.iter().enumerate() {
            let shadowed = matrix.rules[..i]
                .iter()
                .any(|r| r.before == rule.before && r.after == rule.after);
            if shadowed {
                return Err(Error::InvalidMatrix(format!(
                    "duplicate rule for ({}, {})",
                    rule.before, rule.after
                )));
            }
        }
        Ok(matrix)
    }
}

impl Default for ResolutionMatrix {
    /// Checkpoints supersede whatever precedes them; deltas after a
    /// checkpoint keep their place; deltas among themselves commute.
    fn default() -> Self {
        use OperationClass::*;
        use Resolution::*;

        Self::empty()
            .with_rule(Idempotent, Idempotent, TakeOne)
            .with_rule(CommutativeIdempotent, CommutativeIdempotent, TakeOne)
            .with_rule(Idempotent, CommutativeIdempotent, TakeOne)
            .with_rule(CommutativeIdempotent, Idempotent, TakeOne)
            .with_rule(Commutative, Idempotent, TakeOne)
            .with_rule(Commutative, CommutativeIdempotent, TakeOne)
            .with_rule(Idempotent, Commutative, TakeBothKeepOrder)
            .with_rule(CommutativeIdempotent, Commutative, TakeBothKeepOrder)
            .with_rule(Commutative, Commutative, TakeBothAnyOrder)
    }
}
