//! Reconciliation of divergent histories of one resource.
//!
//! Two mechanics are provided:
//!
//! - [`merge`]: set-union of every known operation, totally ordered by
//!   `(generation, request_id)`. Idempotent, commutative and associative.
//! - [`splice`]: pairwise splice of ordered histories driven by a
//!   [`ResolutionMatrix`].

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::operation::{Operation, OperationClass, ResourceDocument};
use crate::resolution::{Resolution, ResolutionMatrix};

/// Locations of `local` followed by the sites only `conflicting` know, sorted.
fn merged_locations(local: &ResourceDocument, conflicting: &[ResourceDocument]) -> Vec<String> {
    let mut extra: Vec<String> = conflicting
        .iter()
        .flat_map(|doc| doc.locations.iter())
        .filter(|site| !local.locations.contains(site))
        .cloned()
        .collect();
    extra.sort();
    extra.dedup();

    let mut locations = local.locations.clone();
    locations.extend(extra);
    locations
}

/// Rank of one copy of an operation among copies sharing its request id.
///
/// Higher generation wins, then the greater originating site; the remaining
/// fields only break ties between copies that differ in content.
#[allow(clippy::type_complexity)]
fn precedence(
    op: &Operation,
) -> (
    u64,
    &str,
    DateTime<Utc>,
    OperationClass,
    &str,
    &BTreeMap<String, String>,
) {
    (
        op.generation,
        op.site.as_str(),
        op.time,
        op.class,
        op.command.script.as_str(),
        &op.command.files,
    )
}

/// Set-union merge of `local` with every document in `conflicting`.
///
/// Duplicate request ids keep the copy with the higher generation. Equal
/// generations fall back to the greater originating site, so the result does
/// not depend on the order documents are passed in.
pub fn merge(local: &ResourceDocument, conflicting: &[ResourceDocument]) -> ResourceDocument {
    let mut unified: BTreeMap<&str, &Operation> = BTreeMap::new();
    let all = local
        .operations
        .iter()
        .chain(conflicting.iter().flat_map(|doc| doc.operations.iter()));
    for op in all {
        match unified.get(op.request_id.as_str()) {
            Some(existing) if precedence(existing) >= precedence(op) => {}
            _ => {
                unified.insert(op.request_id.as_str(), op);
            }
        }
    }

    let mut operations: Vec<Operation> = unified.into_values().cloned().collect();
    operations.sort_by(|a, b| {
        a.generation
            .cmp(&b.generation)
            .then_with(|| a.request_id.cmp(&b.request_id))
    });

    ResourceDocument {
        site: local.site.clone(),
        locations: merged_locations(local, conflicting),
        operations,
    }
}

/// Splice the histories in `conflicting` onto `local` using `matrix`.
///
/// Conflicting documents are visited in owning-site order so the outcome does
/// not depend on the order they were reported in. Each operation not yet in
/// the result is resolved against the current tail.
pub fn splice(
    local: &ResourceDocument,
    conflicting: &[ResourceDocument],
    matrix: &ResolutionMatrix,
) -> ResourceDocument {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut history: Vec<Operation> = Vec::with_capacity(local.operations.len());
    for op in &local.operations {
        if seen.insert(op.request_id.as_str()) {
            history.push(op.clone());
        }
    }

    let mut others: Vec<&ResourceDocument> = conflicting.iter().collect();
    others.sort_by(|a, b| a.site.cmp(&b.site));

    for doc in others {
        for candidate in &doc.operations {
            if seen.insert(candidate.request_id.as_str()) {
                splice_one(&mut history, candidate.clone(), matrix);
            }
        }
    }

    ResourceDocument {
        site: local.site.clone(),
        locations: merged_locations(local, conflicting),
        operations: history,
    }
}

/// Resolve `candidate` against the tail of `history`.
fn splice_one(history: &mut Vec<Operation>, candidate: Operation, matrix: &ResolutionMatrix) {
    let Some(tail) = history.last() else {
        history.push(candidate);
        return;
    };

    match matrix.lookup(tail.class, candidate.class) {
        Resolution::TakeOne => {
            if tail.class == candidate.class && tail.request_id > candidate.request_id {
                tracing::debug!(kept = %tail.request_id, dropped = %candidate.request_id, "take one");
                return;
            }
            if let Some(replaced) = history.pop() {
                tracing::debug!(kept = %candidate.request_id, dropped = %replaced.request_id, "take one");
            }
            history.push(candidate);
        }
        Resolution::TakeBothKeepOrder => history.push(candidate),
        Resolution::TakeBothReverseOrder => {
            let at = history.len() - 1;
            history.insert(at, candidate);
        }
        Resolution::TakeBothAnyOrder => {
            history.push(candidate);
            let n = history.len();
            if history[n - 2].request_id > history[n - 1].request_id {
                history.swap(n - 2, n - 1);
            }
        }
    }
}
