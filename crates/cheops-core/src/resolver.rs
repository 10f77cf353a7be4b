//! Decide which operations a site still has to run for a resource.
//!
//! Each document contributes its *suit*: the tail of its history that is not
//! yet fully acknowledged, cut at the most recent checkpoint. If no suit starts
//! with a checkpoint, every site simply catches up on the union of suits. If
//! some do, the checkpoint with the greatest request id wins and every other
//! site adopts the winning suit verbatim.

use std::collections::{HashMap, HashSet};

use crate::operation::{Operation, ReplyDocument, ResourceDocument};

/// Replies indexed by request id.
#[derive(Debug, Default)]
pub struct ReplyIndex<'a> {
    by_request: HashMap<&'a str, HashSet<&'a str>>,
}

impl<'a> ReplyIndex<'a> {
    /// Index `replies` by request id.
    pub fn new(replies: &'a [ReplyDocument]) -> Self {
        let mut by_request: HashMap<&str, HashSet<&str>> = HashMap::new();
        for reply in replies {
            by_request
                .entry(reply.request_id.as_str())
                .or_default()
                .insert(reply.site.as_str());
        }
        Self { by_request }
    }

    /// Whether `site` has replied to `request_id`.
    pub fn has_replied(&self, request_id: &str, site: &str) -> bool {
        self.by_request
            .get(request_id)
            .is_some_and(|sites| sites.contains(site))
    }

    /// Whether every one of `locations` has replied to `request_id`.
    ///
    /// An operation with no locations is never considered dead.
    pub fn is_dead(&self, request_id: &str, locations: &[String]) -> bool {
        if locations.is_empty() {
            return false;
        }
        match self.by_request.get(request_id) {
            Some(sites) => locations.iter().all(|l| sites.contains(l.as_str())),
            None => false,
        }
    }
}

/// The suit of `document`: its live tail, starting at the latest checkpoint
/// if one occurs before a dead operation is reached.
pub fn suit<'d>(document: &'d ResourceDocument, replies: &ReplyIndex<'_>) -> &'d [Operation] {
    let ops = &document.operations;
    let mut start = ops.len();
    for (i, op) in ops.iter().enumerate().rev() {
        if replies.is_dead(&op.request_id, &document.locations) {
            break;
        }
        start = i;
        if op.class.is_idempotent() {
            break;
        }
    }
    &ops[start..]
}

/// Operations `site` must execute now, in application order.
///
/// A site already has an operation when it replied to it or when the
/// operation is part of the document that site owns.
pub fn compute_operations_to_run(
    site: &str,
    documents: &[ResourceDocument],
    replies: &[ReplyDocument],
) -> Vec<Operation> {
    let index = ReplyIndex::new(replies);
    let owned: HashSet<&str> = documents
        .iter()
        .filter(|doc| doc.is_owned_by(site))
        .flat_map(|doc| doc.operations.iter().map(|op| op.request_id.as_str()))
        .collect();
    let already_has =
        |op: &Operation| index.has_replied(&op.request_id, site) || owned.contains(op.request_id.as_str());

    let suits: Vec<(&ResourceDocument, &[Operation])> = documents
        .iter()
        .map(|doc| (doc, suit(doc, &index)))
        .collect();

    let winner = suits
        .iter()
        .filter_map(|(doc, ops)| match ops.first() {
            Some(first) if first.class.is_idempotent() => Some((*doc, *ops, first)),
            _ => None,
        })
        .max_by(|a, b| {
            a.2.request_id
                .cmp(&b.2.request_id)
                .then_with(|| a.0.site.cmp(&b.0.site))
        });

    match winner {
        Some((doc, ops, first)) => {
            tracing::trace!(site, winner = %first.request_id, owner = %doc.site, "checkpoint conflict");
            if doc.is_owned_by(site) {
                return Vec::new();
            }
            ops.iter().filter(|op| !already_has(op)).cloned().collect()
        }
        None => {
            let mut ordered: Vec<_> = suits.iter().collect();
            ordered.sort_by(|a, b| a.0.site.cmp(&b.0.site));

            let mut seen: HashSet<&str> = HashSet::new();
            let mut to_run = Vec::new();
            for (_, ops) in ordered {
                for op in ops.iter() {
                    if seen.insert(op.request_id.as_str()) && !already_has(op) {
                        to_run.push(op.clone());
                    }
                }
            }
            to_run
        }
    }
}
