//! VIEW_CHANGE bookkeeping.

use crate::message::{MessagePayload, PreparedProposal, SignedMessage};
use std::collections::{BTreeMap, BTreeSet};

/// Proposals to carry into a new view, one per sequence, from a set of
/// VIEW_CHANGE messages.
///
/// A prepared certificate beats an unprepared one; among equals the higher
/// view wins, then the lower sender id. The result does not depend on the
/// order of `view_changes`.
pub fn merge_certificates<'a>(
    view_changes: impl IntoIterator<Item = &'a SignedMessage>,
) -> Vec<PreparedProposal> {
    let mut messages: Vec<&SignedMessage> = view_changes.into_iter().collect();
    messages.sort_by(|a, b| a.sender.cmp(&b.sender));

    let mut best: BTreeMap<u64, PreparedProposal> = BTreeMap::new();
    for message in messages {
        let MessagePayload::ViewChange { prepared, .. } = &message.payload else {
            continue;
        };
        for candidate in prepared {
            let replace = match best.get(&candidate.sequence) {
                None => true,
                Some(current) => {
                    (candidate.prepared, candidate.view) > (current.prepared, current.view)
                }
            };
            if replace {
                best.insert(candidate.sequence, candidate.clone());
            }
        }
    }
    best.into_values().collect()
}

/// Collects VIEW_CHANGE votes per target view.
#[derive(Debug, Default)]
pub struct ViewChangeTracker {
    votes: BTreeMap<u64, BTreeMap<String, SignedMessage>>,
    sent: BTreeSet<u64>,
    new_view_sent: BTreeSet<u64>,
}

impl ViewChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote for `new_view` and return the number of distinct voters.
    pub fn record(&mut self, new_view: u64, message: SignedMessage) -> usize {
        let votes = self.votes.entry(new_view).or_default();
        votes.entry(message.sender.clone()).or_insert(message);
        votes.len()
    }

    /// Distinct voters for `new_view`, skipping any in `excluded`.
    pub fn count(&self, new_view: u64, excluded: &BTreeSet<String>) -> usize {
        self.votes
            .get(&new_view)
            .map(|v| v.keys().filter(|s| !excluded.contains(*s)).count())
            .unwrap_or(0)
    }

    /// Votes for `new_view` from senders not in `excluded`, ordered by sender.
    pub fn messages(&self, new_view: u64, excluded: &BTreeSet<String>) -> Vec<SignedMessage> {
        self.votes
            .get(&new_view)
            .map(|v| {
                v.iter()
                    .filter(|(sender, _)| !excluded.contains(*sender))
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_sent(&self, new_view: u64) -> bool {
        self.sent.contains(&new_view)
    }

    pub fn mark_sent(&mut self, new_view: u64) {
        self.sent.insert(new_view);
    }

    pub fn has_sent_new_view(&self, new_view: u64) -> bool {
        self.new_view_sent.contains(&new_view)
    }

    pub fn mark_new_view_sent(&mut self, new_view: u64) {
        self.new_view_sent.insert(new_view);
    }

    /// Forget everything at or below an installed view.
    pub fn prune(&mut self, installed_view: u64) {
        self.votes.retain(|view, _| *view > installed_view);
        self.sent.retain(|view| *view > installed_view);
        self.new_view_sent.retain(|view| *view > installed_view);
    }
}

/// Highest last-proposed sequence reported by a set of VIEW_CHANGE messages.
pub fn highest_sequence<'a>(view_changes: impl IntoIterator<Item = &'a SignedMessage>) -> u64 {
    view_changes
        .into_iter()
        .map(|m| m.sequence)
        .max()
        .unwrap_or(0)
}
