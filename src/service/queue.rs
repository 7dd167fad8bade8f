//! The per-branch pull request queue.
//!
//! The queue is an ordered sequence with a stable two-tier partition: PRs
//! carrying a top-priority label precede all others, and within each tier
//! arrival order is preserved. The insertion rule lives here and nowhere
//! else, so the partition invariant cannot be violated from outside.

use serde::{Deserialize, Serialize};

use crate::types::{PrNumber, PullRequest};

/// An ordered queue of pull requests awaiting integration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PullRequestQueue {
    entries: Vec<PullRequest>,
}

impl PullRequestQueue {
    /// Inserts or updates a pull request.
    ///
    /// A PR already present is updated in place when its tier is unchanged;
    /// if its tier changed (a top-priority label was added or removed since
    /// it was enqueued) it is re-inserted under the new tier's rule. New
    /// top-priority PRs land at the end of the top tier, new normal PRs at
    /// the back of the queue.
    pub fn insert(&mut self, pull_request: PullRequest, top_priority_labels: &[String]) {
        let is_top = pull_request.has_any_label(top_priority_labels);

        if let Some(index) = self.position(pull_request.number) {
            let was_top = self.entries[index].has_any_label(top_priority_labels);
            if was_top == is_top {
                self.entries[index] = pull_request;
                return;
            }
            self.entries.remove(index);
        }

        if is_top {
            let end_of_top_tier = self
                .entries
                .iter()
                .position(|pr| !pr.has_any_label(top_priority_labels))
                .unwrap_or(self.entries.len());
            self.entries.insert(end_of_top_tier, pull_request);
        } else {
            self.entries.push(pull_request);
        }
    }

    /// Removes a pull request by number, returning it if it was queued.
    pub fn remove(&mut self, number: PrNumber) -> Option<PullRequest> {
        let index = self.position(number)?;
        Some(self.entries.remove(index))
    }

    /// The next pull request to integrate.
    pub fn head(&self) -> Option<&PullRequest> {
        self.entries.first()
    }

    pub fn contains(&self, number: PrNumber) -> bool {
        self.position(number).is_some()
    }

    /// The zero-based position of a pull request in the queue.
    pub fn position(&self, number: PrNumber) -> Option<usize> {
        self.entries.iter().position(|pr| pr.number == number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PullRequest> {
        self.entries.iter()
    }
}
