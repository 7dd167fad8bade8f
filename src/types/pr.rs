//! Pull request types as seen by the merge queue.
//!
//! A [`PullRequest`] is an immutable snapshot of a host-side object; the bot
//! never mutates these, it only receives fresh snapshots from webhooks and
//! API fetches.

use serde::{Deserialize, Serialize};

use super::ids::{Branch, PrNumber};

/// The host's classification of a PR's mergeability.
///
/// This mirrors the host's merge state field; the bot treats it as the single
/// source of truth for what to do next with a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeableState {
    /// Mergeable and all required checks pass.
    Clean,

    /// Mergeable, but the base branch has advanced since the PR was updated.
    Behind,

    /// Mergeable, but required checks haven't all passed (failing or pending).
    Blocked,

    /// Mergeable, non-required checks failing.
    Unstable,

    /// Merge conflicts with the base branch.
    Dirty,

    /// The host has not yet computed mergeability. Re-fetch and re-check.
    Unknown,
}

impl MergeableState {
    /// Returns true once the host has computed a definite state.
    pub fn is_computed(&self) -> bool {
        !matches!(self, MergeableState::Unknown)
    }
}

/// An immutable snapshot of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// The PR number (stable identity).
    pub number: PrNumber,

    /// The head branch carrying the PR's commits.
    pub source: Branch,

    /// The base branch the PR is to be merged into.
    pub target: Branch,

    /// The PR author's login.
    pub author: String,

    /// The PR title.
    pub title: String,

    /// The labels currently attached to the PR.
    pub labels: Vec<String>,
}

impl PullRequest {
    /// Returns true if the PR carries the given label.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Returns true if the PR carries any of the given labels.
    pub fn has_any_label(&self, labels: &[String]) -> bool {
        labels.iter().any(|l| self.has_label(l))
    }
}

/// A pull request together with the host-side merge bookkeeping the queue
/// needs: whether it has already been merged, and its current mergeability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestMetadata {
    /// The PR snapshot.
    pub pull_request: PullRequest,

    /// Whether the PR has been merged on the host.
    pub is_merged: bool,

    /// The host's current mergeability classification.
    pub merge_state: MergeableState,
}

impl PullRequestMetadata {
    pub fn number(&self) -> PrNumber {
        self.pull_request.number
    }

    pub fn source(&self) -> &Branch {
        &self.pull_request.source
    }

    pub fn target(&self) -> &Branch {
        &self.pull_request.target
    }

    pub fn author(&self) -> &str {
        &self.pull_request.author
    }
}
