//! The code-host API consumed by the merge queue.
//!
//! [`HostClient`] is the seam between the state machine and the outside
//! world: every side effect the queue performs goes through it. The
//! production implementation is [`OctocrabHost`]; tests substitute a mock.
//!
//! All operations are scoped to a single repository, so none of the methods
//! take an owner/repo pair.

mod client;
mod error;
mod retry;

pub use client::OctocrabHost;
pub use error::{HostError, HostErrorKind};
pub use retry::{RetryConfig, retry_with_backoff};

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::CheckState;
use crate::types::{Branch, CommentId, PrNumber, PullRequestMetadata};

/// An issue comment on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    /// The comment ID.
    pub id: CommentId,

    /// The author's user ID.
    pub author_id: u64,

    /// The comment body.
    pub body: String,

    /// When the comment was created.
    pub created_at: DateTime<Utc>,
}

/// A single status check reported against a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheck {
    /// The check context (e.g. `"ci/build"`).
    pub context: String,

    /// The check's current state.
    pub state: CheckState,
}

/// The host's combined status for the head of a branch: an aggregate state
/// plus the individual statuses it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    /// The host-computed aggregate state.
    pub state: CheckState,

    /// The individual check statuses.
    pub statuses: Vec<StatusCheck>,
}

impl CommitStatus {
    /// Returns the state of the check with the given context, or `Pending`
    /// if the host has not reported it at all.
    pub fn state_for_context(&self, context: &str) -> CheckState {
        self.statuses
            .iter()
            .find(|s| s.context == context)
            .map(|s| s.state)
            .unwrap_or(CheckState::Pending)
    }
}

/// The status check contexts a branch's protection rules require.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredStatusChecks {
    pub contexts: Vec<String>,
}

/// Outcome of merging one branch's head into another branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchMergeOutcome {
    /// A merge commit was created on the target of the operation.
    Success,

    /// Nothing to do: the branch already contains the head.
    UpToDate,

    /// The merge could not be performed because of conflicts.
    Conflict,
}

/// The code-host API.
///
/// Implementations must be cheap to clone (clones share the underlying HTTP
/// client) and safe for concurrent use: effect handlers for different
/// branches call into the same client in parallel.
pub trait HostClient: Clone + Send + Sync + 'static {
    /// Fetches a fresh snapshot of a pull request.
    fn fetch_pull_request(
        &self,
        number: PrNumber,
    ) -> impl Future<Output = Result<PullRequestMetadata, HostError>> + Send;

    /// Fetches all open pull requests carrying the given label.
    fn fetch_open_pull_requests(
        &self,
        label: &str,
    ) -> impl Future<Output = Result<Vec<PullRequestMetadata>, HostError>> + Send;

    /// Fetches all issue comments on a pull request, oldest first.
    fn fetch_issue_comments(
        &self,
        number: PrNumber,
    ) -> impl Future<Output = Result<Vec<IssueComment>, HostError>> + Send;

    /// Fetches every status check reported against the head of a branch.
    fn fetch_all_status_checks(
        &self,
        branch: &Branch,
    ) -> impl Future<Output = Result<Vec<StatusCheck>, HostError>> + Send;

    /// Fetches the combined commit status for the head of a branch.
    fn fetch_commit_status(
        &self,
        branch: &Branch,
    ) -> impl Future<Output = Result<CommitStatus, HostError>> + Send;

    /// Fetches the check contexts required by a branch's protection rules.
    fn fetch_required_status_checks(
        &self,
        branch: &Branch,
    ) -> impl Future<Output = Result<RequiredStatusChecks, HostError>> + Send;

    /// Posts a comment on a pull request.
    fn post_comment(
        &self,
        number: PrNumber,
        body: &str,
    ) -> impl Future<Output = Result<(), HostError>> + Send;

    /// Removes a label from a pull request.
    fn remove_label(
        &self,
        number: PrNumber,
        label: &str,
    ) -> impl Future<Output = Result<(), HostError>> + Send;

    /// Merges a pull request into its target branch.
    fn merge_pull_request(
        &self,
        number: PrNumber,
    ) -> impl Future<Output = Result<(), HostError>> + Send;

    /// Merges the head of `head` into `base` (used to bring a PR's source
    /// branch up to date with its target).
    fn merge_into_branch(
        &self,
        base: &Branch,
        head: &Branch,
    ) -> impl Future<Output = Result<BranchMergeOutcome, HostError>> + Send;

    /// Deletes a branch.
    fn delete_branch(
        &self,
        branch: &Branch,
    ) -> impl Future<Output = Result<(), HostError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    mod commit_status {
        use super::*;

        #[test]
        fn missing_context_defaults_to_pending() {
            let status = CommitStatus {
                state: CheckState::Success,
                statuses: vec![StatusCheck {
                    context: "ci/build".to_string(),
                    state: CheckState::Success,
                }],
            };
            assert_eq!(status.state_for_context("ci/build"), CheckState::Success);
            assert_eq!(status.state_for_context("ci/lint"), CheckState::Pending);
        }
    }
}
