//! Merge service state: the queue status variants, failure reasons, and the
//! full per-branch state the reducer folds events into.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::types::{Branch, PullRequestMetadata};

use super::queue::PullRequestQueue;

/// Why an integration was abandoned.
///
/// The variant name, rendered in camelCase, is the failure code quoted in the
/// comment posted back to the PR author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    /// The PR conflicts with its target branch.
    Conflicts,

    /// The host rejected the merge itself.
    MergeFailed,

    /// The source branch could not be brought up to date with the target.
    SynchronizationFailed,

    /// Status check state could not be determined because of host errors.
    CheckingCommitChecksFailed,

    /// One or more status checks failed.
    ChecksFailing,

    /// Status checks did not complete within the configured timeout.
    TimedOut,

    /// Checks passed but the host still reports the PR as blocked.
    Blocked,

    /// The host never computed the PR's mergeability.
    Unknown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            FailureReason::Conflicts => "conflicts",
            FailureReason::MergeFailed => "mergeFailed",
            FailureReason::SynchronizationFailed => "synchronizationFailed",
            FailureReason::CheckingCommitChecksFailed => "checkingCommitChecksFailed",
            FailureReason::ChecksFailing => "checksFailing",
            FailureReason::TimedOut => "timedOut",
            FailureReason::Blocked => "blocked",
            FailureReason::Unknown => "unknown",
        };
        write!(f, "{}", code)
    }
}

/// What the merge service is currently doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum QueueStatus {
    /// Bootstrap after a restart: historical PRs are being reordered by
    /// their prior acceptance timestamps.
    Starting,

    /// Queue empty, nothing to do.
    Idle,

    /// Queue non-empty, no integration in progress.
    Ready,

    /// Actively preparing a PR for merge.
    Integrating { metadata: PullRequestMetadata },

    /// Waiting for status checks on a PR.
    RunningStatusChecks { metadata: PullRequestMetadata },

    /// Terminal failure for a PR, about to be cleaned up.
    IntegrationFailed {
        metadata: PullRequestMetadata,
        error: FailureReason,
    },
}

impl QueueStatus {
    /// Returns true while a PR is being integrated (invariant: at most one).
    pub fn is_integration_in_progress(&self) -> bool {
        matches!(
            self,
            QueueStatus::Integrating { .. } | QueueStatus::RunningStatusChecks { .. }
        )
    }

    pub fn is_starting(&self) -> bool {
        matches!(self, QueueStatus::Starting)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, QueueStatus::Idle)
    }

    /// The PR this status refers to, if any.
    pub fn metadata(&self) -> Option<&PullRequestMetadata> {
        match self {
            QueueStatus::Integrating { metadata }
            | QueueStatus::RunningStatusChecks { metadata }
            | QueueStatus::IntegrationFailed { metadata, .. } => Some(metadata),
            _ => None,
        }
    }
}

/// The full state of one per-branch merge service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeServiceState {
    /// The branch this service integrates into.
    pub target_branch: Branch,

    /// The label that opts a PR into this queue.
    pub integration_label: String,

    /// Labels that promote a PR to the top tier of the queue.
    pub top_priority_labels: Vec<String>,

    /// How long to wait for status checks before giving up.
    pub status_checks_timeout: Duration,

    /// PRs waiting to be integrated, in integration order.
    pub queue: PullRequestQueue,

    /// What the service is currently doing.
    pub status: QueueStatus,
}

impl MergeServiceState {
    /// Creates the initial state for a branch.
    ///
    /// Services constructed with historical PRs start in `Starting` so those
    /// PRs can be reordered by prior acceptance; services created lazily for
    /// a fresh event have nothing to reorder and start `Idle`.
    pub fn new(config: &Config, target_branch: Branch, has_initial_pull_requests: bool) -> Self {
        MergeServiceState {
            target_branch,
            integration_label: config.integration_label.clone(),
            top_priority_labels: config.top_priority_labels.clone(),
            status_checks_timeout: config.status_checks_timeout,
            queue: PullRequestQueue::default(),
            status: if has_initial_pull_requests {
                QueueStatus::Starting
            } else {
                QueueStatus::Idle
            },
        }
    }

    /// Returns true if the given branch is the source of a PR this service
    /// currently tracks (queued or in-flight).
    pub fn owns_source(&self, branch: &Branch) -> bool {
        self.queue.iter().any(|pr| &pr.source == branch)
            || self
                .status
                .metadata()
                .is_some_and(|meta| meta.source() == branch)
    }

    /// The serializable projection of this state.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            target_branch: self.target_branch.clone(),
            status: self.status.clone(),
            queue: self.queue.clone(),
        }
    }
}

/// The serializable projection of a merge service's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub target_branch: Branch,
    pub status: QueueStatus,
    pub queue: PullRequestQueue,
}

/// A state change, published after every reduction that alters state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub previous: MergeServiceState,
    pub current: MergeServiceState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{meta, pr};
    use crate::types::MergeableState;

    fn state_with(status: QueueStatus) -> MergeServiceState {
        let mut state =
            MergeServiceState::new(&Config::default(), Branch::from("main"), false);
        state.status = status;
        state
    }

    #[test]
    fn status_serializes_as_tagged_object() {
        let json = serde_json::to_value(&QueueStatus::Idle).unwrap();
        assert_eq!(json, serde_json::json!({"status": "idle"}));

        let metadata = meta(pr(7, "feature", "main", &["integrate"]), MergeableState::Clean);
        let json = serde_json::to_value(&QueueStatus::RunningStatusChecks {
            metadata: metadata.clone(),
        })
        .unwrap();
        assert_eq!(json["status"], "runningStatusChecks");
        assert_eq!(json["metadata"]["pull_request"]["number"], 7);

        let json = serde_json::to_value(&QueueStatus::IntegrationFailed {
            metadata,
            error: FailureReason::ChecksFailing,
        })
        .unwrap();
        assert_eq!(json["status"], "integrationFailed");
        assert_eq!(json["error"], "checksFailing");
    }

    #[test]
    fn snapshot_serializes_expected_fields() {
        let state = state_with(QueueStatus::Ready);
        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["targetBranch"], "main");
        assert_eq!(json["status"]["status"], "ready");
        assert!(json["queue"].is_array());
    }

    #[test]
    fn failure_reason_codes() {
        assert_eq!(FailureReason::Conflicts.to_string(), "conflicts");
        assert_eq!(
            FailureReason::CheckingCommitChecksFailed.to_string(),
            "checkingCommitChecksFailed"
        );
        assert_eq!(FailureReason::TimedOut.to_string(), "timedOut");
    }

    #[test]
    fn integration_in_progress_only_for_active_statuses() {
        let metadata = meta(pr(1, "feature", "main", &[]), MergeableState::Clean);
        assert!(
            QueueStatus::Integrating {
                metadata: metadata.clone()
            }
            .is_integration_in_progress()
        );
        assert!(
            QueueStatus::RunningStatusChecks {
                metadata: metadata.clone()
            }
            .is_integration_in_progress()
        );
        assert!(
            !QueueStatus::IntegrationFailed {
                metadata,
                error: FailureReason::Unknown
            }
            .is_integration_in_progress()
        );
        assert!(!QueueStatus::Ready.is_integration_in_progress());
    }

    #[test]
    fn owns_source_covers_queue_and_in_flight() {
        let mut state = state_with(QueueStatus::Integrating {
            metadata: meta(pr(1, "in-flight", "main", &[]), MergeableState::Clean),
        });
        state
            .queue
            .insert(pr(2, "queued", "main", &["integrate"]), &[]);

        assert!(state.owns_source(&Branch::from("in-flight")));
        assert!(state.owns_source(&Branch::from("queued")));
        assert!(!state.owns_source(&Branch::from("elsewhere")));
    }
}
