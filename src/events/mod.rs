//! External events consumed by the merge queue.
//!
//! The surrounding webhook layer translates host deliveries into two multicast
//! streams: pull request lifecycle events and commit status events. The
//! dispatcher consumes both and routes them to per-branch services; the
//! services additionally re-publish them internally for effect handlers that
//! wait on specific actions (e.g. a `synchronize` after a base update).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Branch, PullRequestMetadata};

/// Default capacity of the multicast event channels.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Action performed on a pull request, as reported by the host.
///
/// Only `Opened`, `Labeled`, `Unlabeled`, `Closed` and `Synchronize` are
/// significant to the queue; the remaining variants exist because the wire
/// carries them and the parser should not have to drop them on the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    /// PR was opened.
    Opened,
    /// A label was added.
    Labeled,
    /// A label was removed.
    Unlabeled,
    /// PR was closed (merged or not).
    Closed,
    /// PR head was updated (new commits pushed, or base merged in).
    Synchronize,
    /// PR title, body, or base branch was edited.
    Edited,
    /// PR was reopened.
    Reopened,
    /// PR was marked ready for review.
    ReadyForReview,
}

/// State of a single status check, and of aggregates of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Success,
    Failure,
}

impl CheckState {
    /// Aggregates a set of check states with combined-state semantics:
    /// any failure wins, else any pending, else success.
    ///
    /// An empty set aggregates to `Success`.
    pub fn combined(states: impl IntoIterator<Item = CheckState>) -> CheckState {
        let mut combined = CheckState::Success;
        for state in states {
            match state {
                CheckState::Failure => return CheckState::Failure,
                CheckState::Pending => combined = CheckState::Pending,
                CheckState::Success => {}
            }
        }
        combined
    }
}

/// A commit status event from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// The check context (e.g. `"ci/build"`).
    pub context: String,

    /// The reported state.
    pub state: CheckState,

    /// The commit the status applies to.
    pub sha: String,

    /// The branch the commit belongs to.
    pub branch: Branch,
}

impl StatusEvent {
    /// Returns true if this event was reported against the given branch.
    pub fn is_relative_to(&self, branch: &Branch) -> bool {
        &self.branch == branch
    }
}

/// A pull request lifecycle event: a fresh metadata snapshot plus the action
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestEvent {
    pub metadata: PullRequestMetadata,
    pub action: PullRequestAction,
}

/// The multicast event streams feeding the dispatcher.
///
/// Cloning shares the underlying channels: the webhook layer holds one clone
/// and publishes, the dispatcher holds another and subscribes. Publishing
/// with no live subscriber is not an error; the event is simply dropped.
#[derive(Debug, Clone)]
pub struct EventSources {
    pull_requests: broadcast::Sender<PullRequestEvent>,
    statuses: broadcast::Sender<StatusEvent>,
}

impl EventSources {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (pull_requests, _) = broadcast::channel(capacity);
        let (statuses, _) = broadcast::channel(capacity);
        EventSources {
            pull_requests,
            statuses,
        }
    }

    /// Publishes a pull request event to all subscribers.
    pub fn publish_pull_request(&self, metadata: PullRequestMetadata, action: PullRequestAction) {
        let _ = self
            .pull_requests
            .send(PullRequestEvent { metadata, action });
    }

    /// Publishes a status event to all subscribers.
    pub fn publish_status(&self, event: StatusEvent) {
        let _ = self.statuses.send(event);
    }

    pub fn subscribe_pull_requests(&self) -> broadcast::Receiver<PullRequestEvent> {
        self.pull_requests.subscribe()
    }

    pub fn subscribe_statuses(&self) -> broadcast::Receiver<StatusEvent> {
        self.statuses.subscribe()
    }
}

impl Default for EventSources {
    fn default() -> Self {
        Self::new()
    }
}
