//! The merge service state machine.
//!
//! [`reduce`] is a total, pure function from `(state, event)` to the next
//! state. Side effects never happen here; effect handlers observe the
//! resulting state and feed their outcomes back as further events. Any
//! event without a specific transition for the current status falls through
//! to the default reducer, which folds queue membership changes and ignores
//! everything else.

use crate::events::PullRequestAction;
use crate::types::PullRequestMetadata;

use super::state::{FailureReason, MergeServiceState, QueueStatus};

/// A PR-change event after classification: either the PR belongs in the
/// queue or it must leave it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestChange {
    Include(PullRequestMetadata),
    Exclude(PullRequestMetadata),
}

/// Progress report from an integration effect handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationTransition {
    /// The PR needs status checks before it can merge.
    Updating,

    /// The PR was merged (or found already merged).
    Done,

    /// The integration failed.
    Failed(FailureReason),
}

/// Outcome of waiting for status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChecksOutcome {
    Passed,
    Failed,
    TimedOut,
}

/// Events folded into the state machine.
///
/// External submissions arrive as `PullRequestDidChange`; everything else is
/// emitted by effect handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The queue is empty and there is nothing left to integrate.
    NoMorePullRequests,

    /// Bootstrap finished reordering the initial PRs.
    PullRequestsLoaded(Vec<PullRequestMetadata>),

    /// A labeled/unlabeled/opened/closed PR change, classified.
    PullRequestDidChange(PullRequestChange),

    /// Fresh metadata for the queue head; start integrating it.
    Integrate(PullRequestMetadata),

    /// Re-enter integration with refreshed metadata.
    RetryIntegration(PullRequestMetadata),

    /// The integration effect made progress.
    IntegrationDidChangeStatus(IntegrationTransition, PullRequestMetadata),

    /// The status check wait concluded.
    StatusChecksDidComplete(StatusChecksOutcome, PullRequestMetadata),

    /// Failure cleanup (comment + label removal) finished.
    IntegrationFailureHandled,
}

/// Classifies an external PR change into an inclusion/exclusion effect.
///
/// Returns `None` for actions the state machine does not react to
/// (`synchronize` is observed separately by the integration effect while
/// waiting for a base update to propagate).
pub fn classify(
    metadata: &PullRequestMetadata,
    action: PullRequestAction,
    integration_label: &str,
) -> Option<PullRequestChange> {
    let labeled = metadata.pull_request.has_label(integration_label);
    match action {
        PullRequestAction::Opened if labeled => {
            Some(PullRequestChange::Include(metadata.clone()))
        }
        PullRequestAction::Labeled if labeled && !metadata.is_merged => {
            Some(PullRequestChange::Include(metadata.clone()))
        }
        PullRequestAction::Unlabeled if !labeled => {
            Some(PullRequestChange::Exclude(metadata.clone()))
        }
        PullRequestAction::Closed => Some(PullRequestChange::Exclude(metadata.clone())),
        _ => None,
    }
}

/// Computes the next state for an event.
pub fn reduce(mut state: MergeServiceState, event: Event) -> MergeServiceState {
    let status = state.status.clone();
    match (status, event) {
        (QueueStatus::Starting, Event::PullRequestsLoaded(initial)) => {
            // The initial PRs arrive ordered by prior acceptance; folding
            // them through the queue applies the priority tiering on top.
            // Events that raced ahead of the bootstrap may already have
            // populated the queue, so merge rather than overwrite.
            let top = state.top_priority_labels.clone();
            for metadata in initial {
                state.queue.insert(metadata.pull_request, &top);
            }
            state.status = if state.queue.is_empty() {
                QueueStatus::Idle
            } else {
                QueueStatus::Ready
            };
            state
        }

        (QueueStatus::Idle, Event::PullRequestDidChange(PullRequestChange::Include(metadata))) => {
            let top = state.top_priority_labels.clone();
            state.queue.insert(metadata.pull_request, &top);
            state.status = QueueStatus::Ready;
            state
        }

        (QueueStatus::Ready, Event::NoMorePullRequests) => {
            // Guard against an include racing ahead of this event: idle
            // requires an empty queue.
            if state.queue.is_empty() {
                state.status = QueueStatus::Idle;
            }
            state
        }

        (QueueStatus::Ready, Event::Integrate(metadata)) => {
            state.queue.remove(metadata.number());
            state.status = QueueStatus::Integrating { metadata };
            state
        }

        (
            QueueStatus::Integrating { .. },
            Event::IntegrationDidChangeStatus(transition, metadata),
        ) => {
            state.status = match transition {
                IntegrationTransition::Done => QueueStatus::Ready,
                IntegrationTransition::Updating => QueueStatus::RunningStatusChecks { metadata },
                IntegrationTransition::Failed(error) => {
                    QueueStatus::IntegrationFailed { metadata, error }
                }
            };
            state
        }

        (QueueStatus::Integrating { .. }, Event::RetryIntegration(metadata)) => {
            state.status = QueueStatus::Integrating { metadata };
            state
        }

        (
            QueueStatus::Integrating { metadata },
            Event::PullRequestDidChange(PullRequestChange::Exclude(excluded)),
        ) if excluded.number() == metadata.number() => {
            state.status = QueueStatus::Ready;
            state
        }

        (
            QueueStatus::RunningStatusChecks { .. },
            Event::StatusChecksDidComplete(outcome, metadata),
        ) => {
            state.status = match outcome {
                StatusChecksOutcome::Passed => QueueStatus::Integrating { metadata },
                StatusChecksOutcome::Failed => QueueStatus::IntegrationFailed {
                    metadata,
                    error: FailureReason::ChecksFailing,
                },
                StatusChecksOutcome::TimedOut => QueueStatus::IntegrationFailed {
                    metadata,
                    error: FailureReason::TimedOut,
                },
            };
            state
        }

        (
            QueueStatus::RunningStatusChecks { metadata },
            Event::PullRequestDidChange(PullRequestChange::Exclude(excluded)),
        ) if excluded.number() == metadata.number() => {
            state.status = QueueStatus::Ready;
            state
        }

        (QueueStatus::IntegrationFailed { .. }, Event::IntegrationFailureHandled) => {
            state.status = QueueStatus::Ready;
            state
        }

        (_, event) => default_reduce(state, event),
    }
}

/// The default reducer: queue membership changes apply in any status, all
/// other unmatched events leave state untouched.
fn default_reduce(mut state: MergeServiceState, event: Event) -> MergeServiceState {
    match event {
        Event::PullRequestDidChange(PullRequestChange::Include(metadata)) => {
            // The PR being integrated was popped from the queue; re-inserting
            // it would let it be integrated twice.
            let in_flight = state.status.is_integration_in_progress()
                && state.status.metadata().map(PullRequestMetadata::number)
                    == Some(metadata.number());
            if !in_flight {
                let top = state.top_priority_labels.clone();
                state.queue.insert(metadata.pull_request, &top);
            }
            state
        }
        Event::PullRequestDidChange(PullRequestChange::Exclude(metadata)) => {
            state.queue.remove(metadata.number());
            state
        }
        _ => state,
    }
}
