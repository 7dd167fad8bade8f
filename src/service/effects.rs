//! Effect handlers attached to merge service states.
//!
//! Each handler is a single task spawned when its state is entered and
//! cancelled when the state's keyed projection changes. Handlers never touch
//! service state directly: they perform host calls and feed their outcomes
//! back to the reducer through the event mailbox.
//!
//! Host failures here never crash the service. Depending on the path they
//! either make the handler emit nothing (the state machine re-drives on the
//! next event) or map to a classified failure reason.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use crate::events::{CheckState, PullRequestAction, PullRequestEvent, StatusEvent};
use crate::host::{BranchMergeOutcome, HostClient, HostError};
use crate::types::{MergeableState, PrNumber, PullRequestMetadata};

use super::comments;
use super::reducer::{Event, IntegrationTransition, StatusChecksOutcome};
use super::state::{FailureReason, MergeServiceState};

/// How long to wait for the host to report a `synchronize` action after a
/// base-branch update before declaring the synchronization failed.
pub(crate) const SYNCHRONIZE_TIMEOUT: Duration = Duration::from_secs(60);

/// Debounce window absorbing bursts of newly appearing status checks.
pub(crate) const STATUS_CHECKS_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// How often to re-fetch a PR whose mergeability the host has not computed.
pub(crate) const UNKNOWN_STATE_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// How many times to re-fetch before giving up on an unknown merge state.
pub(crate) const UNKNOWN_STATE_RETRIES: u32 = 4;

/// Everything an effect handler needs: the host client, the mailbox to emit
/// events into, and the check-related configuration.
pub(crate) struct EffectEnv<H> {
    pub host: H,
    pub events: mpsc::Sender<Event>,
    pub requires_all_status_checks: bool,
    pub bot_user_id: Option<u64>,
}

impl<H: Clone> Clone for EffectEnv<H> {
    fn clone(&self) -> Self {
        EffectEnv {
            host: self.host.clone(),
            events: self.events.clone(),
            requires_all_status_checks: self.requires_all_status_checks,
            bot_user_id: self.bot_user_id,
        }
    }
}

impl<H> EffectEnv<H> {
    /// Emits an event into the mailbox. A closed mailbox means the service
    /// is shutting down; the event is dropped.
    async fn emit(&self, event: Event) {
        let _ = self.events.send(event).await;
    }
}

// ─── Starting ─────────────────────────────────────────────────────────────────

/// Bootstrap effect: reorders the initial PRs by their prior acceptance
/// comment and reports them as loaded.
pub(crate) async fn bootstrap<H: HostClient>(
    env: EffectEnv<H>,
    initial: Vec<PullRequestMetadata>,
) {
    let mut dated = Vec::with_capacity(initial.len());
    for metadata in initial {
        let date = match env.host.fetch_issue_comments(metadata.number()).await {
            Ok(comments) => comments::latest_acceptance_date(&comments, env.bot_user_id),
            Err(err) => {
                warn!(pr = %metadata.number(), error = %err, "Failed to fetch comments during bootstrap");
                None
            }
        };
        dated.push((metadata, date));
    }

    env.emit(Event::PullRequestsLoaded(comments::sort_by_acceptance(dated)))
        .await;
}

// ─── Ready ────────────────────────────────────────────────────────────────────

/// Ready effect: re-fetches the queue head for fresh metadata and asks the
/// reducer to integrate it, or reports the queue empty.
pub(crate) async fn fetch_head<H: HostClient>(env: EffectEnv<H>, head: Option<PrNumber>) {
    match head {
        None => env.emit(Event::NoMorePullRequests).await,
        Some(number) => match env.host.fetch_pull_request(number).await {
            Ok(metadata) => env.emit(Event::Integrate(metadata)).await,
            Err(err) => {
                // Dropped on purpose: the next event to land re-enters ready
                // and retries the fetch.
                debug!(pr = %number, error = %err, "Failed to fetch queue head");
            }
        },
    }
}

// ─── Integrating ──────────────────────────────────────────────────────────────

/// Integration effect: drives one PR towards a merge based on its current
/// merge state.
pub(crate) async fn integrate<H: HostClient>(
    env: EffectEnv<H>,
    metadata: PullRequestMetadata,
    actions: broadcast::Receiver<PullRequestEvent>,
) {
    if metadata.is_merged {
        env.emit(Event::IntegrationDidChangeStatus(
            IntegrationTransition::Done,
            metadata,
        ))
        .await;
        return;
    }

    match metadata.merge_state {
        MergeableState::Clean => merge_and_finish(&env, metadata).await,
        MergeableState::Unstable if !env.requires_all_status_checks => {
            merge_and_finish(&env, metadata).await
        }
        MergeableState::Behind => synchronize_with_target(&env, metadata, actions).await,
        MergeableState::Blocked | MergeableState::Unstable => {
            evaluate_commit_checks(&env, metadata).await
        }
        MergeableState::Dirty => {
            emit_failure(&env, FailureReason::Conflicts, metadata).await;
        }
        MergeableState::Unknown => resolve_unknown_state(&env, metadata).await,
    }
}

async fn emit_failure<H>(env: &EffectEnv<H>, reason: FailureReason, metadata: PullRequestMetadata) {
    env.emit(Event::IntegrationDidChangeStatus(
        IntegrationTransition::Failed(reason),
        metadata,
    ))
    .await;
}

/// Merges the PR and cleans up its source branch. Branch deletion failures
/// are swallowed: the merge already happened.
async fn merge_and_finish<H: HostClient>(env: &EffectEnv<H>, metadata: PullRequestMetadata) {
    match env.host.merge_pull_request(metadata.number()).await {
        Ok(()) => {
            if let Err(err) = env.host.delete_branch(metadata.source()).await {
                warn!(
                    pr = %metadata.number(),
                    branch = %metadata.source(),
                    error = %err,
                    "Failed to delete source branch after merge"
                );
            }
            env.emit(Event::IntegrationDidChangeStatus(
                IntegrationTransition::Done,
                metadata,
            ))
            .await;
        }
        Err(err) => {
            warn!(pr = %metadata.number(), error = %err, "Merge failed");
            emit_failure(env, FailureReason::MergeFailed, metadata).await;
        }
    }
}

/// Brings a PR's source branch up to date with its target, then waits for
/// the host to report the resulting `synchronize` action before moving on to
/// status checks. The wait is bounded by [`SYNCHRONIZE_TIMEOUT`].
async fn synchronize_with_target<H: HostClient>(
    env: &EffectEnv<H>,
    metadata: PullRequestMetadata,
    mut actions: broadcast::Receiver<PullRequestEvent>,
) {
    match env
        .host
        .merge_into_branch(metadata.source(), metadata.target())
        .await
    {
        Ok(BranchMergeOutcome::Conflict) => {
            emit_failure(env, FailureReason::Conflicts, metadata).await;
        }
        Ok(BranchMergeOutcome::Success) | Ok(BranchMergeOutcome::UpToDate) => {
            let deadline = Instant::now() + SYNCHRONIZE_TIMEOUT;
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => {
                        emit_failure(env, FailureReason::SynchronizationFailed, metadata.clone()).await;
                        return;
                    }
                    received = actions.recv() => match received {
                        Ok(event)
                            if event.action == PullRequestAction::Synchronize
                                && event.metadata.source() == metadata.source() =>
                        {
                            env.emit(Event::IntegrationDidChangeStatus(
                                IntegrationTransition::Updating,
                                event.metadata,
                            ))
                            .await;
                            return;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Action stream lagged while waiting for synchronize");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
        Err(err) => {
            warn!(pr = %metadata.number(), error = %err, "Failed to update source branch");
            emit_failure(env, FailureReason::SynchronizationFailed, metadata).await;
        }
    }
}

/// Evaluates a blocked PR's checks: pending checks hand over to the status
/// check wait, a clean re-fetch retries the integration, anything else fails.
async fn evaluate_commit_checks<H: HostClient>(env: &EffectEnv<H>, metadata: PullRequestMetadata) {
    let checks = match env.host.fetch_all_status_checks(metadata.source()).await {
        Ok(checks) => checks,
        Err(err) => {
            warn!(pr = %metadata.number(), error = %err, "Failed to fetch status checks");
            emit_failure(env, FailureReason::CheckingCommitChecksFailed, metadata).await;
            return;
        }
    };

    if checks.iter().any(|check| check.state == CheckState::Pending) {
        env.emit(Event::IntegrationDidChangeStatus(
            IntegrationTransition::Updating,
            metadata,
        ))
        .await;
        return;
    }

    let status = match env.host.fetch_commit_status(metadata.source()).await {
        Ok(status) => status,
        Err(err) => {
            warn!(pr = %metadata.number(), error = %err, "Failed to fetch commit status");
            emit_failure(env, FailureReason::CheckingCommitChecksFailed, metadata).await;
            return;
        }
    };

    match status.state {
        CheckState::Pending => {
            env.emit(Event::IntegrationDidChangeStatus(
                IntegrationTransition::Updating,
                metadata,
            ))
            .await;
        }
        CheckState::Failure => {
            emit_failure(env, FailureReason::ChecksFailing, metadata).await;
        }
        CheckState::Success => match env.host.fetch_pull_request(metadata.number()).await {
            Ok(fresh) if fresh.merge_state == MergeableState::Clean => {
                env.emit(Event::RetryIntegration(fresh)).await;
            }
            Ok(fresh) => {
                emit_failure(env, FailureReason::Blocked, fresh).await;
            }
            Err(err) => {
                warn!(pr = %metadata.number(), error = %err, "Failed to re-fetch PR");
                emit_failure(env, FailureReason::CheckingCommitChecksFailed, metadata).await;
            }
        },
    }
}

/// Polls a PR whose mergeability the host has not computed yet. Gives up
/// after [`UNKNOWN_STATE_RETRIES`] attempts.
async fn resolve_unknown_state<H: HostClient>(env: &EffectEnv<H>, metadata: PullRequestMetadata) {
    for _ in 0..UNKNOWN_STATE_RETRIES {
        sleep(UNKNOWN_STATE_RETRY_INTERVAL).await;
        match env.host.fetch_pull_request(metadata.number()).await {
            Ok(fresh) if fresh.merge_state.is_computed() => {
                env.emit(Event::RetryIntegration(fresh)).await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(pr = %metadata.number(), error = %err, "Re-fetch failed while merge state unknown");
            }
        }
    }
    emit_failure(env, FailureReason::Unknown, metadata).await;
}

// ─── Running status checks ────────────────────────────────────────────────────

/// Status check wait: every completed check on the PR's source branch starts
/// a debounce window; once the window closes quietly, the PR and its commit
/// status are re-fetched and combined. The whole wait is bounded by the
/// service's status check timeout.
pub(crate) async fn watch_status_checks<H: HostClient>(
    env: EffectEnv<H>,
    metadata: PullRequestMetadata,
    timeout: Duration,
    mut statuses: broadcast::Receiver<StatusEvent>,
) {
    let deadline = Instant::now() + timeout;

    loop {
        // Wait for a completed check on our source branch.
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    env.emit(Event::StatusChecksDidComplete(
                        StatusChecksOutcome::TimedOut,
                        metadata.clone(),
                    ))
                    .await;
                    return;
                }
                received = statuses.recv() => match received {
                    Ok(event)
                        if event.state != CheckState::Pending
                            && event.is_relative_to(metadata.source()) =>
                    {
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Status stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }

        // Debounce: further completed checks extend the window.
        let mut grace_deadline = Instant::now() + STATUS_CHECKS_GRACE_PERIOD;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    env.emit(Event::StatusChecksDidComplete(
                        StatusChecksOutcome::TimedOut,
                        metadata.clone(),
                    ))
                    .await;
                    return;
                }
                _ = sleep_until(grace_deadline) => break,
                received = statuses.recv() => match received {
                    Ok(event)
                        if event.state != CheckState::Pending
                            && event.is_relative_to(metadata.source()) =>
                    {
                        grace_deadline = Instant::now() + STATUS_CHECKS_GRACE_PERIOD;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Status stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }

        match evaluate_checks(&env, &metadata).await {
            Ok((fresh, CheckState::Success)) => {
                env.emit(Event::StatusChecksDidComplete(
                    StatusChecksOutcome::Passed,
                    fresh,
                ))
                .await;
                return;
            }
            Ok((fresh, CheckState::Failure)) => {
                env.emit(Event::StatusChecksDidComplete(
                    StatusChecksOutcome::Failed,
                    fresh,
                ))
                .await;
                return;
            }
            Ok((_, CheckState::Pending)) => {
                // More checks are still running; keep waiting for events.
            }
            Err(err) => {
                // Transient: the next status event triggers re-evaluation.
                warn!(pr = %metadata.number(), error = %err, "Failed to evaluate status checks");
            }
        }
    }
}

/// Re-fetches the PR and its commit status and combines check states: the
/// host's aggregate when every check matters, otherwise the combined state
/// of the target branch's required contexts (missing contexts count as
/// pending).
async fn evaluate_checks<H: HostClient>(
    env: &EffectEnv<H>,
    metadata: &PullRequestMetadata,
) -> Result<(PullRequestMetadata, CheckState), HostError> {
    let fresh = env.host.fetch_pull_request(metadata.number()).await?;
    let status = env.host.fetch_commit_status(metadata.source()).await?;

    let state = if env.requires_all_status_checks {
        status.state
    } else {
        let required = env
            .host
            .fetch_required_status_checks(metadata.target())
            .await?;
        CheckState::combined(
            required
                .contexts
                .iter()
                .map(|context| status.state_for_context(context)),
        )
    };

    Ok((fresh, state))
}

// ─── Integration failed ───────────────────────────────────────────────────────

/// Failure cleanup: tell the author, drop the integration label, and move
/// on. Both side effects are best-effort; the machine progresses regardless.
pub(crate) async fn handle_integration_failure<H: HostClient>(
    env: EffectEnv<H>,
    metadata: PullRequestMetadata,
    reason: FailureReason,
    integration_label: String,
) {
    let body = comments::integration_failure(metadata.author(), reason);
    if let Err(err) = env.host.post_comment(metadata.number(), &body).await {
        warn!(pr = %metadata.number(), error = %err, "Failed to post failure comment");
    }
    if let Err(err) = env
        .host
        .remove_label(metadata.number(), &integration_label)
        .await
    {
        warn!(pr = %metadata.number(), error = %err, "Failed to remove integration label");
    }
    env.emit(Event::IntegrationFailureHandled).await;
}

// ─── Acceptance comments ──────────────────────────────────────────────────────

/// Computes the acceptance comments owed for a state transition: one per PR
/// that newly appeared in the queue, in queue order.
///
/// The reported position is the PR's arrival rank: PRs already queued plus
/// its rank within this transition's batch. A PR that lands alone at the
/// front of an empty queue with nothing integrating is promised immediate
/// handling instead. Transitions out of bootstrap prefix every comment with
/// the reboot notice, including for PRs the bot accepted before the restart.
pub(crate) fn acceptance_comments(
    previous: &MergeServiceState,
    current: &MergeServiceState,
) -> Vec<(PrNumber, String)> {
    let known: HashSet<PrNumber> = previous.queue.iter().map(|pr| pr.number).collect();
    let new: Vec<_> = current
        .queue
        .iter()
        .filter(|pr| !known.contains(&pr.number))
        .collect();
    if new.is_empty() {
        return Vec::new();
    }

    let already_queued = current.queue.len() - new.len();
    let from_bootstrap = previous.status.is_starting();

    new.iter()
        .enumerate()
        .map(|(rank, pr)| {
            let position = already_queued + rank + 1;
            let body = if position == 1 && !current.status.is_integration_in_progress() {
                comments::accepted_right_away()
            } else {
                comments::accepted_at_position(position, &current.target_branch)
            };
            let body = if from_bootstrap {
                format!("{}{}", comments::REBOOT_PREFIX, body)
            } else {
                body
            };
            (pr.number, body)
        })
        .collect()
}
