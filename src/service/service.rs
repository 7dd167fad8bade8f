//! The per-branch merge service: a mailbox task serializing reductions,
//! plus the effect handler lifecycle around it.
//!
//! Reductions are strictly serialized: events are folded into state one at a
//! time, in submission order, and every state change is published before the
//! next event is processed. Effect handlers run as separate tasks and feed
//! their outcomes back through the same mailbox.

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, trace, warn};

use crate::config::Config;
use crate::events::{PullRequestAction, PullRequestEvent, StatusEvent};
use crate::host::HostClient;
use crate::types::{Branch, PullRequestMetadata};

use super::effects::{self, EffectEnv};
use super::healthcheck::Healthcheck;
use super::reducer::{Event, classify, reduce};
use super::state::{FailureReason, MergeServiceState, QueueStatus, StateTransition};

/// Mailbox capacity for reducer events.
const MAILBOX_CAPACITY: usize = 64;

/// Capacity of the per-service broadcast channels (raw actions, statuses,
/// transitions).
const BROADCAST_CAPACITY: usize = 64;

/// Factor applied to the status check timeout to derive the healthcheck's
/// stall threshold.
const HEALTHCHECK_DELAY_FACTOR: f64 = 1.5;

/// Owns the merge queue and state machine for one target branch.
///
/// Created by the dispatcher; external code interacts with it by submitting
/// events and observing state.
#[derive(Debug)]
pub struct MergeService {
    target_branch: Branch,
    integration_label: String,
    events: mpsc::Sender<Event>,
    actions: broadcast::Sender<PullRequestEvent>,
    statuses: broadcast::Sender<StatusEvent>,
    state: watch::Receiver<MergeServiceState>,
    transitions: broadcast::Sender<StateTransition>,
    healthcheck: Healthcheck,
    cancel: CancellationToken,
}

impl MergeService {
    /// Spawns a merge service for a target branch.
    ///
    /// `initial` carries the labeled PRs discovered during the dispatcher's
    /// bootstrap; the service starts in `starting` to reorder them by prior
    /// acceptance. A service created lazily for a fresh event passes an
    /// empty list and starts `idle`.
    pub fn spawn<H: HostClient>(
        config: &Config,
        target_branch: Branch,
        initial: Vec<PullRequestMetadata>,
        host: H,
        cancel: CancellationToken,
    ) -> Self {
        let state = MergeServiceState::new(config, target_branch.clone(), !initial.is_empty());

        let (events_tx, events_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (actions_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (statuses_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (transitions_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (watch_tx, watch_rx) = watch::channel(state.clone());

        let healthcheck = Healthcheck::spawn(
            transitions_tx.subscribe(),
            config.status_checks_timeout.mul_f64(HEALTHCHECK_DELAY_FACTOR),
            cancel.child_token(),
        );

        info!(
            branch = %target_branch,
            initial = initial.len(),
            "Starting merge service"
        );

        let task = ServiceTask {
            state,
            events: events_rx,
            emit: events_tx.clone(),
            host,
            requires_all_status_checks: config.requires_all_status_checks,
            bot_user_id: config.bot_user_id,
            actions: actions_tx.clone(),
            statuses: statuses_tx.clone(),
            watch: watch_tx,
            transitions: transitions_tx.clone(),
            initial: Some(initial),
            current_effect: None,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        MergeService {
            target_branch,
            integration_label: config.integration_label.clone(),
            events: events_tx,
            actions: actions_tx,
            statuses: statuses_tx,
            state: watch_rx,
            transitions: transitions_tx,
            healthcheck,
            cancel,
        }
    }

    /// Submits a pull request change.
    ///
    /// The raw `(metadata, action)` pair is re-published to this service's
    /// action stream (effect handlers wait on specific actions there); the
    /// classified inclusion/exclusion effect, if any, is folded into the
    /// state machine.
    #[instrument(skip(self, metadata), fields(branch = %self.target_branch, pr = %metadata.number(), action = ?action))]
    pub async fn submit_pull_request_change(
        &self,
        metadata: PullRequestMetadata,
        action: PullRequestAction,
    ) {
        let _ = self.actions.send(PullRequestEvent {
            metadata: metadata.clone(),
            action,
        });

        match classify(&metadata, action, &self.integration_label) {
            Some(change) => {
                let _ = self.events.send(Event::PullRequestDidChange(change)).await;
            }
            None => trace!("Dropped pull request action"),
        }
    }

    /// Submits a status event for the status check wait.
    pub async fn submit_status_event(&self, event: StatusEvent) {
        let _ = self.statuses.send(event);
    }

    /// The current state.
    pub fn state(&self) -> MergeServiceState {
        self.state.borrow().clone()
    }

    /// A watch receiver for the current state.
    pub fn subscribe_state(&self) -> watch::Receiver<MergeServiceState> {
        self.state.clone()
    }

    /// A broadcast receiver of `(previous, current)` transitions.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// The liveness signal derived from this service's transitions.
    pub fn healthcheck(&self) -> &Healthcheck {
        &self.healthcheck
    }

    pub fn target_branch(&self) -> &Branch {
        &self.target_branch
    }

    /// Returns true if the given branch is the source of a PR this service
    /// currently tracks. The dispatcher uses this to route status events.
    pub fn owns_source_branch(&self, branch: &Branch) -> bool {
        self.state.borrow().owns_source(branch)
    }

    /// The token tearing down this service and all its effect handlers.
    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stops the service: interrupts pending effects and the mailbox loop.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Keyed projection of the state an effect handler was spawned for.
///
/// A handler is re-spawned only when this key changes: entering the same
/// status with identical inputs keeps the running handler.
#[derive(Debug, Clone, PartialEq)]
enum EffectKey {
    Starting,
    Idle,
    Ready(super::queue::PullRequestQueue),
    Integrating(PullRequestMetadata),
    RunningStatusChecks(PullRequestMetadata, std::time::Duration),
    IntegrationFailed(PullRequestMetadata, FailureReason),
}

fn effect_key(state: &MergeServiceState) -> EffectKey {
    match &state.status {
        QueueStatus::Starting => EffectKey::Starting,
        QueueStatus::Idle => EffectKey::Idle,
        QueueStatus::Ready => EffectKey::Ready(state.queue.clone()),
        QueueStatus::Integrating { metadata } => EffectKey::Integrating(metadata.clone()),
        QueueStatus::RunningStatusChecks { metadata } => {
            EffectKey::RunningStatusChecks(metadata.clone(), state.status_checks_timeout)
        }
        QueueStatus::IntegrationFailed { metadata, error } => {
            EffectKey::IntegrationFailed(metadata.clone(), *error)
        }
    }
}

/// A spawned effect handler and the key it was spawned for.
struct RunningEffect {
    key: EffectKey,
    cancel: CancellationToken,
}

/// The state-owning task behind a [`MergeService`].
struct ServiceTask<H> {
    state: MergeServiceState,
    events: mpsc::Receiver<Event>,
    emit: mpsc::Sender<Event>,
    host: H,
    requires_all_status_checks: bool,
    bot_user_id: Option<u64>,
    actions: broadcast::Sender<PullRequestEvent>,
    statuses: broadcast::Sender<StatusEvent>,
    watch: watch::Sender<MergeServiceState>,
    transitions: broadcast::Sender<StateTransition>,
    /// Bootstrap PRs, handed to the starting effect exactly once.
    initial: Option<Vec<PullRequestMetadata>>,
    current_effect: Option<RunningEffect>,
    cancel: CancellationToken,
}

impl<H: HostClient> ServiceTask<H> {
    async fn run(mut self) {
        // The initial status has its own effect (bootstrap for starting,
        // nothing for idle).
        self.sync_effects();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                }
            }
        }

        if let Some(effect) = self.current_effect.take() {
            effect.cancel.cancel();
        }
        info!(branch = %self.state.target_branch, "Merge service stopped");
    }

    /// Folds one event into the state, publishes the transition, and brings
    /// the effect handlers in line with the new state.
    fn handle(&mut self, event: Event) {
        trace!(branch = %self.state.target_branch, event = ?event, "Reducing event");

        let previous = self.state.clone();
        let current = reduce(previous.clone(), event);
        if current == previous {
            return;
        }

        self.state = current.clone();
        self.watch.send_replace(current.clone());
        let _ = self.transitions.send(StateTransition {
            previous: previous.clone(),
            current: current.clone(),
        });

        self.spawn_acceptance_comments(&previous, &current);
        self.sync_effects();
    }

    fn env(&self) -> EffectEnv<H> {
        EffectEnv {
            host: self.host.clone(),
            events: self.emit.clone(),
            requires_all_status_checks: self.requires_all_status_checks,
            bot_user_id: self.bot_user_id,
        }
    }

    /// Re-spawns the status-keyed effect handler if the key changed,
    /// cancelling the superseded one.
    fn sync_effects(&mut self) {
        let key = effect_key(&self.state);
        if self.current_effect.as_ref().is_some_and(|e| e.key == key) {
            return;
        }
        if let Some(previous) = self.current_effect.take() {
            previous.cancel.cancel();
        }

        let cancel = self.cancel.child_token();
        let env = self.env();

        match &self.state.status {
            QueueStatus::Starting => {
                let initial = self.initial.take().unwrap_or_default();
                spawn_cancellable(cancel.clone(), effects::bootstrap(env, initial));
            }
            QueueStatus::Idle => {}
            QueueStatus::Ready => {
                let head = self.state.queue.head().map(|pr| pr.number);
                spawn_cancellable(cancel.clone(), effects::fetch_head(env, head));
            }
            QueueStatus::Integrating { metadata } => {
                // Subscribing here (before the triggering submission
                // returns) guarantees the handler cannot miss an action
                // submitted after this state became observable.
                let actions = self.actions.subscribe();
                spawn_cancellable(
                    cancel.clone(),
                    effects::integrate(env, metadata.clone(), actions),
                );
            }
            QueueStatus::RunningStatusChecks { metadata } => {
                let statuses = self.statuses.subscribe();
                spawn_cancellable(
                    cancel.clone(),
                    effects::watch_status_checks(
                        env,
                        metadata.clone(),
                        self.state.status_checks_timeout,
                        statuses,
                    ),
                );
            }
            QueueStatus::IntegrationFailed { metadata, error } => {
                spawn_cancellable(
                    cancel.clone(),
                    effects::handle_integration_failure(
                        env,
                        metadata.clone(),
                        *error,
                        self.state.integration_label.clone(),
                    ),
                );
            }
        }

        self.current_effect = Some(RunningEffect { key, cancel });
    }

    /// Posts acceptance comments for PRs that entered the queue in this
    /// transition. Failures are logged and swallowed.
    fn spawn_acceptance_comments(
        &self,
        previous: &MergeServiceState,
        current: &MergeServiceState,
    ) {
        let comments = effects::acceptance_comments(previous, current);
        if comments.is_empty() {
            return;
        }

        let host = self.host.clone();
        spawn_cancellable(self.cancel.child_token(), async move {
            for (number, body) in comments {
                if let Err(err) = host.post_comment(number, &body).await {
                    warn!(pr = %number, error = %err, "Failed to post acceptance comment");
                }
            }
        });
    }
}

/// Runs a future on a fresh task until it completes or the token fires.
fn spawn_cancellable(
    cancel: CancellationToken,
    future: impl std::future::Future<Output = ()> + Send + 'static,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = future => {}
        }
    });
}
