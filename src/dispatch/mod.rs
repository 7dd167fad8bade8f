//! Event dispatch layer routing host events to per-branch merge services.
//!
//! The dispatcher consumes the pull request and status event streams,
//! creates merge services lazily (or from a bootstrap sweep of already
//! labeled PRs), and tears services down once they have sat idle for the
//! configured delay. Events for different target branches never share a
//! service: each branch's queue is serialized by its own service, and
//! branches proceed concurrently.
//!
//! Retirement goes through the routing loop: per-service watchers report
//! expired idle timers over an internal channel, and the loop destroys the
//! service only if it is still idle when the request is processed. An event
//! that raced the timer therefore wins, and the watcher simply re-arms on
//! the next idle transition.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::Config;
use crate::events::{EventSources, PullRequestEvent, StatusEvent};
use crate::host::{HostClient, HostError};
use crate::service::{MergeService, PullRequestChange, StateSnapshot, classify};
use crate::types::{Branch, PullRequestMetadata};

/// Capacity of the lifecycle broadcast channel.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the internal retirement channel.
const RETIRE_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications for the merge services behind the dispatcher.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A merge service was created for a branch.
    Created { target_branch: Branch },

    /// A merge service's state changed.
    StateChanged {
        target_branch: Branch,
        state: StateSnapshot,
    },

    /// A merge service was torn down.
    Destroyed { target_branch: Branch },
}

/// Creates, routes events to, and retires per-branch merge services.
pub struct DispatchService<H> {
    config: Config,
    host: H,
    sources: EventSources,
    services: RwLock<HashMap<Branch, Arc<MergeService>>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    retire_tx: mpsc::Sender<Branch>,
    retire_rx: Mutex<Option<mpsc::Receiver<Branch>>>,
    shutdown: CancellationToken,
}

impl<H: HostClient> DispatchService<H> {
    /// Creates a dispatcher consuming the given event sources.
    pub fn new(config: Config, host: H, sources: EventSources) -> Arc<Self> {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        let (retire_tx, retire_rx) = mpsc::channel(RETIRE_CHANNEL_CAPACITY);
        Arc::new(DispatchService {
            config,
            host,
            sources,
            services: RwLock::new(HashMap::new()),
            lifecycle,
            retire_tx,
            retire_rx: Mutex::new(Some(retire_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribes to merge service lifecycle notifications.
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Fetches all open PRs carrying the integration label and constructs a
    /// merge service per target branch, seeded with its group.
    ///
    /// Returns the number of services created.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<usize, HostError> {
        let labeled = self
            .host
            .fetch_open_pull_requests(&self.config.integration_label)
            .await?;

        let mut groups: HashMap<Branch, Vec<PullRequestMetadata>> = HashMap::new();
        for metadata in labeled {
            groups
                .entry(metadata.target().clone())
                .or_default()
                .push(metadata);
        }

        let count = groups.len();
        info!(services = count, "Bootstrapping merge services");
        for (branch, group) in groups {
            self.create_service(branch, group).await;
        }
        Ok(count)
    }

    /// Runs the routing loop until shutdown.
    pub async fn run(&self) {
        let mut pull_requests = self.sources.subscribe_pull_requests();
        let mut statuses = self.sources.subscribe_statuses();
        let mut retirements = match self.retire_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Dispatcher routing loop already running");
                return;
            }
        };

        info!("Dispatcher routing loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                received = pull_requests.recv() => match received {
                    Ok(event) => self.route_pull_request(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dispatcher lagged behind pull request events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                received = statuses.recv() => match received {
                    Ok(event) => self.route_status(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dispatcher lagged behind status events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                branch = retirements.recv() => match branch {
                    Some(branch) => self.retire_if_idle(&branch).await,
                    None => break,
                },
            }
        }
        info!("Dispatcher routing loop stopped");
    }

    /// Routes a pull request event to the service for its target branch,
    /// creating one if the event would include the PR in a queue.
    #[instrument(skip(self, event), fields(pr = %event.metadata.number(), branch = %event.metadata.target()))]
    async fn route_pull_request(&self, event: PullRequestEvent) {
        let branch = event.metadata.target().clone();

        let existing = self.services.read().await.get(&branch).cloned();
        let service = match existing {
            Some(service) => service,
            None => {
                let includes = matches!(
                    classify(&event.metadata, event.action, &self.config.integration_label),
                    Some(PullRequestChange::Include(_))
                );
                if !includes {
                    trace!("Dropped event for branch without a merge service");
                    return;
                }
                self.create_service(branch, Vec::new()).await
            }
        };

        service
            .submit_pull_request_change(event.metadata, event.action)
            .await;
    }

    /// Routes a status event to the service tracking a PR with the event's
    /// source branch. Dropped if no service owns that branch.
    async fn route_status(&self, event: StatusEvent) {
        let services = self.services.read().await;
        for service in services.values() {
            if service.owns_source_branch(&event.branch) {
                service.submit_status_event(event).await;
                return;
            }
        }
        trace!(branch = %event.branch, "Dropped status event without an owner");
    }

    /// Gets or creates the merge service for a branch.
    async fn create_service(
        &self,
        branch: Branch,
        initial: Vec<PullRequestMetadata>,
    ) -> Arc<MergeService> {
        let mut services = self.services.write().await;
        if let Some(existing) = services.get(&branch) {
            return existing.clone();
        }

        debug!(branch = %branch, initial = initial.len(), "Creating merge service");
        let service = Arc::new(MergeService::spawn(
            &self.config,
            branch.clone(),
            initial,
            self.host.clone(),
            self.shutdown.child_token(),
        ));
        services.insert(branch.clone(), service.clone());

        let _ = self.lifecycle.send(LifecycleEvent::Created {
            target_branch: branch.clone(),
        });
        self.spawn_service_watcher(branch, service.clone());
        service
    }

    /// Watches a service's transitions: forwards them as lifecycle events
    /// and requests retirement once the service has been idle for the
    /// cleanup delay. Any non-idle state before the timer fires cancels it.
    fn spawn_service_watcher(&self, branch: Branch, service: Arc<MergeService>) {
        let mut transitions = service.subscribe_transitions();
        let state = service.subscribe_state();
        let cancel = service.cancellation_token().clone();
        let lifecycle = self.lifecycle.clone();
        let retire = self.retire_tx.clone();
        let delay = self.config.idle_merge_service_cleanup_delay;

        tokio::spawn(async move {
            let mut idle_deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    _ = sleep_until(idle_deadline.unwrap_or_else(Instant::now)),
                        if idle_deadline.is_some() =>
                    {
                        debug!(branch = %branch, "Idle cleanup delay elapsed");
                        idle_deadline = None;
                        // The routing loop double-checks idleness; if an
                        // event won the race the watcher re-arms on the
                        // next idle transition.
                        let _ = retire.send(branch.clone()).await;
                    }

                    received = transitions.recv() => match received {
                        Ok(transition) => {
                            let _ = lifecycle.send(LifecycleEvent::StateChanged {
                                target_branch: branch.clone(),
                                state: transition.current.snapshot(),
                            });
                            idle_deadline = transition
                                .current
                                .status
                                .is_idle()
                                .then(|| Instant::now() + delay);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(branch = %branch, skipped, "Watcher lagged; resyncing from state");
                            idle_deadline = state
                                .borrow()
                                .status
                                .is_idle()
                                .then(|| Instant::now() + delay);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Destroys the service for a branch if it is still idle.
    async fn retire_if_idle(&self, branch: &Branch) {
        let still_idle = self
            .services
            .read()
            .await
            .get(branch)
            .is_some_and(|service| service.state().status.is_idle());
        if still_idle {
            self.destroy_service(branch).await;
        } else {
            debug!(branch = %branch, "Skipping retirement; service is busy again");
        }
    }

    /// Tears down the merge service for a branch: interrupts its pending
    /// effects and stops routing events to it.
    pub async fn destroy_service(&self, branch: &Branch) -> bool {
        let removed = self.services.write().await.remove(branch);
        match removed {
            Some(service) => {
                info!(branch = %branch, "Destroying merge service");
                service.shutdown();
                let _ = self.lifecycle.send(LifecycleEvent::Destroyed {
                    target_branch: branch.clone(),
                });
                true
            }
            None => false,
        }
    }

    /// Shuts down the dispatcher and every service it owns.
    pub async fn shutdown(&self) {
        info!("Shutting down dispatcher");
        self.shutdown.cancel();
        self.services.write().await.clear();
    }

    /// The number of live merge services.
    pub async fn service_count(&self) -> usize {
        self.services.read().await.len()
    }

    /// Returns true if a merge service exists for the branch.
    pub async fn has_service(&self, branch: &Branch) -> bool {
        self.services.read().await.contains_key(branch)
    }

    /// The merge service for a branch, if one exists.
    pub async fn service(&self, branch: &Branch) -> Option<Arc<MergeService>> {
        self.services.read().await.get(branch).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CheckState, PullRequestAction};
    use crate::service::QueueStatus;
    use crate::test_utils::{MockHost, meta, pr};
    use crate::types::{MergeableState, PrNumber};
    use std::time::Duration;

    fn test_config() -> Config {
        Config::default()
            .with_integration_label("merge")
            .with_idle_cleanup_delay(Duration::from_secs(120))
    }

    fn dispatcher(host: &MockHost) -> (Arc<DispatchService<MockHost>>, EventSources) {
        let sources = EventSources::with_capacity(64);
        let dispatch = DispatchService::new(test_config(), host.clone(), sources.clone());
        let routing = dispatch.clone();
        tokio::spawn(async move { routing.run().await });
        (dispatch, sources)
    }

    fn stalled(number: u64, target: &str) -> crate::types::PullRequestMetadata {
        meta(
            pr(number, &format!("feature-{number}"), target, &["merge"]),
            MergeableState::Unknown,
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    /// Polls the condition, sleeping between checks so paused time can
    /// advance through any timers the condition depends on.
    async fn wait_until(mut check: impl AsyncFnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3600), async {
            loop {
                if check().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test(start_paused = true)]
    async fn creates_service_on_first_include_event() {
        let host = MockHost::new();
        let (dispatch, sources) = dispatcher(&host);

        assert_eq!(dispatch.service_count().await, 0);

        host.set_pull_request(stalled(1, "main"));
        sources.publish_pull_request(stalled(1, "main"), PullRequestAction::Opened);

        wait_until(async || dispatch.has_service(&Branch::from("main")).await).await;
        assert_eq!(dispatch.service_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_irrelevant_events_for_unknown_branches() {
        let host = MockHost::new();
        let (dispatch, sources) = dispatcher(&host);

        // Unlabeled PR: classifies as exclude, not include; no service.
        sources.publish_pull_request(
            meta(pr(1, "feature-1", "main", &[]), MergeableState::Clean),
            PullRequestAction::Unlabeled,
        );
        // Synchronize: dropped entirely.
        sources.publish_pull_request(stalled(2, "main"), PullRequestAction::Synchronize);

        settle().await;
        assert_eq!(dispatch.service_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn routes_branches_to_separate_services() {
        let host = MockHost::new();
        let (dispatch, sources) = dispatcher(&host);

        host.set_pull_request(stalled(1, "main"));
        host.set_pull_request(stalled(2, "release/1.0"));
        sources.publish_pull_request(stalled(1, "main"), PullRequestAction::Opened);
        sources.publish_pull_request(stalled(2, "release/1.0"), PullRequestAction::Opened);

        wait_until(async || dispatch.service_count().await == 2).await;

        let main = dispatch.service(&Branch::from("main")).await.unwrap();
        let release = dispatch.service(&Branch::from("release/1.0")).await.unwrap();

        wait_until(async || matches!(main.state().status, QueueStatus::Integrating { .. })).await;

        // Each service only ever saw its own branch's PR.
        assert!(
            main.state()
                .status
                .metadata()
                .is_some_and(|m| m.number() == PrNumber(1))
        );
        wait_until(async || {
            release
                .state()
                .status
                .metadata()
                .is_some_and(|m| m.number() == PrNumber(2))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_groups_labeled_prs_by_target_branch() {
        let host = MockHost::new();
        host.set_open_pull_requests(vec![
            stalled(1, "main"),
            stalled(2, "main"),
            stalled(3, "release/1.0"),
            meta(pr(4, "feature-4", "main", &[]), MergeableState::Clean),
        ]);

        let sources = EventSources::with_capacity(64);
        let dispatch = DispatchService::new(test_config(), host.clone(), sources.clone());
        let created = dispatch.bootstrap().await.unwrap();

        assert_eq!(created, 2);
        assert!(dispatch.has_service(&Branch::from("main")).await);
        assert!(dispatch.has_service(&Branch::from("release/1.0")).await);

        // The main service was seeded with both labeled PRs.
        let main = dispatch.service(&Branch::from("main")).await.unwrap();
        wait_until(async || main.state().queue.len() == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_events_reach_the_owning_service() {
        let host = MockHost::new();
        let (dispatch, sources) = dispatcher(&host);

        // A blocked PR with a pending check parks in runningStatusChecks.
        let blocked = meta(
            pr(1, "feature-1", "main", &["merge"]),
            MergeableState::Blocked,
        );
        host.set_pull_request(blocked.clone());
        host.set_pull_request(meta(
            pr(1, "feature-1", "main", &["merge"]),
            MergeableState::Clean,
        ));
        host.set_status_checks(
            Branch::from("feature-1"),
            vec![crate::host::StatusCheck {
                context: "ci/build".to_string(),
                state: CheckState::Pending,
            }],
        );
        host.set_commit_status(
            Branch::from("feature-1"),
            crate::host::CommitStatus {
                state: CheckState::Success,
                statuses: vec![crate::host::StatusCheck {
                    context: "ci/build".to_string(),
                    state: CheckState::Success,
                }],
            },
        );

        sources.publish_pull_request(blocked, PullRequestAction::Opened);
        wait_until(async || {
            dispatch
                .service(&Branch::from("main"))
                .await
                .is_some_and(|s| matches!(s.state().status, QueueStatus::RunningStatusChecks { .. }))
        })
        .await;

        sources.publish_status(StatusEvent {
            context: "ci/build".to_string(),
            state: CheckState::Success,
            sha: "a".repeat(40),
            branch: Branch::from("feature-1"),
        });

        wait_until(async || {
            dispatch
                .service(&Branch::from("main"))
                .await
                .is_some_and(|s| s.state().status.is_idle())
        })
        .await;
        assert_eq!(host.merged_pull_requests(), vec![PrNumber(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn status_events_without_an_owner_are_dropped() {
        let host = MockHost::new();
        let (dispatch, sources) = dispatcher(&host);

        sources.publish_status(StatusEvent {
            context: "ci/build".to_string(),
            state: CheckState::Success,
            sha: "a".repeat(40),
            branch: Branch::from("nobody-owns-this"),
        });

        settle().await;
        assert_eq!(dispatch.service_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_service_is_destroyed_after_the_cleanup_delay() {
        let host = MockHost::new();
        let (dispatch, sources) = dispatcher(&host);
        let mut lifecycle = dispatch.lifecycle();

        // A clean PR integrates and the service goes idle.
        let clean = meta(
            pr(1, "feature-1", "main", &["merge"]),
            MergeableState::Clean,
        );
        host.set_pull_request(clean.clone());
        sources.publish_pull_request(clean, PullRequestAction::Opened);

        wait_until(async || {
            dispatch
                .service(&Branch::from("main"))
                .await
                .is_some_and(|s| s.state().status.is_idle())
        })
        .await;

        // The cleanup delay elapses with no further activity.
        tokio::time::sleep(Duration::from_secs(121)).await;
        wait_until(async || !dispatch.has_service(&Branch::from("main")).await).await;

        let mut saw_created = false;
        let mut saw_destroyed = false;
        while let Ok(event) = lifecycle.try_recv() {
            match event {
                LifecycleEvent::Created { target_branch } => {
                    saw_created = target_branch == Branch::from("main");
                }
                LifecycleEvent::Destroyed { target_branch } => {
                    saw_destroyed = target_branch == Branch::from("main");
                }
                LifecycleEvent::StateChanged { .. } => {}
            }
        }
        assert!(saw_created);
        assert!(saw_destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_cancels_the_idle_cleanup_timer() {
        let host = MockHost::new();
        let (dispatch, sources) = dispatcher(&host);

        let clean = meta(
            pr(1, "feature-1", "main", &["merge"]),
            MergeableState::Clean,
        );
        host.set_pull_request(clean.clone());
        sources.publish_pull_request(clean, PullRequestAction::Opened);
        wait_until(async || {
            dispatch
                .service(&Branch::from("main"))
                .await
                .is_some_and(|s| s.state().status.is_idle())
        })
        .await;

        // Halfway through the delay, new work arrives.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let busy = stalled(2, "main");
        host.set_pull_request(busy.clone());
        sources.publish_pull_request(busy, PullRequestAction::Opened);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(dispatch.has_service(&Branch::from("main")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn destroyed_service_no_longer_receives_events() {
        let host = MockHost::new();
        let (dispatch, sources) = dispatcher(&host);

        let clean = meta(
            pr(1, "feature-1", "main", &["merge"]),
            MergeableState::Clean,
        );
        host.set_pull_request(clean.clone());
        sources.publish_pull_request(clean, PullRequestAction::Opened);
        wait_until(async || dispatch.has_service(&Branch::from("main")).await).await;

        dispatch.destroy_service(&Branch::from("main")).await;
        assert!(!dispatch.has_service(&Branch::from("main")).await);

        // A fresh include event builds a fresh service.
        let other = stalled(2, "main");
        host.set_pull_request(other.clone());
        sources.publish_pull_request(other, PullRequestAction::Opened);
        wait_until(async || dispatch.has_service(&Branch::from("main")).await).await;
    }
}
