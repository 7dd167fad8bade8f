//! Liveness signal derived from merge service state transitions.
//!
//! A service sitting in `ready`, `integrating`, or `runningStatusChecks`
//! longer than 1.5x the status check timeout without any state change is
//! suspected wedged. The suspicion is reported, not acted on: the service
//! keeps responding to events and recovers the `ok` status as soon as it
//! reaches `starting` or `idle` again.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::state::{MergeServiceState, QueueStatus, StateTransition};

/// Why a merge service is considered unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhealthyReason {
    /// No state change for longer than the expected worst-case check
    /// duration while an integration was supposedly making progress.
    PotentialDeadlock,
}

/// The derived liveness status of a merge service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Unhealthy(UnhealthyReason),
}

/// Watches a merge service's transitions and publishes a liveness status.
#[derive(Debug, Clone)]
pub struct Healthcheck {
    status: watch::Receiver<HealthStatus>,
}

impl Healthcheck {
    /// Spawns the watcher task.
    ///
    /// `delay` is the stall threshold (1.5x the status check timeout).
    /// Duplicate transitions (equal current state) are suppressed; each
    /// distinct non-idle state re-arms the stall timer, latest wins.
    pub(crate) fn spawn(
        mut transitions: broadcast::Receiver<StateTransition>,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(HealthStatus::Ok);

        tokio::spawn(async move {
            let mut last_seen: Option<MergeServiceState> = None;
            let mut stall_deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    _ = sleep_until(stall_deadline.unwrap_or_else(Instant::now)),
                        if stall_deadline.is_some() =>
                    {
                        warn!("No state transition before the stall threshold");
                        tx.send_replace(HealthStatus::Unhealthy(
                            UnhealthyReason::PotentialDeadlock,
                        ));
                        stall_deadline = None;
                    }

                    received = transitions.recv() => match received {
                        Ok(transition) => {
                            if last_seen.as_ref() == Some(&transition.current) {
                                continue;
                            }
                            last_seen = Some(transition.current.clone());

                            match transition.current.status {
                                QueueStatus::Starting | QueueStatus::Idle => {
                                    tx.send_replace(HealthStatus::Ok);
                                    stall_deadline = None;
                                }
                                _ => {
                                    stall_deadline = Some(Instant::now() + delay);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Healthcheck lagged behind state transitions");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Healthcheck { status: rx }
    }

    /// The current liveness status.
    pub fn status(&self) -> HealthStatus {
        *self.status.borrow()
    }

    /// A watch receiver for observing status changes.
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status.clone()
    }
}
