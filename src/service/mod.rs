//! The per-target-branch merge service.
//!
//! # Architecture
//!
//! The service is a small event-sourced machine:
//!
//! - [`reducer::reduce`] is a pure, total function folding events into
//!   [`state::MergeServiceState`];
//! - effect handlers ([`effects`]) are tasks attached to states, spawned on
//!   entry and cancelled when the state's keyed projection changes; they
//!   perform host calls and emit further events;
//! - a mailbox task ([`service::MergeService`]) serializes reductions and
//!   publishes `(previous, current)` transitions;
//! - [`healthcheck::Healthcheck`] derives a liveness signal from those
//!   transitions.

mod comments;
mod effects;
mod healthcheck;
mod queue;
mod reducer;
mod service;
mod state;


pub use healthcheck::{HealthStatus, Healthcheck, UnhealthyReason};
pub use queue::PullRequestQueue;
pub use reducer::{
    Event, IntegrationTransition, PullRequestChange, StatusChecksOutcome, classify, reduce,
};
pub use service::MergeService;
pub use state::{FailureReason, MergeServiceState, QueueStatus, StateSnapshot, StateTransition};
