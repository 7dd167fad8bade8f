//! Merge Queue Bot - the core of a merge bot that serializes pull request
//! integration into protected branches.
//!
//! Humans label PRs with an integration label; the bot owns a queue per target
//! branch, updates each PR against its base, waits for status checks, and
//! merges PRs one at a time so every PR is tested against the exact tree it
//! lands on.
//!
//! The crate provides:
//! - [`service::MergeService`]: the per-target-branch queue and state machine
//! - [`dispatch::DispatchService`]: routes events to per-branch services and
//!   manages their lifecycle
//! - [`host::HostClient`]: the code-host API seam, with an octocrab-backed
//!   production implementation
//! - [`events::EventSources`]: the multicast event streams the surrounding
//!   webhook layer publishes into

#[cfg(test)]
pub mod test_utils;

pub mod config;
pub mod dispatch;
pub mod events;
pub mod host;
pub mod service;
pub mod types;
