//! Core domain types for the merge queue bot.

pub mod ids;
pub mod pr;

pub use ids::{Branch, CommentId, PrNumber, RepoId};
pub use pr::{MergeableState, PullRequest, PullRequestMetadata};
