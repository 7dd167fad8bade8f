//! Comment texts the bot posts, and the bootstrap ordering derived from them.
//!
//! The acceptance comment doubles as persistent state: after a restart, the
//! bootstrap re-derives each PR's original queue position from the timestamp
//! of the bot's latest acceptance comment on it.

use chrono::{DateTime, Utc};

use crate::host::IssueComment;
use crate::types::{Branch, PullRequestMetadata};

use super::state::FailureReason;

/// Prefix shared by every acceptance comment; bootstrap matches on it.
pub const ACCEPTED_PREFIX: &str = "Your pull request was accepted";

/// Prepended to acceptance comments re-posted during bootstrap.
pub const REBOOT_PREFIX: &str = "WallE just started after a reboot.\n";

/// Comment for a PR that landed at the front of an empty queue with nothing
/// being integrated.
pub fn accepted_right_away() -> String {
    format!("{} and will be handled right away.", ACCEPTED_PREFIX)
}

/// Comment for a PR accepted into a busy queue, telling it its arrival rank.
pub fn accepted_at_position(position: usize, target_branch: &Branch) -> String {
    format!(
        "{} and is currently #{} in the `{}` queue.",
        ACCEPTED_PREFIX, position, target_branch
    )
}

/// Comment posted to the author when an integration fails.
pub fn integration_failure(author: &str, reason: FailureReason) -> String {
    format!(
        "@{} unfortunately the integration failed with code: `{}`.",
        author, reason
    )
}

/// Finds the creation date of the latest acceptance comment among the given
/// comments, optionally filtered to the bot's own user ID.
pub fn latest_acceptance_date(
    comments: &[IssueComment],
    bot_user_id: Option<u64>,
) -> Option<DateTime<Utc>> {
    comments
        .iter()
        .filter(|c| c.body.contains(ACCEPTED_PREFIX))
        .filter(|c| bot_user_id.is_none_or(|id| c.author_id == id))
        .map(|c| c.created_at)
        .max()
}

/// Orders bootstrap PRs by their prior acceptance date, ascending. PRs the
/// bot has never accepted sort last (distant future), preserving their
/// relative order.
pub fn sort_by_acceptance(
    mut dated: Vec<(PullRequestMetadata, Option<DateTime<Utc>>)>,
) -> Vec<PullRequestMetadata> {
    dated.sort_by_key(|(_, date)| (date.is_none(), *date));
    dated.into_iter().map(|(metadata, _)| metadata).collect()
}
