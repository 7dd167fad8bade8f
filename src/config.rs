//! Configuration for the merge queue bot.
//!
//! In a production deployment these come from environment variables; tests
//! construct a `Config` directly and override what they need.

use std::time::Duration;

/// Configuration shared by the dispatcher and every merge service it creates.
#[derive(Debug, Clone)]
pub struct Config {
    /// Label that opts a PR into the merge queue.
    pub integration_label: String,

    /// Labels that push a PR into the top tier of its queue.
    pub top_priority_labels: Vec<String>,

    /// If true, every status check must pass before merging; if false, only
    /// the checks required by the target branch's protection rules.
    pub requires_all_status_checks: bool,

    /// How long to wait for status checks before giving up on a PR.
    pub status_checks_timeout: Duration,

    /// How long a merge service may sit idle before it is torn down.
    pub idle_merge_service_cleanup_delay: Duration,

    /// The bot's own user ID, used to recognize its historical comments
    /// during bootstrap. Optional: without it, any comment with the accepted
    /// prefix counts.
    pub bot_user_id: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            integration_label: "integrate".to_string(),
            top_priority_labels: Vec::new(),
            requires_all_status_checks: false,
            status_checks_timeout: Duration::from_secs(90 * 60),
            idle_merge_service_cleanup_delay: Duration::from_secs(5 * 60),
            bot_user_id: None,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let integration_label =
            std::env::var("INTEGRATION_LABEL").unwrap_or(defaults.integration_label);

        let top_priority_labels = std::env::var("TOP_PRIORITY_LABELS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or(defaults.top_priority_labels);

        let requires_all_status_checks = std::env::var("REQUIRES_ALL_STATUS_CHECKS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.requires_all_status_checks);

        let status_checks_timeout = std::env::var("STATUS_CHECKS_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.status_checks_timeout);

        let idle_merge_service_cleanup_delay = std::env::var("IDLE_CLEANUP_DELAY_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.idle_merge_service_cleanup_delay);

        let bot_user_id = std::env::var("BOT_USER_ID").ok().and_then(|s| s.parse().ok());

        Config {
            integration_label,
            top_priority_labels,
            requires_all_status_checks,
            status_checks_timeout,
            idle_merge_service_cleanup_delay,
            bot_user_id,
        }
    }

    /// Sets the integration label.
    pub fn with_integration_label(mut self, label: impl Into<String>) -> Self {
        self.integration_label = label.into();
        self
    }

    /// Sets the top priority labels.
    pub fn with_top_priority_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.top_priority_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the status checks timeout.
    pub fn with_status_checks_timeout(mut self, timeout: Duration) -> Self {
        self.status_checks_timeout = timeout;
        self
    }

    /// Sets the idle cleanup delay.
    pub fn with_idle_cleanup_delay(mut self, delay: Duration) -> Self {
        self.idle_merge_service_cleanup_delay = delay;
        self
    }
}
