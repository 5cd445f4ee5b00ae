//! Tunables for the chat controller and session registry.

use std::time::Duration;

/// Session shown when nothing else has been selected.
pub const DEFAULT_SESSION_KEY: &str = "agent:main:main";

/// Chat controller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// `limit` sent with `chat.history`.
    pub history_limit: u32,
    /// Estimated decoded size above which inline images and attachments
    /// are elided from display messages.
    pub elide_threshold: usize,
    /// Gateway frame limit assumed when `hello-ok` did not advertise one.
    pub default_max_payload: u64,
    /// Wait before refreshing sessions after a `/new` command.
    pub new_session_refresh_delay: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: 200,
            elide_threshold: 500 * 1024,
            default_max_payload: 1024 * 1024,
            new_session_refresh_delay: Duration::from_secs(1),
        }
    }
}

/// Session registry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Initially active session; always kept in the list.
    pub default_session_key: String,
    /// Quiet period after the last chat event before `sessions.list` is re-fetched.
    pub refresh_debounce: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_session_key: DEFAULT_SESSION_KEY.to_string(),
            refresh_debounce: Duration::from_millis(500),
        }
    }
}
