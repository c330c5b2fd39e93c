use std::time::Duration;

use distlock_common::config::DEFAULT_MAX_READERS;
use serde::{Deserialize, Serialize};

const CHANNEL_PREFIX: &str = "unlock-notify-channel-";

/// Channel a push-capable backend publishes to when `name` is released.
pub fn notify_channel(name: &str) -> String {
    format!("{CHANNEL_PREFIX}{{{name}}}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockArgs {
    pub name: String,
    pub token: String,
    pub lease: Duration,
    pub max_readers: u64,
    /// Whether the backend may park the caller until the name frees up
    /// instead of answering `HeldByOther` right away.
    pub blocking: bool,
}

impl LockArgs {
    pub fn new(name: impl Into<String>, token: impl Into<String>, lease: Duration) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            lease,
            max_readers: DEFAULT_MAX_READERS,
            blocking: false,
        }
    }

    pub fn with_max_readers(mut self, max_readers: u64) -> Self {
        self.max_readers = max_readers;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn channel(&self) -> String {
        notify_channel(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{LockArgs, notify_channel};

    #[test]
    fn channel_name_wraps_lock_name_in_braces() {
        assert_eq!(notify_channel("demo"), "unlock-notify-channel-{demo}");
        let args = LockArgs::new("orders/42", "t", Duration::from_secs(1));
        assert_eq!(args.channel(), "unlock-notify-channel-{orders/42}");
    }

    #[test]
    fn new_args_are_non_blocking() {
        let args = LockArgs::new("demo", "t", Duration::from_secs(1));
        assert!(!args.blocking);
        assert!(args.clone().blocking(true).blocking);
        assert_eq!(args.with_max_readers(4).max_readers, 4);
    }
}
