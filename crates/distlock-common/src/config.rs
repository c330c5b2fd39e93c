use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DistlockError, Result};

pub const DEFAULT_LEASE: Duration = Duration::from_secs(8);
pub const DEFAULT_DRIFT_FACTOR: f64 = 0.01;
pub const DEFAULT_MAX_READERS: u64 = 1 << 30;
pub const DEFAULT_MIN_WATCH_RETRY_INTERVAL: Duration = Duration::from_millis(1);
pub const DEFAULT_MAX_WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(16);
pub const DEFAULT_BUSY_JITTER: Duration = Duration::from_millis(1);
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(100);

/// Settings shared by the coordinator, the watch hub and every lock handle
/// built from one `Locker`.
///
/// Durations are expressed in milliseconds when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistlockConfig {
    #[serde(rename = "lease_ms", with = "millis")]
    pub lease: Duration,
    pub drift_factor: f64,
    /// Votes needed to grant; `None` means every backend.
    pub quorum: Option<usize>,
    pub max_readers: u64,
    #[serde(rename = "min_watch_retry_interval_ms", with = "millis")]
    pub min_watch_retry_interval: Duration,
    #[serde(rename = "max_watch_retry_interval_ms", with = "millis")]
    pub max_watch_retry_interval: Duration,
    #[serde(rename = "busy_jitter_ms", with = "millis")]
    pub busy_jitter: Duration,
    #[serde(rename = "retry_wait_ms", with = "millis")]
    pub retry_wait: Duration,
    /// Release grants made by a failed attempt instead of letting them expire.
    pub compensate_on_reject: bool,
    /// Read by backends at construction (e.g. `MemoryDriver::with_config`).
    /// The coordinator does not enforce it; a backend built without this
    /// config keeps its own setting.
    pub verify_holder_token: bool,
    pub auto_refresh: bool,
}

impl Default for DistlockConfig {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            drift_factor: DEFAULT_DRIFT_FACTOR,
            quorum: None,
            max_readers: DEFAULT_MAX_READERS,
            min_watch_retry_interval: DEFAULT_MIN_WATCH_RETRY_INTERVAL,
            max_watch_retry_interval: DEFAULT_MAX_WATCH_RETRY_INTERVAL,
            busy_jitter: DEFAULT_BUSY_JITTER,
            retry_wait: DEFAULT_RETRY_WAIT,
            compensate_on_reject: false,
            verify_holder_token: false,
            auto_refresh: false,
        }
    }
}

impl DistlockConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `DISTLOCK_*` keys resolved through `lookup`,
    /// falling back to defaults for missing or blank keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();

        if let Some(value) = get("DISTLOCK_LEASE_MS") {
            config.lease = parse_millis("DISTLOCK_LEASE_MS", &value)?;
        }
        if let Some(value) = get("DISTLOCK_DRIFT_FACTOR") {
            config.drift_factor = parse_value("DISTLOCK_DRIFT_FACTOR", &value)?;
        }
        if let Some(value) = get("DISTLOCK_QUORUM") {
            config.quorum = Some(parse_value("DISTLOCK_QUORUM", &value)?);
        }
        if let Some(value) = get("DISTLOCK_MAX_READERS") {
            config.max_readers = parse_value("DISTLOCK_MAX_READERS", &value)?;
        }
        if let Some(value) = get("DISTLOCK_MIN_WATCH_RETRY_MS") {
            config.min_watch_retry_interval =
                parse_millis("DISTLOCK_MIN_WATCH_RETRY_MS", &value)?;
        }
        if let Some(value) = get("DISTLOCK_MAX_WATCH_RETRY_MS") {
            config.max_watch_retry_interval =
                parse_millis("DISTLOCK_MAX_WATCH_RETRY_MS", &value)?;
        }
        if let Some(value) = get("DISTLOCK_BUSY_JITTER_MS") {
            config.busy_jitter = parse_millis("DISTLOCK_BUSY_JITTER_MS", &value)?;
        }
        if let Some(value) = get("DISTLOCK_RETRY_WAIT_MS") {
            config.retry_wait = parse_millis("DISTLOCK_RETRY_WAIT_MS", &value)?;
        }
        if let Some(value) = get("DISTLOCK_COMPENSATE_ON_REJECT") {
            config.compensate_on_reject = parse_value("DISTLOCK_COMPENSATE_ON_REJECT", &value)?;
        }
        if let Some(value) = get("DISTLOCK_VERIFY_HOLDER_TOKEN") {
            config.verify_holder_token = parse_value("DISTLOCK_VERIFY_HOLDER_TOKEN", &value)?;
        }
        if let Some(value) = get("DISTLOCK_AUTO_REFRESH") {
            config.auto_refresh = parse_value("DISTLOCK_AUTO_REFRESH", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_drift_factor(mut self, drift_factor: f64) -> Self {
        self.drift_factor = drift_factor;
        self
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = Some(quorum);
        self
    }

    pub fn with_watch_retry(mut self, min: Duration, max: Duration) -> Self {
        self.min_watch_retry_interval = min;
        self.max_watch_retry_interval = max;
        self
    }

    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    pub fn with_compensation(mut self, enabled: bool) -> Self {
        self.compensate_on_reject = enabled;
        self
    }

    pub fn with_token_verification(mut self, enabled: bool) -> Self {
        self.verify_holder_token = enabled;
        self
    }

    pub fn with_auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease.is_zero() {
            return Err(DistlockError::InvalidConfig(
                "lease must be greater than zero".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.drift_factor) {
            return Err(DistlockError::InvalidConfig(format!(
                "drift_factor must be in [0, 1), got {}",
                self.drift_factor
            )));
        }

        if self.quorum == Some(0) {
            return Err(DistlockError::InvalidConfig(
                "quorum must be at least 1".to_string(),
            ));
        }

        if self.max_readers == 0 {
            return Err(DistlockError::InvalidConfig(
                "max_readers must be at least 1".to_string(),
            ));
        }

        if self.min_watch_retry_interval > self.max_watch_retry_interval {
            return Err(DistlockError::InvalidConfig(format!(
                "min_watch_retry_interval ({:?}) exceeds max_watch_retry_interval ({:?})",
                self.min_watch_retry_interval, self.max_watch_retry_interval
            )));
        }

        Ok(())
    }

    /// Quorum for `total` backends, clamped to `1..=total`.
    pub fn effective_quorum(&self, total: usize) -> Result<usize> {
        if total == 0 {
            return Err(DistlockError::InvalidConfig(
                "at least one backend is required".to_string(),
            ));
        }

        match self.quorum {
            None => Ok(total),
            Some(quorum) if (1..=total).contains(&quorum) => Ok(quorum),
            Some(quorum) => Err(DistlockError::InvalidConfig(format!(
                "quorum {quorum} is out of range for {total} backends"
            ))),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| DistlockError::InvalidConfig(format!("{key}: cannot parse {value:?}")))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse_value::<u64>(key, value).map(Duration::from_millis)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
