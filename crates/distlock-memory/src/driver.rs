use std::sync::{Mutex, MutexGuard, TryLockError};

use async_trait::async_trait;
use distlock_common::{config::DistlockConfig, error::Result, time};
use distlock_dsync::dsync::{Driver, LockArgs, Vote};
use tokio::time::timeout;
use tracing::debug;

use crate::table::{Grant, LockTable};

/// In-process backend: a lease table behind one mutex, with a per-name
/// release signal for callers that ask to block.
///
/// Exposes only the exclusive-lock capability; read/write and watch are not
/// available (`read_write()` and `watcher()` return `None`).
pub struct MemoryDriver {
    name: String,
    table: Mutex<LockTable>,
    verify_token: bool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            table: Mutex::new(LockTable::default()),
            verify_token: false,
        }
    }

    pub fn with_config(config: &DistlockConfig) -> Self {
        Self::new().with_token_verification(config.verify_holder_token)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// When enabled, unlock and touch from a token other than the holder's
    /// are refused.
    pub fn with_token_verification(mut self, enabled: bool) -> Self {
        self.verify_token = enabled;
        self
    }

    pub fn ref_count(&self, name: &str) -> Option<u32> {
        self.table().ref_count(name)
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.table().is_held(name, time::now())
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self, args: &LockArgs) -> Vote {
        loop {
            let (remaining, mut released) = {
                let mut table = match self.table.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::WouldBlock) => return Vote::Busy,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                };

                match table.grant(&args.name, &args.token, args.lease, time::now()) {
                    Grant::Granted => return Vote::Granted,
                    Grant::Held {
                        remaining,
                        released,
                    } => (remaining, released),
                }
            };

            if !args.blocking {
                return Vote::HeldByOther(remaining);
            }

            debug!(backend = %self.name, lock = %args.name, ?remaining, "waiting for release");
            // Either the holder let go or its lease ran out; re-check both ways.
            let _ = timeout(remaining, released.changed()).await;
        }
    }

    async fn unlock(&self, args: &LockArgs) -> Result<()> {
        self.table()
            .release(&args.name, &args.token, self.verify_token)
    }

    async fn touch(&self, args: &LockArgs) -> Result<bool> {
        Ok(self.table().renew(
            &args.name,
            &args.token,
            args.lease,
            time::now(),
            self.verify_token,
        ))
    }
}
