use std::{collections::HashMap, time::Duration};

use distlock_common::error::{DistlockError, Result};
use tokio::{sync::watch, time::Instant};

pub(crate) enum Grant {
    Granted,
    Held {
        remaining: Duration,
        /// Fires (closes) when the entry is deleted or replaced.
        released: watch::Receiver<()>,
    },
}

struct Lease {
    holder: String,
    expires_at: Instant,
    ref_count: u32,
    // Dropping the sender wakes everyone parked on this name.
    released: watch::Sender<()>,
}

impl Lease {
    fn new(holder: &str, expires_at: Instant) -> Self {
        let (released, _) = watch::channel(());
        Self {
            holder: holder.to_string(),
            expires_at,
            ref_count: 1,
            released,
        }
    }
}

/// Reference-counted lease table keyed by lock name.
#[derive(Default)]
pub(crate) struct LockTable {
    entries: HashMap<String, Lease>,
}

impl LockTable {
    pub(crate) fn grant(
        &mut self,
        name: &str,
        token: &str,
        lease: Duration,
        now: Instant,
    ) -> Grant {
        let expires_at = now + lease;

        match self.entries.get_mut(name) {
            None => {
                self.entries
                    .insert(name.to_string(), Lease::new(token, expires_at));
                Grant::Granted
            }
            Some(entry) if entry.expires_at <= now => {
                *entry = Lease::new(token, expires_at);
                Grant::Granted
            }
            Some(entry) if entry.holder == token => {
                entry.ref_count = entry.ref_count.saturating_add(1);
                entry.expires_at = entry.expires_at.max(expires_at);
                Grant::Granted
            }
            Some(entry) => Grant::Held {
                remaining: entry.expires_at.saturating_duration_since(now),
                released: entry.released.subscribe(),
            },
        }
    }

    pub(crate) fn release(&mut self, name: &str, token: &str, verify_token: bool) -> Result<()> {
        let Some(entry) = self.entries.get_mut(name) else {
            return Ok(());
        };

        if verify_token && entry.holder != token {
            return Err(DistlockError::NotHolder {
                name: name.to_string(),
            });
        }

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 {
            self.entries.remove(name);
        }

        Ok(())
    }

    pub(crate) fn renew(
        &mut self,
        name: &str,
        token: &str,
        lease: Duration,
        now: Instant,
        verify_token: bool,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };

        if entry.expires_at <= now || (verify_token && entry.holder != token) {
            return false;
        }

        entry.expires_at = now + lease;
        true
    }

    pub(crate) fn ref_count(&self, name: &str) -> Option<u32> {
        self.entries.get(name).map(|entry| entry.ref_count)
    }

    pub(crate) fn is_held(&self, name: &str, now: Instant) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.expires_at > now)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
