use std::time::Duration;

use distlock_common::error::Result;
use tokio_util::sync::CancellationToken;

use super::{
    locker::LockKind,
    mutex::{HandleCore, LockOutcome},
};

/// Shared/exclusive lock on one name. Only built when every backend in the
/// quorum exposes the read/write capability.
pub struct DRWMutex {
    core: HandleCore,
}

impl DRWMutex {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self { core }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn token(&self) -> &str {
        self.core.token()
    }

    pub async fn try_rlock(&self) -> Result<LockOutcome> {
        self.core.try_acquire(LockKind::Read).await
    }

    pub async fn rlock(&self) -> Result<()> {
        self.core
            .acquire(LockKind::Read, &CancellationToken::new())
            .await
    }

    pub async fn rlock_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.core.acquire(LockKind::Read, cancel).await
    }

    pub async fn runlock(&self) -> Result<()> {
        self.core.release(LockKind::Read).await
    }

    pub async fn rtouch(&self) -> Result<bool> {
        self.core.renew(LockKind::Read).await
    }

    pub async fn try_wlock(&self) -> Result<LockOutcome> {
        self.core.try_acquire(LockKind::Write).await
    }

    pub async fn wlock(&self) -> Result<()> {
        self.core
            .acquire(LockKind::Write, &CancellationToken::new())
            .await
    }

    pub async fn wlock_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.core.acquire(LockKind::Write, cancel).await
    }

    pub async fn wunlock(&self) -> Result<()> {
        self.core.release(LockKind::Write).await
    }

    pub async fn wtouch(&self) -> Result<bool> {
        self.core.renew(LockKind::Write).await
    }

    pub fn read_held(&self) -> u32 {
        self.core.held(LockKind::Read)
    }

    pub fn write_held(&self) -> u32 {
        self.core.held(LockKind::Write)
    }

    pub fn read_validity(&self) -> Option<Duration> {
        self.core.validity(LockKind::Read)
    }

    pub fn write_validity(&self) -> Option<Duration> {
        self.core.validity(LockKind::Write)
    }
}
