use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use distlock_common::{
    config::DistlockConfig,
    error::{DistlockError, Result},
};
use futures::{
    StreamExt,
    stream::{self, FuturesUnordered},
};
use rand::Rng;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    lock_args::LockArgs,
    locker::{Driver, LockKind, ReleaseStream, RwDriver, Vote, Watcher},
};

pub const REFRESH_CALL_TIMEOUT: Duration = Duration::from_secs(5);
pub const UNLOCK_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AcquireOutcome {
    pub granted: Vec<bool>,
    pub votes: usize,
    pub quorum: usize,
    pub succeeded: bool,
    /// Set when the attempt was abandoned; grants made during it were released.
    pub cancelled: bool,
    /// Hint from the backend that reported the name as held, if any.
    pub wait: Option<Duration>,
}

impl AcquireOutcome {
    pub fn into_vote(self) -> Vote {
        if self.succeeded {
            return Vote::Granted;
        }

        match self.wait {
            Some(wait) => Vote::HeldByOther(wait),
            None => Vote::Error(DistlockError::Backend(format!(
                "quorum not reached ({}/{})",
                self.votes, self.quorum
            ))),
        }
    }
}

/// Turns per-backend votes into one grant decision.
///
/// Backends are visited in the order they were configured. By default every
/// backend must grant (full consensus).
#[derive(Clone)]
pub struct Quorum {
    name: String,
    lockers: Vec<Arc<dyn Driver>>,
    quorum: usize,
    busy_jitter: Duration,
    compensate_on_reject: bool,
}

impl Quorum {
    pub fn new(lockers: Vec<Arc<dyn Driver>>) -> Result<Self> {
        Self::with_config(lockers, &DistlockConfig::default())
    }

    pub fn with_config(lockers: Vec<Arc<dyn Driver>>, config: &DistlockConfig) -> Result<Self> {
        config.validate()?;
        let quorum = config.effective_quorum(lockers.len())?;

        Ok(Self {
            name: "quorum".to_string(),
            lockers,
            quorum,
            busy_jitter: config.busy_jitter,
            compensate_on_reject: config.compensate_on_reject,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn total_nodes(&self) -> usize {
        self.lockers.len()
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn lockers(&self) -> &[Arc<dyn Driver>] {
        &self.lockers
    }

    pub fn supports(&self, kind: LockKind) -> bool {
        self.ensure_supported(kind).is_ok()
    }

    pub async fn lock(&self, args: &LockArgs) -> AcquireOutcome {
        self.acquire_votes(LockKind::Exclusive, args, None).await
    }

    pub async fn rlock(&self, args: &LockArgs) -> Result<AcquireOutcome> {
        self.acquire(LockKind::Read, args).await
    }

    pub async fn wlock(&self, args: &LockArgs) -> Result<AcquireOutcome> {
        self.acquire(LockKind::Write, args).await
    }

    pub async fn acquire(&self, kind: LockKind, args: &LockArgs) -> Result<AcquireOutcome> {
        self.ensure_supported(kind)?;
        Ok(self.acquire_votes(kind, args, None).await)
    }

    /// Like [`Quorum::acquire`], but gives up when `cancel` fires. Backends
    /// that already granted during the abandoned attempt are released.
    pub async fn acquire_with_cancel(
        &self,
        kind: LockKind,
        args: &LockArgs,
        cancel: &CancellationToken,
    ) -> Result<AcquireOutcome> {
        self.ensure_supported(kind)?;
        let outcome = self.acquire_votes(kind, args, Some(cancel)).await;
        if outcome.cancelled {
            return Err(DistlockError::Cancelled(args.name.clone()));
        }
        Ok(outcome)
    }

    pub async fn touch(&self, args: &LockArgs) -> bool {
        self.renew_votes(LockKind::Exclusive, args).await
    }

    pub async fn rtouch(&self, args: &LockArgs) -> Result<bool> {
        self.renew(LockKind::Read, args).await
    }

    pub async fn wtouch(&self, args: &LockArgs) -> Result<bool> {
        self.renew(LockKind::Write, args).await
    }

    pub async fn renew(&self, kind: LockKind, args: &LockArgs) -> Result<bool> {
        self.ensure_supported(kind)?;
        Ok(self.renew_votes(kind, args).await)
    }

    pub async fn unlock(&self, args: &LockArgs) {
        self.broadcast_release(LockKind::Exclusive, args, None).await;
    }

    pub async fn runlock(&self, args: &LockArgs) -> Result<()> {
        self.release(LockKind::Read, args).await
    }

    pub async fn wunlock(&self, args: &LockArgs) -> Result<()> {
        self.release(LockKind::Write, args).await
    }

    pub async fn release(&self, kind: LockKind, args: &LockArgs) -> Result<()> {
        self.ensure_supported(kind)?;
        self.broadcast_release(kind, args, None).await;
        Ok(())
    }

    fn ensure_supported(&self, kind: LockKind) -> Result<()> {
        if kind == LockKind::Exclusive {
            return Ok(());
        }

        match self
            .lockers
            .iter()
            .find(|locker| locker.read_write().is_none())
        {
            Some(locker) => Err(DistlockError::unsupported(kind.as_str(), locker.name())),
            None => Ok(()),
        }
    }

    async fn acquire_votes(
        &self,
        kind: LockKind,
        args: &LockArgs,
        cancel: Option<&CancellationToken>,
    ) -> AcquireOutcome {
        let mut granted = vec![false; self.lockers.len()];
        let mut votes = 0usize;

        for (index, locker) in self.lockers.iter().enumerate() {
            loop {
                let ballot = vote(locker.as_ref(), kind, args);
                let Some(answer) = until_cancelled(cancel, ballot).await else {
                    return self.abandon(kind, args, granted).await;
                };

                match answer {
                    Vote::Busy => {
                        let pause = self.jitter();
                        debug!(
                            backend = locker.name(),
                            lock = %args.name,
                            ?pause,
                            "backend busy; retrying"
                        );
                        if until_cancelled(cancel, sleep(pause)).await.is_none() {
                            return self.abandon(kind, args, granted).await;
                        }
                        continue;
                    }
                    Vote::Granted => {
                        granted[index] = true;
                        votes = votes.saturating_add(1);
                        if votes >= self.quorum {
                            return self.outcome(granted, votes, true, None);
                        }
                    }
                    Vote::HeldByOther(wait) => {
                        debug!(
                            backend = locker.name(),
                            lock = %args.name,
                            kind = kind.as_str(),
                            ?wait,
                            "lock held elsewhere"
                        );
                        return self.reject(kind, args, granted, votes, Some(wait)).await;
                    }
                    Vote::Error(err) => {
                        warn!(
                            backend = locker.name(),
                            lock = %args.name,
                            kind = kind.as_str(),
                            error = %err,
                            "lock vote failed"
                        );
                    }
                }
                break;
            }
        }

        self.reject(kind, args, granted, votes, None).await
    }

    /// Failed attempt. With compensation on, grants made during it are
    /// released so the same token does not pile up references.
    async fn reject(
        &self,
        kind: LockKind,
        args: &LockArgs,
        mut granted: Vec<bool>,
        mut votes: usize,
        wait: Option<Duration>,
    ) -> AcquireOutcome {
        if self.compensate_on_reject && votes > 0 {
            self.broadcast_release(kind, args, Some(&granted)).await;
            granted.iter_mut().for_each(|value| *value = false);
            votes = 0;
        }
        self.outcome(granted, votes, false, wait)
    }

    async fn abandon(&self, kind: LockKind, args: &LockArgs, granted: Vec<bool>) -> AcquireOutcome {
        debug!(lock = %args.name, kind = kind.as_str(), "lock attempt cancelled");
        if granted.iter().any(|value| *value) {
            self.broadcast_release(kind, args, Some(&granted)).await;
        }

        let mut outcome = self.outcome(vec![false; granted.len()], 0, false, None);
        outcome.cancelled = true;
        outcome
    }

    async fn renew_votes(&self, kind: LockKind, args: &LockArgs) -> bool {
        let mut renewed = 0usize;

        for locker in &self.lockers {
            let call = renew_one(locker.as_ref(), kind, args);
            match bounded("touch", locker.as_ref(), REFRESH_CALL_TIMEOUT, call).await {
                Ok(true) => {
                    renewed = renewed.saturating_add(1);
                    if renewed >= self.quorum {
                        return true;
                    }
                }
                Ok(false) => {
                    debug!(
                        backend = locker.name(),
                        lock = %args.name,
                        kind = kind.as_str(),
                        "touch refused"
                    );
                }
                Err(err) => {
                    warn!(
                        backend = locker.name(),
                        lock = %args.name,
                        kind = kind.as_str(),
                        error = %err,
                        "touch failed"
                    );
                }
            }
        }

        false
    }

    /// Sends the release to every backend, or only to those flagged in `only`.
    async fn broadcast_release(&self, kind: LockKind, args: &LockArgs, only: Option<&[bool]>) {
        let mut pending = FuturesUnordered::new();

        for (index, locker) in self.lockers.iter().enumerate() {
            if let Some(only) = only {
                if !only.get(index).copied().unwrap_or(false) {
                    continue;
                }
            }

            pending.push(async move {
                let call = release_one(locker.as_ref(), kind, args);
                let released = bounded("unlock", locker.as_ref(), UNLOCK_CALL_TIMEOUT, call).await;
                if let Err(err) = released {
                    warn!(
                        backend = locker.name(),
                        lock = %args.name,
                        kind = kind.as_str(),
                        error = %err,
                        "unlock failed"
                    );
                }
            });
        }

        while pending.next().await.is_some() {}
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.busy_jitter.as_nanos()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::rng().random_range(0..max))
    }

    fn outcome(
        &self,
        granted: Vec<bool>,
        votes: usize,
        succeeded: bool,
        wait: Option<Duration>,
    ) -> AcquireOutcome {
        AcquireOutcome {
            granted,
            votes,
            quorum: self.quorum,
            succeeded,
            cancelled: false,
            wait,
        }
    }
}

async fn until_cancelled<F: Future>(
    cancel: Option<&CancellationToken>,
    future: F,
) -> Option<F::Output> {
    match cancel {
        Some(cancel) => tokio::select! {
            _ = cancel.cancelled() => None,
            output = future => Some(output),
        },
        None => Some(future.await),
    }
}

async fn bounded<T>(
    op: &'static str,
    locker: &dyn Driver,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    timeout(limit, call).await.unwrap_or_else(|_| {
        Err(DistlockError::Timeout {
            op,
            backend: locker.name().to_string(),
        })
    })
}

async fn vote(locker: &dyn Driver, kind: LockKind, args: &LockArgs) -> Vote {
    match (kind, locker.read_write()) {
        (LockKind::Exclusive, _) => locker.lock(args).await,
        (LockKind::Read, Some(rw)) => rw.rlock(args).await,
        (LockKind::Write, Some(rw)) => rw.wlock(args).await,
        (_, None) => Vote::Error(DistlockError::unsupported(kind.as_str(), locker.name())),
    }
}

async fn renew_one(locker: &dyn Driver, kind: LockKind, args: &LockArgs) -> Result<bool> {
    match (kind, locker.read_write()) {
        (LockKind::Exclusive, _) => locker.touch(args).await,
        (LockKind::Read, Some(rw)) => rw.rtouch(args).await,
        (LockKind::Write, Some(rw)) => rw.wtouch(args).await,
        (_, None) => Err(DistlockError::unsupported("touch", locker.name())),
    }
}

async fn release_one(locker: &dyn Driver, kind: LockKind, args: &LockArgs) -> Result<()> {
    match (kind, locker.read_write()) {
        (LockKind::Exclusive, _) => locker.unlock(args).await,
        (LockKind::Read, Some(rw)) => rw.runlock(args).await,
        (LockKind::Write, Some(rw)) => rw.wunlock(args).await,
        (_, None) => Err(DistlockError::unsupported("unlock", locker.name())),
    }
}

// A quorum can itself be a voting backend inside a larger quorum.
#[async_trait]
impl Driver for Quorum {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self, args: &LockArgs) -> Vote {
        self.acquire_votes(LockKind::Exclusive, args, None)
            .await
            .into_vote()
    }

    async fn unlock(&self, args: &LockArgs) -> Result<()> {
        self.broadcast_release(LockKind::Exclusive, args, None).await;
        Ok(())
    }

    async fn touch(&self, args: &LockArgs) -> Result<bool> {
        Ok(self.renew_votes(LockKind::Exclusive, args).await)
    }

    fn read_write(&self) -> Option<&dyn RwDriver> {
        if self
            .lockers
            .iter()
            .all(|locker| locker.read_write().is_some())
        {
            Some(self)
        } else {
            None
        }
    }

    fn watcher(&self) -> Option<&dyn Watcher> {
        if self
            .lockers
            .iter()
            .any(|locker| locker.watcher().is_some())
        {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl RwDriver for Quorum {
    async fn rlock(&self, args: &LockArgs) -> Vote {
        self.acquire_votes(LockKind::Read, args, None).await.into_vote()
    }

    async fn runlock(&self, args: &LockArgs) -> Result<()> {
        self.release(LockKind::Read, args).await
    }

    async fn rtouch(&self, args: &LockArgs) -> Result<bool> {
        self.renew(LockKind::Read, args).await
    }

    async fn wlock(&self, args: &LockArgs) -> Vote {
        self.acquire_votes(LockKind::Write, args, None).await.into_vote()
    }

    async fn wunlock(&self, args: &LockArgs) -> Result<()> {
        self.release(LockKind::Write, args).await
    }

    async fn wtouch(&self, args: &LockArgs) -> Result<bool> {
        self.renew(LockKind::Write, args).await
    }
}

#[async_trait]
impl Watcher for Quorum {
    async fn listen(&self, channel: &str) -> Result<ReleaseStream> {
        let mut streams = Vec::new();

        for locker in &self.lockers {
            let Some(watcher) = locker.watcher() else {
                continue;
            };

            match watcher.listen(channel).await {
                Ok(stream) => streams.push(stream),
                Err(err) => {
                    warn!(
                        backend = locker.name(),
                        channel,
                        error = %err,
                        "replica listener failed"
                    );
                }
            }
        }

        if streams.is_empty() {
            return Err(DistlockError::Watch {
                channel: channel.to_string(),
                reason: format!("no replica of {} is listening", self.name),
            });
        }

        Ok(stream::select_all(streams).boxed())
    }
}
