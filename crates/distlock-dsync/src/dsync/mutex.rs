use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use distlock_common::{
    config::DistlockConfig,
    error::{DistlockError, Result},
    time,
};
use tokio::{
    task::JoinHandle,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    client::{AcquireOutcome, Quorum},
    lock_args::LockArgs,
    locker::LockKind,
};
use crate::watch::{Subscription, WatchHub};

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Not granted; retry no earlier than `wait` unless woken.
    Rejected { wait: Duration },
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

#[derive(Default)]
struct Hold {
    count: u32,
    since: Option<Instant>,
    refresh: Option<JoinHandle<()>>,
}

type Holds = Arc<Mutex<HashMap<LockKind, Hold>>>;

fn holds_guard(holds: &Holds) -> MutexGuard<'_, HashMap<LockKind, Hold>> {
    match holds.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Retry loop and grant bookkeeping shared by [`DMutex`] and
/// [`super::rwmutex::DRWMutex`].
pub(crate) struct HandleCore {
    name: String,
    token: String,
    quorum: Arc<Quorum>,
    hub: WatchHub,
    config: DistlockConfig,
    holds: Holds,
}

impl HandleCore {
    pub(crate) fn new(
        name: String,
        quorum: Arc<Quorum>,
        hub: WatchHub,
        config: DistlockConfig,
    ) -> Self {
        Self {
            name,
            token: uuid::Uuid::new_v4().to_string(),
            quorum,
            hub,
            config,
            holds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    fn args(&self, blocking: bool) -> LockArgs {
        LockArgs::new(self.name.clone(), self.token.clone(), self.config.lease)
            .with_max_readers(self.config.max_readers)
            .blocking(blocking)
    }

    pub(crate) async fn try_acquire(&self, kind: LockKind) -> Result<LockOutcome> {
        let started = time::now();
        let outcome = self.quorum.acquire(kind, &self.args(false)).await?;
        Ok(self.settle(kind, outcome, started))
    }

    /// Retries until granted: wait for a release event or the wait hint,
    /// whichever comes first, then try again.
    pub(crate) async fn acquire(&self, kind: LockKind, cancel: &CancellationToken) -> Result<()> {
        let args = self.args(true);
        let mut subscription: Option<Subscription> = None;

        loop {
            let started = time::now();
            let outcome = self.quorum.acquire_with_cancel(kind, &args, cancel).await?;
            let wait = match self.settle(kind, outcome, started) {
                LockOutcome::Acquired => return Ok(()),
                LockOutcome::Rejected { wait } => wait,
            };

            match subscription.as_mut() {
                Some(subscription) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(DistlockError::Cancelled(self.name.clone()));
                        }
                        _ = subscription.recv() => {
                            debug!(lock = %self.name, kind = kind.as_str(), "woken by release");
                        }
                        _ = sleep(wait) => {
                            debug!(
                                lock = %self.name,
                                kind = kind.as_str(),
                                ?wait,
                                "wait hint elapsed"
                            );
                        }
                    }
                }
                None => {
                    // Subscribe before the next attempt so a release landing
                    // in between still wakes us.
                    subscription = Some(self.hub.subscribe(&self.name));
                }
            }
        }
    }

    pub(crate) async fn renew(&self, kind: LockKind) -> Result<bool> {
        let started = time::now();
        let renewed = self.quorum.renew(kind, &self.args(false)).await?;
        if renewed {
            if let Some(hold) = holds_guard(&self.holds).get_mut(&kind) {
                hold.since = Some(started);
            }
        }
        Ok(renewed)
    }

    /// Broadcasts the release whether or not this handle believes it holds
    /// the lock.
    pub(crate) async fn release(&self, kind: LockKind) -> Result<()> {
        {
            let mut holds = holds_guard(&self.holds);
            if let Some(hold) = holds.get_mut(&kind) {
                hold.count = hold.count.saturating_sub(1);
                if hold.count == 0 {
                    if let Some(task) = hold.refresh.take() {
                        task.abort();
                    }
                    holds.remove(&kind);
                }
            }
        }

        self.quorum.release(kind, &self.args(false)).await
    }

    pub(crate) fn held(&self, kind: LockKind) -> u32 {
        holds_guard(&self.holds)
            .get(&kind)
            .map(|hold| hold.count)
            .unwrap_or(0)
    }

    /// Time the lease can still be trusted, with the drift margin removed.
    /// Counted from the start of the attempt that granted or renewed it; no
    /// backend's lease began earlier than that.
    pub(crate) fn validity(&self, kind: LockKind) -> Option<Duration> {
        let since = holds_guard(&self.holds).get(&kind)?.since?;
        let trusted = time::drift_adjusted(self.config.lease, self.config.drift_factor);
        Some(trusted.saturating_sub(since.elapsed()))
    }

    fn settle(&self, kind: LockKind, outcome: AcquireOutcome, started: Instant) -> LockOutcome {
        if !outcome.succeeded {
            return LockOutcome::Rejected {
                wait: outcome.wait.unwrap_or(self.config.retry_wait),
            };
        }

        let mut holds = holds_guard(&self.holds);
        let hold = holds.entry(kind).or_default();
        hold.count = hold.count.saturating_add(1);
        hold.since = Some(started);
        if self.config.auto_refresh && hold.refresh.is_none() {
            hold.refresh = Some(self.spawn_refresh_task(kind, started));
        }

        LockOutcome::Acquired
    }

    fn spawn_refresh_task(&self, kind: LockKind, granted_at: Instant) -> JoinHandle<()> {
        let quorum = Arc::clone(&self.quorum);
        let holds = Arc::clone(&self.holds);
        let args = self.args(false);
        let interval = (time::drift_adjusted(self.config.lease, self.config.drift_factor) / 2)
            .max(MIN_REFRESH_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(granted_at + interval, interval);
            loop {
                ticker.tick().await;

                let started = time::now();
                match quorum.renew(kind, &args).await {
                    Ok(true) => {
                        if let Some(hold) = holds_guard(&holds).get_mut(&kind) {
                            hold.since = Some(started);
                        }
                    }
                    Ok(false) => {
                        warn!(lock = %args.name, kind = kind.as_str(), "lease refresh lost quorum");
                        if let Some(hold) = holds_guard(&holds).get_mut(&kind) {
                            hold.since = None;
                            hold.refresh = None;
                        }
                        break;
                    }
                    Err(err) => {
                        warn!(
                            lock = %args.name,
                            kind = kind.as_str(),
                            error = %err,
                            "lease refresh failed"
                        );
                        if let Some(hold) = holds_guard(&holds).get_mut(&kind) {
                            hold.since = None;
                            hold.refresh = None;
                        }
                        break;
                    }
                }
            }
        })
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        for hold in holds_guard(&self.holds).values_mut() {
            if let Some(task) = hold.refresh.take() {
                task.abort();
            }
        }
    }
}

/// Exclusive lock on one name across every configured backend.
pub struct DMutex {
    core: HandleCore,
}

impl DMutex {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self { core }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Holder token sent to every backend on behalf of this handle.
    pub fn token(&self) -> &str {
        self.core.token()
    }

    /// One attempt; never parks on a backend.
    pub async fn try_lock(&self) -> Result<LockOutcome> {
        self.core.try_acquire(LockKind::Exclusive).await
    }

    /// Blocks until granted. Wrap in a timeout or use
    /// [`DMutex::lock_with_cancel`] for bounded waiting.
    pub async fn lock(&self) -> Result<()> {
        self.core
            .acquire(LockKind::Exclusive, &CancellationToken::new())
            .await
    }

    pub async fn lock_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.core.acquire(LockKind::Exclusive, cancel).await
    }

    pub async fn unlock(&self) -> Result<()> {
        self.core.release(LockKind::Exclusive).await
    }

    pub async fn touch(&self) -> Result<bool> {
        self.core.renew(LockKind::Exclusive).await
    }

    /// Number of grants this handle holds (reentrant acquisitions count).
    pub fn held(&self) -> u32 {
        self.core.held(LockKind::Exclusive)
    }

    pub fn validity(&self) -> Option<Duration> {
        self.core.validity(LockKind::Exclusive)
    }
}
