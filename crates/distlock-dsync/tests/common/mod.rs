#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use distlock_dsync::{
    DistlockError, Driver, LockArgs, ReleaseStream, Result, RwDriver, Vote, Watcher,
    notify_channel,
};
use futures::StreamExt;
use tokio::{sync::broadcast, time::Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy)]
pub enum Script {
    Granted,
    Busy,
    Held(Duration),
    Error,
}

impl Script {
    fn vote(self, backend: &str) -> Vote {
        match self {
            Self::Granted => Vote::Granted,
            Self::Busy => Vote::Busy,
            Self::Held(wait) => Vote::HeldByOther(wait),
            Self::Error => Vote::Error(DistlockError::Backend(format!("{backend} exploded"))),
        }
    }
}

/// Backend that answers lock calls from a script and records every call.
pub struct ScriptedDriver {
    name: String,
    votes: Mutex<VecDeque<Script>>,
    fallback: Script,
    touch: Mutex<VecDeque<Option<bool>>>,
    fail_unlock: bool,
    pub lock_calls: AtomicUsize,
    pub unlock_calls: AtomicUsize,
    pub touch_calls: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            votes: Mutex::new(VecDeque::new()),
            fallback: Script::Granted,
            touch: Mutex::new(VecDeque::new()),
            fail_unlock: false,
            lock_calls: AtomicUsize::new(0),
            unlock_calls: AtomicUsize::new(0),
            touch_calls: AtomicUsize::new(0),
        }
    }

    /// Votes returned in order; `fallback` once exhausted.
    pub fn votes(self, script: &[Script]) -> Self {
        *self.votes.lock().unwrap() = script.iter().copied().collect();
        self
    }

    pub fn fallback(mut self, fallback: Script) -> Self {
        self.fallback = fallback;
        self
    }

    /// Touch answers in order: `Some(ok)` or `None` for an error.
    pub fn touches(self, script: &[Option<bool>]) -> Self {
        *self.touch.lock().unwrap() = script.iter().copied().collect();
        self
    }

    pub fn failing_unlock(mut self) -> Self {
        self.fail_unlock = true;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn locks(&self) -> usize {
        self.lock_calls.load(Ordering::SeqCst)
    }

    pub fn unlocks(&self) -> usize {
        self.unlock_calls.load(Ordering::SeqCst)
    }

    pub fn touches_seen(&self) -> usize {
        self.touch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self, _args: &LockArgs) -> Vote {
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.votes.lock().unwrap().pop_front().unwrap_or(self.fallback);
        next.vote(&self.name)
    }

    async fn unlock(&self, _args: &LockArgs) -> Result<()> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unlock {
            return Err(DistlockError::BackendUnavailable(self.name.clone()));
        }
        Ok(())
    }

    async fn touch(&self, _args: &LockArgs) -> Result<bool> {
        self.touch_calls.fetch_add(1, Ordering::SeqCst);
        match self.touch.lock().unwrap().pop_front().unwrap_or(Some(true)) {
            Some(ok) => Ok(ok),
            None => Err(DistlockError::Backend(format!("{} touch failed", self.name))),
        }
    }
}

#[derive(Default)]
struct RwState {
    writer: Option<String>,
    readers: HashMap<String, u64>,
    expires_at: Option<Instant>,
}

impl RwState {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at > now)
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.expires_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn reader_count(&self) -> u64 {
        self.readers.values().sum()
    }
}

/// Non-blocking backend with exclusive, read/write and push capabilities.
pub struct PushBackend {
    name: String,
    state: Mutex<HashMap<String, RwState>>,
    events: broadcast::Sender<String>,
    listen_failures: AtomicUsize,
    pub listens: AtomicUsize,
    active_listeners: Arc<AtomicUsize>,
}

impl PushBackend {
    pub fn new(name: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            name: name.to_string(),
            state: Mutex::new(HashMap::new()),
            events,
            listen_failures: AtomicUsize::new(0),
            listens: AtomicUsize::new(0),
            active_listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The next `count` listen attempts fail.
    pub fn failing_listens(self, count: usize) -> Self {
        self.listen_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn publish(&self, name: &str) {
        let _ = self.events.send(notify_channel(name));
    }

    pub fn listen_attempts(&self) -> usize {
        self.listens.load(Ordering::SeqCst)
    }

    pub fn active_listeners(&self) -> usize {
        self.active_listeners.load(Ordering::SeqCst)
    }

    fn with_state<T>(&self, name: &str, f: impl FnOnce(&mut RwState, Instant) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(name.to_string()).or_default();
        let now = Instant::now();
        if !entry.live(now) {
            *entry = RwState::default();
        }
        f(entry, now)
    }

    fn exclusive(&self, args: &LockArgs) -> Vote {
        self.with_state(&args.name, |state, now| {
            let foreign_writer = state.writer.as_deref().is_some_and(|w| w != args.token);
            let foreign_readers = state.readers.keys().any(|r| *r != args.token);
            if foreign_writer || foreign_readers {
                return Vote::HeldByOther(state.remaining(now));
            }
            state.writer = Some(args.token.clone());
            state.expires_at = Some(now + args.lease);
            Vote::Granted
        })
    }

    fn shared(&self, args: &LockArgs) -> Vote {
        self.with_state(&args.name, |state, now| {
            if state.writer.as_deref().is_some_and(|w| w != args.token) {
                return Vote::HeldByOther(state.remaining(now));
            }
            if state.reader_count() >= args.max_readers {
                return Vote::HeldByOther(state.remaining(now));
            }
            *state.readers.entry(args.token.clone()).or_default() += 1;
            let until = now + args.lease;
            state.expires_at = Some(state.expires_at.map_or(until, |at| at.max(until)));
            Vote::Granted
        })
    }

    fn release_writer(&self, args: &LockArgs) {
        if let Some(state) = self.state.lock().unwrap().get_mut(&args.name) {
            state.writer = None;
        }
        self.publish(&args.name);
    }

    fn release_reader(&self, args: &LockArgs) {
        if let Some(state) = self.state.lock().unwrap().get_mut(&args.name) {
            if let Some(count) = state.readers.get_mut(&args.token) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.readers.remove(&args.token);
                }
            }
        }
        self.publish(&args.name);
    }

    fn renew(&self, args: &LockArgs) -> bool {
        self.with_state(&args.name, |state, now| {
            let holds = state.writer.as_deref() == Some(args.token.as_str())
                || state.readers.contains_key(&args.token);
            if holds {
                state.expires_at = Some(now + args.lease);
            }
            holds
        })
    }
}

#[async_trait]
impl Driver for PushBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self, args: &LockArgs) -> Vote {
        self.exclusive(args)
    }

    async fn unlock(&self, args: &LockArgs) -> Result<()> {
        self.release_writer(args);
        Ok(())
    }

    async fn touch(&self, args: &LockArgs) -> Result<bool> {
        Ok(self.renew(args))
    }

    fn read_write(&self) -> Option<&dyn RwDriver> {
        Some(self)
    }

    fn watcher(&self) -> Option<&dyn Watcher> {
        Some(self)
    }
}

#[async_trait]
impl RwDriver for PushBackend {
    async fn rlock(&self, args: &LockArgs) -> Vote {
        self.shared(args)
    }

    async fn runlock(&self, args: &LockArgs) -> Result<()> {
        self.release_reader(args);
        Ok(())
    }

    async fn rtouch(&self, args: &LockArgs) -> Result<bool> {
        Ok(self.renew(args))
    }

    async fn wlock(&self, args: &LockArgs) -> Vote {
        self.exclusive(args)
    }

    async fn wunlock(&self, args: &LockArgs) -> Result<()> {
        self.release_writer(args);
        Ok(())
    }

    async fn wtouch(&self, args: &LockArgs) -> Result<bool> {
        Ok(self.renew(args))
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Watcher for PushBackend {
    async fn listen(&self, channel: &str) -> Result<ReleaseStream> {
        self.listens.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .listen_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DistlockError::Watch {
                channel: channel.to_string(),
                reason: format!("{} refused the listener", self.name),
            });
        }

        let channel = channel.to_string();
        let state = (
            self.events.subscribe(),
            ActiveGuard::new(&self.active_listeners),
        );

        Ok(futures::stream::unfold(state, move |(mut rx, guard)| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if event == channel => return Some((Ok(()), (rx, guard))),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            return Some((Ok(()), (rx, guard)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed())
    }
}
