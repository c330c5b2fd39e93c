use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use distlock_common::config::DistlockConfig;
use futures::StreamExt;
use tokio::{sync::broadcast, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::Backoff;
use crate::dsync::{lock_args::notify_channel, locker::Driver};

const TOPIC_CAPACITY: usize = 16;

struct Topic {
    generation: u64,
    tx: broadcast::Sender<()>,
    cancel: CancellationToken,
    subscribers: usize,
}

struct HubInner {
    lockers: Vec<Arc<dyn Driver>>,
    backoff: Backoff,
    topics: Mutex<HashMap<String, Topic>>,
    generations: AtomicU64,
    shutdown: CancellationToken,
}

impl HubInner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Ignores topics that were replaced since the subscription was taken.
    fn unsubscribe(&self, name: &str, generation: u64) {
        let mut topics = self.topics();
        let Some(topic) = topics.get_mut(name) else {
            return;
        };
        if topic.generation != generation {
            return;
        }

        topic.subscribers = topic.subscribers.saturating_sub(1);
        if topic.subscribers == 0 {
            topic.cancel.cancel();
            topics.remove(name);
            debug!(lock = name, "last waiter left; release listeners stopped");
        }
    }
}

/// Fans release notifications from every push-capable backend into one
/// wake queue per lock name.
///
/// Listeners for a name run only while at least one [`Subscription`] for it
/// is alive. `subscribe` spawns tasks and must be called inside a tokio
/// runtime.
#[derive(Clone)]
pub struct WatchHub {
    inner: Arc<HubInner>,
}

impl WatchHub {
    pub fn new(lockers: Vec<Arc<dyn Driver>>, config: &DistlockConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                lockers,
                backoff: Backoff::new(
                    config.min_watch_retry_interval,
                    config.max_watch_retry_interval,
                ),
                topics: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn is_push_capable(&self) -> bool {
        self.inner
            .lockers
            .iter()
            .any(|locker| locker.watcher().is_some())
    }

    pub fn subscribe(&self, name: &str) -> Subscription {
        let mut topics = self.inner.topics();

        if let Some(topic) = topics.get_mut(name) {
            topic.subscribers = topic.subscribers.saturating_add(1);
            return Subscription {
                name: name.to_string(),
                generation: topic.generation,
                rx: topic.tx.subscribe(),
                hub: Arc::clone(&self.inner),
            };
        }

        let (tx, rx) = broadcast::channel(TOPIC_CAPACITY);
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        let channel = notify_channel(name);

        for locker in &self.inner.lockers {
            if locker.watcher().is_none() {
                continue;
            }

            tokio::spawn(run_listener(
                Arc::clone(locker),
                channel.clone(),
                tx.clone(),
                cancel.clone(),
                self.inner.backoff.clone(),
            ));
        }

        topics.insert(
            name.to_string(),
            Topic {
                generation,
                tx,
                cancel,
                subscribers: 1,
            },
        );

        Subscription {
            name: name.to_string(),
            generation,
            rx,
            hub: Arc::clone(&self.inner),
        }
    }

    pub fn active_topics(&self) -> usize {
        self.inner.topics().len()
    }

    pub fn is_watching(&self, name: &str) -> bool {
        self.inner.topics().contains_key(name)
    }

    /// Stops every listener. Existing subscriptions stay valid but never fire.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.topics().clear();
    }
}

/// One waiter's registration for release events on a lock name.
pub struct Subscription {
    name: String,
    generation: u64,
    rx: broadcast::Receiver<()>,
    hub: Arc<HubInner>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves on the next release event. Pends forever once the hub is
    /// shut down, so callers always pair it with a timeout.
    pub async fn recv(&mut self) {
        match self.rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.name, self.generation);
    }
}

async fn run_listener(
    locker: Arc<dyn Driver>,
    channel: String,
    tx: broadcast::Sender<()>,
    cancel: CancellationToken,
    mut backoff: Backoff,
) {
    loop {
        let Some(watcher) = locker.watcher() else {
            return;
        };

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            attempt = watcher.listen(&channel) => attempt,
        };

        match attempt {
            Ok(mut events) => {
                debug!(backend = locker.name(), channel = %channel, "release listener connected");
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = events.next() => event,
                    };

                    match event {
                        Some(Ok(())) => {
                            backoff.reset();
                            let _ = tx.send(());
                        }
                        Some(Err(err)) => {
                            warn!(
                                backend = locker.name(),
                                channel = %channel,
                                error = %err,
                                "release listener broke"
                            );
                            break;
                        }
                        None => {
                            debug!(
                                backend = locker.name(),
                                channel = %channel,
                                "release stream ended"
                            );
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(
                    backend = locker.name(),
                    channel = %channel,
                    error = %err,
                    "release listener failed to start"
                );
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}
