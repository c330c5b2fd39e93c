use std::sync::Arc;

use distlock_common::{
    config::DistlockConfig,
    error::{DistlockError, Result},
};
use tracing::info;

use crate::{
    dsync::{
        client::Quorum,
        locker::{Driver, LockKind},
        mutex::{DMutex, HandleCore},
        rwmutex::DRWMutex,
    },
    watch::WatchHub,
};

/// Entry point: one quorum and one watch hub shared by every handle it
/// creates.
#[derive(Clone)]
pub struct Locker {
    quorum: Arc<Quorum>,
    hub: WatchHub,
    config: DistlockConfig,
}

impl Locker {
    pub fn new(lockers: Vec<Arc<dyn Driver>>, config: DistlockConfig) -> Result<Self> {
        let quorum = Quorum::with_config(lockers, &config)?;
        let hub = WatchHub::new(quorum.lockers().to_vec(), &config);

        info!(
            backends = quorum.total_nodes(),
            quorum = quorum.quorum(),
            push = hub.is_push_capable(),
            verify_holder_token = config.verify_holder_token,
            "distributed locker ready"
        );

        Ok(Self {
            quorum: Arc::new(quorum),
            hub,
            config,
        })
    }

    pub fn single(locker: Arc<dyn Driver>) -> Result<Self> {
        Self::new(vec![locker], DistlockConfig::default())
    }

    pub fn config(&self) -> &DistlockConfig {
        &self.config
    }

    pub fn quorum(&self) -> &Quorum {
        &self.quorum
    }

    pub fn hub(&self) -> &WatchHub {
        &self.hub
    }

    pub fn new_mutex(&self, name: impl Into<String>) -> Result<DMutex> {
        Ok(DMutex::new(self.handle(name.into())?))
    }

    pub fn new_rw_mutex(&self, name: impl Into<String>) -> Result<DRWMutex> {
        if !self.quorum.supports(LockKind::Read) {
            let backend = self
                .quorum
                .lockers()
                .iter()
                .find(|locker| locker.read_write().is_none())
                .map(|locker| locker.name().to_string())
                .unwrap_or_default();
            return Err(DistlockError::unsupported("rwlock", backend));
        }

        Ok(DRWMutex::new(self.handle(name.into())?))
    }

    /// Stops every release listener the hub started.
    pub fn shutdown(&self) {
        self.hub.shutdown();
    }

    fn handle(&self, name: String) -> Result<HandleCore> {
        if name.trim().is_empty() {
            return Err(DistlockError::InvalidArgument(
                "lock name must not be empty".to_string(),
            ));
        }

        Ok(HandleCore::new(
            name,
            Arc::clone(&self.quorum),
            self.hub.clone(),
            self.config.clone(),
        ))
    }
}
