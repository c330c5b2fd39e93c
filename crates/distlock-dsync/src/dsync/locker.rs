use std::time::Duration;

use async_trait::async_trait;
use distlock_common::error::{DistlockError, Result};
use futures::stream::BoxStream;

use super::lock_args::LockArgs;

/// One backend's answer to a lock request.
#[derive(Debug)]
pub enum Vote {
    Granted,
    /// Transient contention inside the backend; retry the same backend.
    Busy,
    /// Someone else holds the name; the hint says how long until it may free up.
    HeldByOther(Duration),
    Error(DistlockError),
}

impl Vote {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Exclusive,
    Read,
    Write,
}

impl LockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exclusive => "lock",
            Self::Read => "rlock",
            Self::Write => "wlock",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub read_write: bool,
    pub watch: bool,
}

/// Stream of release events for one channel. An `Err` item means the
/// listener broke and should be re-established.
pub type ReleaseStream = BoxStream<'static, Result<()>>;

/// Exclusive-lock contract every backend implements.
///
/// Optional capabilities are exposed through [`Driver::read_write`] and
/// [`Driver::watcher`]; callers probe them instead of assuming support.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    async fn lock(&self, args: &LockArgs) -> Vote;
    async fn unlock(&self, args: &LockArgs) -> Result<()>;
    async fn touch(&self, args: &LockArgs) -> Result<bool>;

    fn read_write(&self) -> Option<&dyn RwDriver> {
        None
    }

    fn watcher(&self) -> Option<&dyn Watcher> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read_write: self.read_write().is_some(),
            watch: self.watcher().is_some(),
        }
    }
}

#[async_trait]
pub trait RwDriver: Send + Sync {
    async fn rlock(&self, args: &LockArgs) -> Vote;
    async fn runlock(&self, args: &LockArgs) -> Result<()>;
    async fn rtouch(&self, args: &LockArgs) -> Result<bool>;
    async fn wlock(&self, args: &LockArgs) -> Vote;
    async fn wunlock(&self, args: &LockArgs) -> Result<()>;
    async fn wtouch(&self, args: &LockArgs) -> Result<bool>;
}

#[async_trait]
pub trait Watcher: Send + Sync {
    async fn listen(&self, channel: &str) -> Result<ReleaseStream>;
}

/// Placeholder for a backend that could not be initialised.
///
/// Keeps its slot in the backend list so vote counting stays aligned, and
/// answers every call with `BackendUnavailable`.
#[derive(Debug, Clone)]
pub struct UnavailableDriver {
    name: String,
    reason: String,
}

impl UnavailableDriver {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }

    fn error(&self) -> DistlockError {
        DistlockError::BackendUnavailable(format!("{}: {}", self.name, self.reason))
    }
}

#[async_trait]
impl Driver for UnavailableDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self, _args: &LockArgs) -> Vote {
        Vote::Error(self.error())
    }

    async fn unlock(&self, _args: &LockArgs) -> Result<()> {
        Err(self.error())
    }

    async fn touch(&self, _args: &LockArgs) -> Result<bool> {
        Err(self.error())
    }
}
