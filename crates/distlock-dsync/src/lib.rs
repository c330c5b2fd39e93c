pub mod dsync;
pub mod system;
pub mod watch;

pub use distlock_common::{DistlockConfig, DistlockError, Result};
pub use dsync::{
    AcquireOutcome, Capabilities, DMutex, DRWMutex, Driver, LockArgs, LockKind, LockOutcome,
    Quorum, ReleaseStream, RwDriver, UnavailableDriver, Vote, Watcher, notify_channel,
};
pub use system::Locker;
pub use watch::{Backoff, Subscription, WatchHub};
