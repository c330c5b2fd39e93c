pub mod client;
pub mod lock_args;
pub mod locker;
pub mod mutex;
pub mod rwmutex;

pub use client::{AcquireOutcome, Quorum};
pub use lock_args::{LockArgs, notify_channel};
pub use locker::{
    Capabilities, Driver, LockKind, ReleaseStream, RwDriver, UnavailableDriver, Vote, Watcher,
};
pub use mutex::{DMutex, LockOutcome};
pub use rwmutex::DRWMutex;
