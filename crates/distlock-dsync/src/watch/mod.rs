pub mod backoff;
pub mod hub;

pub use backoff::Backoff;
pub use hub::{Subscription, WatchHub};
