pub mod config;
pub mod error;
pub mod time;

pub use config::DistlockConfig;
pub use error::{DistlockError, Result};
