#![allow(dead_code)]

use std::sync::Arc;

use distlock_dsync::{DistlockConfig, Driver, Locker};
use distlock_memory::MemoryDriver;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Locker over `count` fresh in-memory backends, returned alongside them.
pub fn memory_locker(count: usize, config: DistlockConfig) -> (Locker, Vec<Arc<MemoryDriver>>) {
    let drivers: Vec<Arc<MemoryDriver>> = (0..count)
        .map(|index| Arc::new(MemoryDriver::with_config(&config).named(format!("memory-{index}"))))
        .collect();
    let lockers: Vec<Arc<dyn Driver>> = drivers
        .iter()
        .map(|driver| Arc::clone(driver) as Arc<dyn Driver>)
        .collect();

    let locker = Locker::new(lockers, config).expect("valid locker configuration");
    (locker, drivers)
}
