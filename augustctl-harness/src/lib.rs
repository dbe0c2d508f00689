//! Simulation harness for the lock stack.
//!
//! [`SimulatedLock`] stands in for the radio and the lock behind it;
//! [`InProcessBridge`] stands in for the bridge child process.

pub mod sim_bridge;
pub mod sim_lock;

pub use sim_bridge::InProcessBridge;
pub use sim_lock::{SimEvent, SimulatedLock};

use std::sync::Arc;
use std::time::Duration;

use augustctl_lock::{LockConfig, LockController, LockHandle};

/// Offline key shared by the simulated lock and [`config`]
pub const OFFLINE_KEY: [u8; 16] = [
    0x5a, 0x13, 0x8c, 0x02, 0xf1, 0x44, 0x97, 0x3e, 0x0b, 0xd6, 0x21, 0x78, 0xc5, 0x6f, 0x30, 0xe9,
];

pub const KEY_INDEX: u8 = 1;

/// Lock configuration matching a fresh [`SimulatedLock`], with a short
/// exchange timeout so silent-lock tests finish quickly.
pub fn config() -> LockConfig {
    LockConfig {
        offline_key: OFFLINE_KEY,
        offline_key_index: KEY_INDEX,
        exchange_timeout: Some(Duration::from_millis(500)),
        everlock_default: 30,
    }
}

/// A simulated lock and a controller already attached to it
pub fn controller() -> (SimulatedLock, LockHandle) {
    let lock = SimulatedLock::new(OFFLINE_KEY);
    let handle = LockController::spawn_with_link(config(), Arc::new(lock.clone()));
    (lock, handle)
}
