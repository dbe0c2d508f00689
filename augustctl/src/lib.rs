extern crate self as augustctl;

pub mod alexa;
pub mod config;
pub mod control;
pub mod http;
pub mod logging;

use std::time::Duration;

use tracing::{info, warn};

use augustctl_lock::{LockController, LockHandle};

/// Pause between failed attempts to find the lock
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Starts a controller for the configured lock and keeps scanning in the
/// background until the lock is found.
pub fn spawn_lock(config: &config::Config) -> Result<LockHandle, config::ConfigError> {
    let handle = LockController::spawn(config.lock_config()?);
    let address = config.lock_address.clone();
    let timeout = config.scan_timeout();
    let discovery = handle.clone();
    tokio::spawn(async move {
        loop {
            if discovery.is_closed() {
                return;
            }
            match augustctl_lock::btle::attach(&discovery, address.as_deref(), timeout).await {
                Ok(()) => {
                    info!("lock found");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "lock not found, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    });
    Ok(handle)
}
