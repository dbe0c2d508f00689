//! Bridge spawner that runs the bridge loop as a task over an in-memory pipe

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinHandle;
use tracing::debug;

use augustctl_lock::LockHandle;
use augustctl_lock::bridge::{self, BridgeError, BridgeReader, BridgeSpawner, BridgeWriter};

pub struct InProcessBridge {
    handle: LockHandle,
    spawned: AtomicUsize,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessBridge {
    pub fn new(handle: LockHandle) -> Self {
        Self {
            handle,
            spawned: AtomicUsize::new(0),
            current: Mutex::new(None),
        }
    }

    /// How many bridges have been started
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Ends the running bridge as if the child process had died.
    pub fn kill(&self) {
        if let Some(task) = self.current.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl BridgeSpawner for InProcessBridge {
    async fn spawn(&self) -> Result<(BridgeReader, BridgeWriter), BridgeError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let handle = self.handle.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = bridge::serve(&handle, server_read, server_write).await {
                debug!(error = %e, "in-process bridge stopped");
            }
        });

        self.spawned.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok((Box::new(client_read), Box::new(client_write)))
    }
}
