//! One characteristic pair with its cipher: write a command, wait for the
//! notification that answers it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use augustctl_proto::{CommandBuffer, ProtocolError};

use crate::cipher::{ChannelMode, Cipher};
use crate::link::BleLink;

type Waiter = oneshot::Sender<Result<CommandBuffer, ProtocolError>>;

/// What a lock channel can do. Implemented once, by [`CipherSession`], for
/// both channel modes.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    fn set_key(&self, key: &[u8; 16]);

    /// Enables notifications on the read characteristic.
    async fn start(&self) -> Result<(), ProtocolError>;

    /// Sends one command and returns the decrypted, validated response.
    async fn execute(&self, command: CommandBuffer) -> Result<CommandBuffer, ProtocolError>;
}

#[derive(Default)]
struct SessionState {
    cipher: Option<Cipher>,
    waiter: Option<Waiter>,
}

/// A channel bound to its write and read characteristics.
///
/// Clones share the cipher and the pending waiter, so the notification pump
/// and the driver can each hold one.
#[derive(Clone)]
pub struct CipherSession {
    mode: ChannelMode,
    write: Uuid,
    read: Uuid,
    link: Arc<dyn BleLink>,
    timeout: Option<Duration>,
    state: Arc<Mutex<SessionState>>,
}

impl CipherSession {
    pub fn new(
        mode: ChannelMode,
        link: Arc<dyn BleLink>,
        write: Uuid,
        read: Uuid,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            mode,
            write,
            read,
            link,
            timeout,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn read_characteristic(&self) -> Uuid {
        self.read
    }

    fn label(&self) -> &'static str {
        if self.mode.is_secure() { "secure" } else { "session" }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds one notification value from the read characteristic.
    ///
    /// The value is decrypted on arrival, even when nobody waits for it, so
    /// the CBC chain stays aligned with the lock.
    pub fn deliver(&self, value: &[u8]) {
        let mut state = self.state();
        debug!(channel = self.label(), data = %data_encoding::HEXLOWER.encode(value), "read data");

        let result = CommandBuffer::from_bytes(value).map(|mut response| {
            if let Some(cipher) = state.cipher.as_mut() {
                cipher.decrypt(response.cipher_block_mut());
                debug!(channel = self.label(), data = %response.to_hex(), "decrypted data");
            }
            response
        });

        match state.waiter.take() {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => warn!(channel = self.label(), "notification with no pending command, dropped"),
        }
    }

    /// Fails a pending exchange because the link went away.
    pub fn close(&self) {
        if let Some(waiter) = self.state().waiter.take() {
            let _ = waiter.send(Err(ProtocolError::Disconnected));
        }
    }

    fn clear_waiter(&self) {
        self.state().waiter = None;
    }
}

#[async_trait::async_trait]
impl Channel for CipherSession {
    fn set_key(&self, key: &[u8; 16]) {
        self.state().cipher = Some(Cipher::new(self.mode, key));
    }

    async fn start(&self) -> Result<(), ProtocolError> {
        debug!(channel = self.label(), characteristic = %self.read, "enabling notifications");
        self.link.subscribe(self.read).await
    }

    async fn execute(&self, mut command: CommandBuffer) -> Result<CommandBuffer, ProtocolError> {
        let secure = self.mode.is_secure();

        // The response notification can arrive before the write is
        // acknowledged, so the waiter goes in before the write goes out.
        let response = {
            let mut state = self.state();
            if state.waiter.is_some() {
                return Err(ProtocolError::Busy);
            }
            if secure {
                command.stamp_security_checksum();
            }
            debug!(channel = self.label(), data = %command.to_hex(), "execute command");

            // the last two bytes are never encrypted
            if let Some(cipher) = state.cipher.as_mut() {
                cipher.encrypt(command.cipher_block_mut());
                debug!(channel = self.label(), data = %command.to_hex(), "execute command (encrypted)");
            }

            let (tx, rx) = oneshot::channel();
            state.waiter = Some(tx);
            rx
        };

        if let Err(e) = self.link.write(self.write, command.as_bytes()).await {
            self.clear_waiter();
            return Err(e);
        }
        debug!(channel = self.label(), "write successful, waiting for notification");

        let response = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(r) => r,
                Err(_) => {
                    self.clear_waiter();
                    return Err(ProtocolError::Timeout {
                        millis: limit.as_millis() as u64,
                    });
                }
            },
            None => response.await,
        };

        let response = response.map_err(|_| ProtocolError::Disconnected)??;
        response.validate_response(secure)?;
        Ok(response)
    }
}
