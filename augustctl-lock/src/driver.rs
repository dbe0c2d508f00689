//! The lock's command vocabulary on top of the secure and session channels

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use augustctl_proto::ble::{
    COMMAND_READ_UUID, COMMAND_SERVICE_UUID, COMMAND_WRITE_UUID, SECURE_READ_UUID,
    SECURE_WRITE_UUID, everlock,
};
use augustctl_proto::{Command, LockStatus, Outcome, ProtocolError, StatusRecord, packet};

use crate::cipher::ChannelMode;
use crate::link::BleLink;
use crate::session::{Channel, CipherSession};

/// Offline key material and protocol tuning for one lock
#[derive(Clone)]
pub struct LockConfig {
    pub offline_key: [u8; 16],
    pub offline_key_index: u8,
    /// Upper bound on the wait for each response notification. `None` waits
    /// forever.
    pub exchange_timeout: Option<Duration>,
    /// Everlock duration used when a request leaves it out
    pub everlock_default: u16,
}

impl LockConfig {
    /// `offline_key` is the 32 hex digit key provisioned for this phone.
    pub fn from_hex(offline_key: &str, offline_key_index: u8) -> Result<Self, ProtocolError> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(offline_key.trim().as_bytes())
            .map_err(|e| ProtocolError::InvalidKey {
                reason: e.to_string(),
            })?;
        let offline_key: [u8; 16] =
            bytes
                .try_into()
                .map_err(|b: Vec<u8>| ProtocolError::InvalidKey {
                    reason: format!("expected 16 bytes, got {}", b.len()),
                })?;
        Ok(Self {
            offline_key,
            offline_key_index,
            exchange_timeout: Some(Duration::from_secs(10)),
            everlock_default: everlock::DEFAULT_SECS,
        })
    }

    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_everlock_default(mut self, seconds: u16) -> Self {
        self.everlock_default = seconds;
        self
    }
}

impl std::fmt::Debug for LockConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockConfig")
            .field("offline_key", &"<redacted>")
            .field("offline_key_index", &self.offline_key_index)
            .field("exchange_timeout", &self.exchange_timeout)
            .field("everlock_default", &self.everlock_default)
            .finish()
    }
}

/// A discovered lock. Nothing is sent until [`Lock::connect`].
pub struct Lock {
    link: Arc<dyn BleLink>,
    config: LockConfig,
}

impl Lock {
    pub fn new(link: Arc<dyn BleLink>, config: LockConfig) -> Self {
        Self { link, config }
    }

    pub fn id(&self) -> String {
        self.link.id()
    }

    /// Opens the link and runs the key exchange.
    ///
    /// `on_link_lost` runs once when the notification stream of this
    /// connection ends.
    pub async fn connect(
        &self,
        on_link_lost: impl FnOnce() + Send + 'static,
    ) -> Result<LockConnection, ProtocolError> {
        self.link.connect().await?;
        info!(lock = %self.link.id(), "connected");

        let services = self.link.discover_services().await?;
        let mut matching = services.iter().filter(|s| s.uuid == COMMAND_SERVICE_UUID);
        let service = match (matching.next(), matching.next()) {
            (Some(service), None) => service,
            _ => {
                let found = services.iter().filter(|s| s.uuid == COMMAND_SERVICE_UUID).count();
                return Err(ProtocolError::ServiceNotFound { found });
            }
        };
        debug!(characteristics = ?service.characteristics, "command service");

        for uuid in [
            SECURE_WRITE_UUID,
            SECURE_READ_UUID,
            COMMAND_WRITE_UUID,
            COMMAND_READ_UUID,
        ] {
            if !service.characteristics.contains(&uuid) {
                return Err(ProtocolError::CharacteristicMissing {
                    uuid: uuid.to_string(),
                });
            }
        }

        let timeout = self.config.exchange_timeout;
        let secure = CipherSession::new(
            ChannelMode::Secure,
            self.link.clone(),
            SECURE_WRITE_UUID,
            SECURE_READ_UUID,
            timeout,
        );
        secure.set_key(&self.config.offline_key);
        let session = CipherSession::new(
            ChannelMode::Session,
            self.link.clone(),
            COMMAND_WRITE_UUID,
            COMMAND_READ_UUID,
            timeout,
        );

        let notifications = self.link.notifications().await?;
        let pump = tokio::spawn(pump_notifications(
            notifications,
            secure.clone(),
            session.clone(),
            on_link_lost,
        ));
        let connection = LockConnection {
            link: self.link.clone(),
            secure,
            session,
            everlock_default: self.config.everlock_default,
            pump,
        };

        connection.secure.start().await?;
        connection.session.start().await?;
        connection.handshake(self.config.offline_key_index).await?;
        info!(lock = %self.link.id(), "session established");
        Ok(connection)
    }
}

async fn pump_notifications(
    mut notifications: futures::stream::BoxStream<'static, crate::link::Notification>,
    secure: CipherSession,
    session: CipherSession,
    on_link_lost: impl FnOnce() + Send + 'static,
) {
    while let Some(n) = notifications.next().await {
        if n.characteristic == secure.read_characteristic() {
            secure.deliver(&n.value);
        } else if n.characteristic == session.read_characteristic() {
            session.deliver(&n.value);
        } else {
            debug!(characteristic = %n.characteristic, "ignoring notification");
        }
    }
    warn!("notification stream ended");
    secure.close();
    session.close();
    on_link_lost();
}

/// A lock after a completed handshake, ready for commands.
///
/// Operations must not overlap; the controller runs one at a time.
pub struct LockConnection {
    link: Arc<dyn BleLink>,
    secure: CipherSession,
    session: CipherSession,
    everlock_default: u16,
    pump: tokio::task::JoinHandle<()>,
}

impl Drop for LockConnection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl LockConnection {
    async fn handshake(&self, key_index: u8) -> Result<(), ProtocolError> {
        let handshake_keys: [u8; 16] = rand::random();

        let response = self
            .secure
            .execute(packet::mobile_key_exchange(&handshake_keys, key_index))
            .await?;

        let session_key = packet::derive_session_key(&handshake_keys, &response);
        self.session.set_key(&session_key);
        self.secure.set_key(&session_key);

        self.secure
            .execute(packet::initialization(&handshake_keys, key_index))
            .await?;
        Ok(())
    }

    /// Runs one command from the vocabulary.
    pub async fn run(&self, command: Command) -> Result<Outcome, ProtocolError> {
        Ok(match command {
            Command::Lock => {
                self.lock().await?;
                Outcome::Done
            }
            Command::Unlock => {
                self.unlock().await?;
                Outcome::Done
            }
            Command::ForceLock => {
                self.forcelock().await?;
                Outcome::Done
            }
            Command::ForceUnlock => {
                self.forceunlock().await?;
                Outcome::Done
            }
            Command::GetLockStatus => Outcome::Status(self.get_lock_status().await?),
            Command::GetEverlockTime => Outcome::EverlockTime(self.get_everlock_time().await?),
            Command::GetAllStatus => Outcome::AllStatus(self.get_all_status().await?),
            Command::EverlockOn(seconds) => {
                self.everlock_on(seconds).await?;
                Outcome::Done
            }
            Command::EverlockOff => {
                self.everlock_off().await?;
                Outcome::Done
            }
            Command::EverlockOnLock(seconds) => {
                self.everlock_on_lock(seconds).await?;
                Outcome::Done
            }
            Command::EverlockOffUnlock => {
                self.everlock_off_unlock().await?;
                Outcome::Done
            }
            Command::Disconnect => {
                self.disconnect().await?;
                Outcome::Done
            }
        })
    }

    pub async fn forcelock(&self) -> Result<(), ProtocolError> {
        debug!("locking...");
        self.session.execute(packet::forcelock()).await?;
        Ok(())
    }

    pub async fn forceunlock(&self) -> Result<(), ProtocolError> {
        debug!("unlocking...");
        self.session.execute(packet::forceunlock()).await?;
        Ok(())
    }

    pub async fn get_lock_status(&self) -> Result<LockStatus, ProtocolError> {
        debug!("lock status...");
        let response = self.session.execute(packet::lock_status()).await?;
        Ok(packet::read_lock_status(&response))
    }

    /// Locks unless the lock already reports locked or an unknown state.
    pub async fn lock(&self) -> Result<(), ProtocolError> {
        if self.get_lock_status().await? == LockStatus::Unlocked {
            self.forcelock().await?;
        }
        Ok(())
    }

    pub async fn unlock(&self) -> Result<(), ProtocolError> {
        if self.get_lock_status().await? == LockStatus::Locked {
            self.forceunlock().await?;
        }
        Ok(())
    }

    pub async fn everlock_on(&self, seconds: Option<u16>) -> Result<(), ProtocolError> {
        let seconds = packet::everlock_seconds(seconds, self.everlock_default);
        debug!(seconds, "activate everlock...");
        self.session.execute(packet::everlock_on(seconds)).await?;
        Ok(())
    }

    pub async fn everlock_off(&self) -> Result<(), ProtocolError> {
        debug!("deactivate everlock...");
        self.session.execute(packet::everlock_off()).await?;
        Ok(())
    }

    pub async fn everlock_on_lock(&self, seconds: Option<u16>) -> Result<(), ProtocolError> {
        self.everlock_on(seconds).await?;
        self.lock().await
    }

    pub async fn everlock_off_unlock(&self) -> Result<(), ProtocolError> {
        self.everlock_off().await?;
        self.unlock().await
    }

    pub async fn get_everlock_time(&self) -> Result<u16, ProtocolError> {
        debug!("everlock time...");
        let response = self.session.execute(packet::everlock_time()).await?;
        Ok(packet::read_everlock_time(&response))
    }

    pub async fn get_all_status(&self) -> Result<StatusRecord, ProtocolError> {
        let lock = self.get_lock_status().await?;
        let everlocktime = self.get_everlock_time().await?;
        Ok(StatusRecord { lock, everlocktime })
    }

    /// Terminates the session on the secure channel, then drops the link.
    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        debug!("disconnecting...");
        self.secure.execute(packet::terminate()).await?;
        self.link.disconnect().await
    }

    /// Fails any exchange still waiting for a notification.
    pub fn close_channels(&self) {
        self.secure.close();
        self.session.close();
    }

    /// Drops the link without telling the lock, after a failure.
    pub async fn abandon(&self) {
        if let Err(e) = self.link.disconnect().await {
            warn!(error = %e, "failed to drop link");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_key_parsing() {
        let config = LockConfig::from_hex("0123456789ABCDEF0123456789abcdef", 1).unwrap();
        assert_eq!(config.offline_key[0], 0x01);
        assert_eq!(config.offline_key[15], 0xef);
        assert_eq!(config.offline_key_index, 1);
        assert_eq!(config.everlock_default, 30);

        assert!(matches!(
            LockConfig::from_hex("0123", 1),
            Err(ProtocolError::InvalidKey { .. })
        ));
        assert!(matches!(
            LockConfig::from_hex("zz23456789abcdef0123456789abcdef", 1),
            Err(ProtocolError::InvalidKey { .. })
        ));
    }

    #[test]
    fn debug_output_hides_the_key() {
        let config = LockConfig::from_hex("0123456789abcdef0123456789abcdef", 1).unwrap();
        assert!(!format!("{config:?}").contains("0123"));
    }
}
