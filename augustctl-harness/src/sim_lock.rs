//! A lock that lives in memory and speaks the real protocol
//!
//! The simulated lock holds its own cipher contexts and answers the phone the
//! way the firmware does: the key exchange under the offline key, then
//! session commands under the derived key with CBC chaining carried across
//! messages. Knobs let tests slow it down, silence it, or pull the link.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use augustctl_lock::cipher::{ChannelMode, Cipher};
use augustctl_lock::{BleLink, GattService, Notification};
use augustctl_proto::ble::{
    COMMAND_READ_UUID, COMMAND_SERVICE_UUID, COMMAND_WRITE_UUID, SECURE_READ_UUID,
    SECURE_WRITE_UUID, secure, session,
};
use augustctl_proto::{CommandBuffer, OFFSET_ARG, OFFSET_FLAG, ProtocolError};

/// Something the lock saw or did, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Connected,
    Disconnected,
    LinkDropped,
    KeyExchange { key_index: u8 },
    Initialized,
    Terminated,
    /// A secure command that failed its checksum after decryption
    Rejected,
    /// A decrypted session channel command
    Session(CommandBuffer),
}

struct Keys {
    secure: Cipher,
    session: Option<Cipher>,
}

struct SimState {
    offline_key: [u8; 16],
    keys: Keys,
    status: u8,
    everlock: u16,
    connected: bool,
    subscribed: HashSet<Uuid>,
    notify: Option<mpsc::UnboundedSender<Notification>>,
    stream: Option<mpsc::UnboundedReceiver<Notification>>,
    events: Vec<SimEvent>,
    latency: HashMap<u8, Duration>,
    silent: HashSet<u8>,
    services: Option<Vec<GattService>>,
    failed_connects: u32,
    in_flight: usize,
    max_in_flight: usize,
}

impl SimState {
    fn offline_keys(offline_key: [u8; 16]) -> Keys {
        Keys {
            secure: Cipher::new(ChannelMode::Secure, &offline_key),
            session: None,
        }
    }
}

/// In-memory [`BleLink`] with a lock behind it. Clones share the lock.
#[derive(Clone)]
pub struct SimulatedLock {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedLock {
    /// A locked lock with everlock off
    pub fn new(offline_key: [u8; 16]) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                offline_key,
                keys: SimState::offline_keys(offline_key),
                status: session::STATUS_LOCKED,
                everlock: 0,
                connected: false,
                subscribed: HashSet::new(),
                notify: None,
                stream: None,
                events: Vec::new(),
                latency: HashMap::new(),
                silent: HashSet::new(),
                services: None,
                failed_connects: 0,
                in_flight: 0,
                max_in_flight: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw status byte reported at 0x08 of status responses
    pub fn set_status_byte(&self, status: u8) {
        self.state().status = status;
    }

    pub fn status_byte(&self) -> u8 {
        self.state().status
    }

    pub fn set_everlock(&self, seconds: u16) {
        self.state().everlock = seconds;
    }

    pub fn everlock(&self) -> u16 {
        self.state().everlock
    }

    /// Delays the answer to every session command with `opcode`.
    pub fn set_latency(&self, opcode: u8, latency: Duration) {
        self.state().latency.insert(opcode, latency);
    }

    /// Never answers session commands with `opcode`.
    pub fn silence(&self, opcode: u8) {
        self.state().silent.insert(opcode);
    }

    /// Replaces the advertised GATT table.
    pub fn set_services(&self, services: Vec<GattService>) {
        self.state().services = Some(services);
    }

    /// Fails the next `count` connect attempts.
    pub fn fail_connects(&self, count: u32) {
        self.state().failed_connects = count;
    }

    /// Simulates the radio link going away: the notification stream ends and
    /// the lock forgets the session.
    pub fn drop_link(&self) {
        let mut state = self.state();
        if !state.connected {
            return;
        }
        state.connected = false;
        state.notify = None;
        state.subscribed.clear();
        state.keys = SimState::offline_keys(state.offline_key);
        state.events.push(SimEvent::LinkDropped);
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state().events.clone()
    }

    /// Opcodes of the session commands received so far
    pub fn session_opcodes(&self) -> Vec<u8> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                SimEvent::Session(cmd) => Some(cmd.u8(0x01)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Most session commands ever outstanding at the same time
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    fn services(state: &SimState) -> Vec<GattService> {
        state.services.clone().unwrap_or_else(|| {
            vec![GattService {
                uuid: COMMAND_SERVICE_UUID,
                characteristics: vec![
                    COMMAND_WRITE_UUID,
                    COMMAND_READ_UUID,
                    SECURE_WRITE_UUID,
                    SECURE_READ_UUID,
                ],
            }]
        })
    }

    fn secure_command(state: &mut SimState, mut cmd: CommandBuffer) -> Option<CommandBuffer> {
        state.keys.secure.decrypt(cmd.cipher_block_mut());
        let mut reply = CommandBuffer::new();
        reply.set_u8(OFFSET_FLAG, secure::FLAG);

        if cmd.validate_response(true).is_err() {
            // wrong key on the phone side: answer with an error frame under
            // our own key, which the phone cannot authenticate either
            state.events.push(SimEvent::Rejected);
            reply.set_u8(0x00, 0xff);
            reply.stamp_security_checksum();
            state.keys.secure.encrypt(reply.cipher_block_mut());
            return Some(reply);
        }

        match cmd.u8(0x00) {
            secure::MOBILE_KEY_EXCHANGE => {
                let key_index = cmd.u8(0x11);
                state.events.push(SimEvent::KeyExchange { key_index });
                let lock_half: [u8; 8] = rand::random();
                let mut session_key = [0u8; 16];
                session_key[..8].copy_from_slice(cmd.slice(0x04, 0x0c));
                session_key[8..].copy_from_slice(&lock_half);

                reply.set_u8(0x00, 0x02).copy_in(0x04, &lock_half);
                reply.stamp_security_checksum();
                state.keys.secure.encrypt(reply.cipher_block_mut());

                // both directions switch once the answer is out
                state.keys = Keys {
                    secure: Cipher::new(ChannelMode::Secure, &session_key),
                    session: Some(Cipher::new(ChannelMode::Session, &session_key)),
                };
                Some(reply)
            }
            secure::INITIALIZATION => {
                state.events.push(SimEvent::Initialized);
                reply.set_u8(0x00, 0x04);
                reply.stamp_security_checksum();
                state.keys.secure.encrypt(reply.cipher_block_mut());
                Some(reply)
            }
            secure::TERMINATE => {
                state.events.push(SimEvent::Terminated);
                reply.set_u8(0x00, 0x06);
                reply.stamp_security_checksum();
                state.keys.secure.encrypt(reply.cipher_block_mut());
                state.keys = SimState::offline_keys(state.offline_key);
                Some(reply)
            }
            other => {
                debug!(subcommand = other, "sim lock ignoring secure command");
                None
            }
        }
    }

    /// Returns the decrypted opcode and the encrypted answer, if any.
    fn session_command(state: &mut SimState, mut cmd: CommandBuffer) -> (u8, Option<CommandBuffer>) {
        let Some(cipher) = state.keys.session.as_mut() else {
            debug!("sim lock got a session command before the key exchange");
            return (0, None);
        };
        cipher.decrypt(cmd.cipher_block_mut());
        state.events.push(SimEvent::Session(cmd));

        let opcode = cmd.u8(0x01);
        let mut reply = CommandBuffer::new();
        reply
            .set_u8(0x00, 0xbb)
            .set_u8(0x01, opcode)
            .set_u8(OFFSET_FLAG, session::FLAG);
        match opcode {
            session::OP_LOCK_STATUS => {
                reply.set_u8(OFFSET_ARG, state.status);
            }
            session::OP_LOCK => state.status = session::STATUS_LOCKED,
            session::OP_UNLOCK => state.status = session::STATUS_UNLOCKED,
            session::OP_EVERLOCK => state.everlock = cmd.u16_le(OFFSET_ARG),
            session::OP_EVERLOCK_TIME => {
                reply.set_u16_le(OFFSET_ARG, state.everlock);
            }
            other => debug!(opcode = other, "sim lock echoing unknown opcode"),
        }
        if state.silent.contains(&opcode) {
            return (opcode, None);
        }
        reply.stamp_simple_checksum();

        if let Some(cipher) = state.keys.session.as_mut() {
            cipher.encrypt(reply.cipher_block_mut());
        }
        (opcode, Some(reply))
    }
}

fn push(state: &SimState, characteristic: Uuid, reply: CommandBuffer) {
    if !state.subscribed.contains(&characteristic) {
        return;
    }
    if let Some(tx) = &state.notify {
        let _ = tx.send(Notification {
            characteristic,
            value: reply.as_bytes().to_vec(),
        });
    }
}

#[async_trait::async_trait]
impl BleLink for SimulatedLock {
    fn id(&self) -> String {
        "sim-lock".to_string()
    }

    async fn connect(&self) -> Result<(), ProtocolError> {
        let mut state = self.state();
        if state.failed_connects > 0 {
            state.failed_connects -= 1;
            return Err(ProtocolError::transport("simulated connect failure"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.connected = true;
        state.notify = Some(tx);
        state.stream = Some(rx);
        state.subscribed.clear();
        state.keys = SimState::offline_keys(state.offline_key);
        state.events.push(SimEvent::Connected);
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, ProtocolError> {
        let state = self.state();
        if !state.connected {
            return Err(ProtocolError::transport("not connected"));
        }
        Ok(Self::services(&state))
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), ProtocolError> {
        let mut state = self.state();
        if !state.connected {
            return Err(ProtocolError::transport("not connected"));
        }
        state.subscribed.insert(characteristic);
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>, ProtocolError> {
        let rx = self
            .state()
            .stream
            .take()
            .ok_or_else(|| ProtocolError::transport("notification stream already taken"))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        })
        .boxed())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), ProtocolError> {
        let cmd = CommandBuffer::from_bytes(value)?;
        let mut state = self.state();
        if !state.connected {
            return Err(ProtocolError::transport("not connected"));
        }

        match characteristic {
            SECURE_WRITE_UUID => {
                if let Some(reply) = Self::secure_command(&mut state, cmd) {
                    push(&state, SECURE_READ_UUID, reply);
                }
                Ok(())
            }
            COMMAND_WRITE_UUID => {
                state.in_flight += 1;
                state.max_in_flight = state.max_in_flight.max(state.in_flight);
                let (opcode, reply) = Self::session_command(&mut state, cmd);
                let Some(reply) = reply else {
                    state.in_flight -= 1;
                    return Ok(());
                };
                match state.latency.get(&opcode).copied() {
                    None => {
                        state.in_flight -= 1;
                        push(&state, COMMAND_READ_UUID, reply);
                    }
                    Some(delay) => {
                        drop(state);
                        let lock = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let mut state = lock.state();
                            state.in_flight -= 1;
                            if state.connected {
                                push(&state, COMMAND_READ_UUID, reply);
                            }
                        });
                    }
                }
                Ok(())
            }
            other => Err(ProtocolError::CharacteristicMissing {
                uuid: other.to_string(),
            }),
        }
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        let mut state = self.state();
        if state.connected {
            state.connected = false;
            state.notify = None;
            state.subscribed.clear();
            state.events.push(SimEvent::Disconnected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use augustctl_proto::packet;

    const KEY: [u8; 16] = [0x11; 16];

    #[tokio::test]
    async fn key_exchange_answer_is_readable_with_the_offline_key() {
        let lock = SimulatedLock::new(KEY);
        lock.connect().await.unwrap();
        lock.subscribe(SECURE_READ_UUID).await.unwrap();
        let mut stream = lock.notifications().await.unwrap();

        let keys = [0x22u8; 16];
        let mut cmd = packet::mobile_key_exchange(&keys, 1);
        cmd.stamp_security_checksum();
        Cipher::new(ChannelMode::Secure, &KEY).encrypt(cmd.cipher_block_mut());
        lock.write(SECURE_WRITE_UUID, cmd.as_bytes()).await.unwrap();

        let n = stream.next().await.unwrap();
        assert_eq!(n.characteristic, SECURE_READ_UUID);
        let mut reply = CommandBuffer::from_bytes(&n.value).unwrap();
        Cipher::new(ChannelMode::Secure, &KEY).decrypt(reply.cipher_block_mut());
        assert_eq!(reply.u8(0), 0x02);
        assert!(reply.validate_response(true).is_ok());
        assert_eq!(
            lock.events(),
            vec![
                SimEvent::Connected,
                SimEvent::KeyExchange { key_index: 1 }
            ]
        );
    }

    #[tokio::test]
    async fn dropping_the_link_ends_the_stream() {
        let lock = SimulatedLock::new(KEY);
        lock.connect().await.unwrap();
        let mut stream = lock.notifications().await.unwrap();
        lock.drop_link();
        assert!(stream.next().await.is_none());
        assert!(!lock.is_connected());
    }

    #[tokio::test]
    async fn writes_need_a_connection() {
        let lock = SimulatedLock::new(KEY);
        assert!(matches!(
            lock.write(COMMAND_WRITE_UUID, packet::forcelock().as_bytes()).await,
            Err(ProtocolError::Transport { .. })
        ));
    }
}
