//! Builders for every command the lock understands, and readers for the
//! fields its responses carry.

use crate::ble::{everlock, secure, session};
use crate::{
    CommandBuffer, LockStatus, OFFSET_ARG, OFFSET_FAMILY, OFFSET_FLAG, OFFSET_KEY_INDEX,
    OFFSET_MAGIC, OFFSET_OPCODE,
};

/// Resolves a requested everlock duration.
///
/// Missing requests and requests under the floor take the default; the result
/// is always within the lock's accepted range.
pub fn everlock_seconds(requested: Option<u16>, default: u16) -> u16 {
    match requested {
        Some(t) if t >= everlock::MIN_SECS => t.min(everlock::MAX_SECS),
        _ => default.clamp(everlock::MIN_SECS, everlock::MAX_SECS),
    }
}

fn session_command(opcode: u8) -> CommandBuffer {
    let mut cmd = CommandBuffer::new();
    cmd.set_u8(OFFSET_MAGIC, session::MAGIC)
        .set_u8(OFFSET_OPCODE, opcode)
        .set_u8(OFFSET_FLAG, session::FLAG);
    cmd
}

pub fn forcelock() -> CommandBuffer {
    let mut cmd = session_command(session::OP_LOCK);
    cmd.stamp_simple_checksum();
    cmd
}

pub fn forceunlock() -> CommandBuffer {
    let mut cmd = session_command(session::OP_UNLOCK);
    cmd.stamp_simple_checksum();
    cmd
}

pub fn lock_status() -> CommandBuffer {
    let mut cmd = session_command(session::OP_LOCK_STATUS);
    cmd.set_u8(OFFSET_FAMILY, session::STATUS_FAMILY);
    cmd.stamp_simple_checksum();
    cmd
}

/// `seconds` must already be resolved through [`everlock_seconds`].
pub fn everlock_on(seconds: u16) -> CommandBuffer {
    let mut cmd = session_command(session::OP_EVERLOCK);
    cmd.set_u8(OFFSET_FAMILY, session::EVERLOCK_FAMILY)
        .set_u16_le(OFFSET_ARG, seconds)
        .set_u16_le(OFFSET_ARG + 2, seconds);
    cmd.stamp_simple_checksum();
    cmd
}

pub fn everlock_off() -> CommandBuffer {
    let mut cmd = session_command(session::OP_EVERLOCK);
    cmd.set_u8(OFFSET_FAMILY, session::EVERLOCK_FAMILY);
    cmd.stamp_simple_checksum();
    cmd
}

pub fn everlock_time() -> CommandBuffer {
    let mut cmd = session_command(session::OP_EVERLOCK_TIME);
    cmd.set_u8(OFFSET_FAMILY, session::EVERLOCK_FAMILY);
    cmd.stamp_simple_checksum();
    cmd
}

fn handshake_command(subcommand: u8, half: &[u8], key_index: u8) -> CommandBuffer {
    let mut cmd = CommandBuffer::new();
    cmd.set_u8(OFFSET_MAGIC, subcommand)
        .copy_in(OFFSET_FAMILY, half)
        .set_u8(OFFSET_FLAG, secure::FLAG)
        .set_u8(OFFSET_KEY_INDEX, key_index);
    cmd
}

/// First handshake step, carries `handshake_keys[0..8]`.
pub fn mobile_key_exchange(handshake_keys: &[u8; 16], key_index: u8) -> CommandBuffer {
    handshake_command(secure::MOBILE_KEY_EXCHANGE, &handshake_keys[..8], key_index)
}

/// Second handshake step, carries `handshake_keys[8..16]`.
pub fn initialization(handshake_keys: &[u8; 16], key_index: u8) -> CommandBuffer {
    handshake_command(secure::INITIALIZATION, &handshake_keys[8..], key_index)
}

pub fn terminate() -> CommandBuffer {
    let mut cmd = CommandBuffer::new();
    cmd.set_u8(OFFSET_MAGIC, secure::TERMINATE)
        .set_u8(OFFSET_FLAG, secure::FLAG);
    cmd
}

/// Mobile half from the handshake keys, lock half from the key exchange response.
pub fn derive_session_key(handshake_keys: &[u8; 16], response: &CommandBuffer) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&handshake_keys[..8]);
    key[8..].copy_from_slice(response.slice(0x04, 0x0c));
    key
}

pub fn read_lock_status(response: &CommandBuffer) -> LockStatus {
    LockStatus::from_byte(response.u8(OFFSET_ARG))
}

pub fn read_everlock_time(response: &CommandBuffer) -> u16 {
    response.u16_le(OFFSET_ARG)
}
