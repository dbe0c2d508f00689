//! August lock wire protocol - command buffers, checksums and bridge framing

pub mod ble;
pub mod bridge;
mod command;
mod error;
pub mod packet;

pub use command::{Command, LockStatus, Outcome, StatusRecord};
pub use error::ProtocolError;

/// Every command and response is exactly this long
pub const COMMAND_LEN: usize = 0x12;

/// Only the leading block is encrypted; the flag and key index bytes travel in clear
pub const CIPHER_LEN: usize = 0x10;

pub const OFFSET_MAGIC: usize = 0x00;
pub const OFFSET_OPCODE: usize = 0x01;
pub const OFFSET_SIMPLE_CHECKSUM: usize = 0x03;
pub const OFFSET_FAMILY: usize = 0x04;
pub const OFFSET_ARG: usize = 0x08;
pub const OFFSET_SECURITY_CHECKSUM: usize = 0x0c;
pub const OFFSET_FLAG: usize = 0x10;
pub const OFFSET_KEY_INDEX: usize = 0x11;

/// An 18 byte command or response, zero initialized, fields addressed by offset.
///
/// A fresh buffer is built for every exchange.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandBuffer([u8; COMMAND_LEN]);

impl CommandBuffer {
    pub fn new() -> Self {
        Self([0u8; COMMAND_LEN])
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; COMMAND_LEN] = data
            .try_into()
            .map_err(|_| ProtocolError::BadLength { len: data.len() })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// The leading 16 bytes, the part the cipher transforms in place
    pub fn cipher_block_mut(&mut self) -> &mut [u8; CIPHER_LEN] {
        (&mut self.0[..CIPHER_LEN])
            .try_into()
            .expect("CIPHER_LEN is within COMMAND_LEN")
    }

    pub fn u8(&self, offset: usize) -> u8 {
        self.0[offset]
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) -> &mut Self {
        self.0[offset] = value;
        self
    }

    pub fn u16_le(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.0[offset], self.0[offset + 1]])
    }

    pub fn set_u16_le(&mut self, offset: usize, value: u16) -> &mut Self {
        self.0[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32_le(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.0[offset],
            self.0[offset + 1],
            self.0[offset + 2],
            self.0[offset + 3],
        ])
    }

    pub fn set_u32_le(&mut self, offset: usize, value: u32) -> &mut Self {
        self.0[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        &self.0[start..end]
    }

    pub fn copy_in(&mut self, offset: usize, data: &[u8]) -> &mut Self {
        self.0[offset..offset + data.len()].copy_from_slice(data);
        self
    }

    /// Two's complement of the low byte of the byte sum.
    pub fn simple_checksum(&self) -> u8 {
        let total = self.0.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        0u8.wrapping_sub(total)
    }

    /// Writes the simple checksum at 0x03, computed with that byte zeroed.
    ///
    /// Must run after every other field is in place.
    pub fn stamp_simple_checksum(&mut self) -> &mut Self {
        self.0[OFFSET_SIMPLE_CHECKSUM] = 0;
        let checksum = self.simple_checksum();
        self.set_u8(OFFSET_SIMPLE_CHECKSUM, checksum)
    }

    /// `0 - (w0 + w1 + w2)` over the little endian words at 0x00, 0x04 and 0x08.
    pub fn security_checksum(&self) -> u32 {
        let sum = self
            .u32_le(0x00)
            .wrapping_add(self.u32_le(0x04))
            .wrapping_add(self.u32_le(0x08));
        0u32.wrapping_sub(sum)
    }

    pub fn stamp_security_checksum(&mut self) -> &mut Self {
        let checksum = self.security_checksum();
        self.set_u32_le(OFFSET_SECURITY_CHECKSUM, checksum)
    }

    /// Checks a decrypted response from either channel.
    pub fn validate_response(&self, secure: bool) -> Result<(), ProtocolError> {
        if secure {
            let computed = self.security_checksum();
            let carried = self.u32_le(OFFSET_SECURITY_CHECKSUM);
            if computed != carried {
                return Err(ProtocolError::ChecksumMismatch { computed, carried });
            }
        } else {
            let magic = self.u8(OFFSET_MAGIC);
            if !ble::session::RESPONSE_MAGIC.contains(&magic) {
                return Err(ProtocolError::BadMagic { magic });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommandBuffer({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn byte_sum(buf: &CommandBuffer) -> u8 {
        buf.as_bytes().iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    #[test]
    fn new_buffer_is_zeroed() {
        assert_eq!(CommandBuffer::new().as_bytes(), &[0u8; COMMAND_LEN]);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert_eq!(
            CommandBuffer::from_bytes(&[0u8; 17]),
            Err(ProtocolError::BadLength { len: 17 })
        );
        assert_eq!(
            CommandBuffer::from_bytes(&[0u8; 20]),
            Err(ProtocolError::BadLength { len: 20 })
        );
    }

    #[test]
    fn forcelock_checksum_matches_lock_capture() {
        let mut cmd = CommandBuffer::new();
        cmd.set_u8(0x00, 0xee).set_u8(0x01, 0x0b).set_u8(0x10, 0x02);
        assert_eq!(cmd.simple_checksum(), 0x05);
    }

    #[test]
    fn little_endian_accessors() {
        let mut cmd = CommandBuffer::new();
        cmd.set_u16_le(0x08, 0x1234).set_u32_le(0x0c, 0xdeadbeef);
        assert_eq!(cmd.slice(0x08, 0x0a), &[0x34, 0x12]);
        assert_eq!(cmd.slice(0x0c, 0x10), &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(cmd.u16_le(0x08), 0x1234);
        assert_eq!(cmd.u32_le(0x0c), 0xdeadbeef);
    }

    #[test]
    fn session_magic_is_checked() {
        let mut resp = CommandBuffer::new();
        resp.set_u8(0, 0xbb);
        assert!(resp.validate_response(false).is_ok());
        resp.set_u8(0, 0xaa);
        assert!(resp.validate_response(false).is_ok());
        resp.set_u8(0, 0xee);
        assert_eq!(
            resp.validate_response(false),
            Err(ProtocolError::BadMagic { magic: 0xee })
        );
    }

    #[test]
    fn corrupted_security_checksum_is_rejected() {
        let mut resp = CommandBuffer::new();
        resp.set_u8(0, 0x02).set_u32_le(0x04, 0x01020304);
        resp.stamp_security_checksum();
        assert!(resp.validate_response(true).is_ok());

        resp.set_u8(0x05, 0xff);
        assert!(matches!(
            resp.validate_response(true),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn stamped_simple_checksum_zeroes_byte_sum(bytes in prop::array::uniform18(any::<u8>())) {
            let mut buf = CommandBuffer::from_bytes(&bytes).unwrap();
            buf.stamp_simple_checksum();
            prop_assert_eq!(byte_sum(&buf), 0);
        }

        #[test]
        fn stamped_security_checksum_validates(w0 in any::<u32>(), w1 in any::<u32>(), w2 in any::<u32>(), tail in any::<[u8; 2]>()) {
            let mut buf = CommandBuffer::new();
            buf.set_u32_le(0x00, w0).set_u32_le(0x04, w1).set_u32_le(0x08, w2).copy_in(0x10, &tail);
            buf.stamp_security_checksum();
            prop_assert_eq!(buf.security_checksum(), buf.u32_le(OFFSET_SECURITY_CHECKSUM));
            prop_assert!(buf.validate_response(true).is_ok());
        }
    }
}
