//! BLE GATT constants for the August lock command service
//!
//! The lock exposes a single command service with two characteristic pairs:
//! the session pair carries routine commands, the secure pair carries the
//! key exchange and the terminate command.

use uuid::Uuid;

/// Command service: bd4ac610-0b45-11e3-8ffd-0800200c9a66
pub const COMMAND_SERVICE_UUID: Uuid = Uuid::from_u128(0xbd4ac610_0b45_11e3_8ffd_0800200c9a66);

/// Session channel, write
pub const COMMAND_WRITE_UUID: Uuid = Uuid::from_u128(0xbd4ac611_0b45_11e3_8ffd_0800200c9a66);

/// Session channel, read/notify
pub const COMMAND_READ_UUID: Uuid = Uuid::from_u128(0xbd4ac612_0b45_11e3_8ffd_0800200c9a66);

/// Secure channel, write
pub const SECURE_WRITE_UUID: Uuid = Uuid::from_u128(0xbd4ac613_0b45_11e3_8ffd_0800200c9a66);

/// Secure channel, read/notify
pub const SECURE_READ_UUID: Uuid = Uuid::from_u128(0xbd4ac614_0b45_11e3_8ffd_0800200c9a66);

/// Byte 0x00 of secure channel commands
pub mod secure {
    /// Send the mobile half of the session key, encrypted with the offline key
    pub const MOBILE_KEY_EXCHANGE: u8 = 0x01;

    /// Confirm the derived session key
    pub const INITIALIZATION: u8 = 0x03;

    /// Ask the lock to end the session before the link is dropped
    pub const TERMINATE: u8 = 0x05;

    /// Flag byte at 0x10 for every secure channel command
    pub const FLAG: u8 = 0x0f;
}

/// Session channel command bytes
pub mod session {
    /// Byte 0x00 of every session channel command
    pub const MAGIC: u8 = 0xee;

    /// Accepted values of byte 0x00 in session channel responses
    pub const RESPONSE_MAGIC: [u8; 2] = [0xbb, 0xaa];

    /// Flag byte at 0x10 for every session channel command
    pub const FLAG: u8 = 0x02;

    pub const OP_LOCK_STATUS: u8 = 0x02;
    pub const OP_EVERLOCK: u8 = 0x03;
    pub const OP_EVERLOCK_TIME: u8 = 0x04;
    pub const OP_UNLOCK: u8 = 0x0a;
    pub const OP_LOCK: u8 = 0x0b;

    /// Byte 0x04 of the status request
    pub const STATUS_FAMILY: u8 = 0x02;

    /// Byte 0x04 of the everlock requests
    pub const EVERLOCK_FAMILY: u8 = 0x28;

    /// Byte 0x08 of a status response
    pub const STATUS_UNLOCKED: u8 = 0x03;
    pub const STATUS_LOCKED: u8 = 0x05;
}

/// Everlock duration bounds, in seconds
pub mod everlock {
    pub const MIN_SECS: u16 = 10;
    pub const MAX_SECS: u16 = 300;
    pub const DEFAULT_SECS: u16 = 30;
}
