/// Everything that can end a lock operation early.
///
/// Serializable so that a failure raised inside the bridge process reaches
/// the HTTP front end with its kind intact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolError {
    #[error("expected exactly one command service, found {found}")]
    ServiceNotFound { found: usize },
    #[error("characteristic {uuid} not found")]
    CharacteristicMissing { uuid: String },
    #[error("security checksum mismatch: computed 0x{computed:08x}, response carries 0x{carried:08x}")]
    ChecksumMismatch { computed: u32, carried: u32 },
    #[error("unexpected magic in response: 0x{magic:02x}")]
    BadMagic { magic: u8 },
    #[error("expected an 18 byte buffer, got {len} bytes")]
    BadLength { len: usize },
    #[error("BLE transport error: {message}")]
    Transport { message: String },
    #[error("no response notification within {millis} ms")]
    Timeout { millis: u64 },
    #[error("link dropped while waiting for a response")]
    Disconnected,
    #[error("an exchange is already outstanding on this channel")]
    Busy,
    #[error("invalid offline key: {reason}")]
    InvalidKey { reason: String },
    #[error("unknown command: {name}")]
    UnknownCommand { name: String },
    #[error("lock controller has shut down")]
    ControllerClosed,
}

impl ProtocolError {
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Self::Transport { message: e.to_string() }
    }

    /// Errors after which the session keys can no longer be trusted and the
    /// link has to be rebuilt before the next command.
    pub fn drops_link(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Disconnected
        )
    }
}
