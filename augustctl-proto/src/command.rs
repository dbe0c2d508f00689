use crate::ProtocolError;

/// The lock command vocabulary, as submitted to the controller.
///
/// Everlock durations are in seconds; `None` means the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Lock,
    Unlock,
    ForceLock,
    ForceUnlock,
    GetLockStatus,
    GetEverlockTime,
    GetAllStatus,
    EverlockOn(Option<u16>),
    EverlockOff,
    EverlockOnLock(Option<u16>),
    EverlockOffUnlock,
    Disconnect,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Lock => "lock",
            Command::Unlock => "unlock",
            Command::ForceLock => "forcelock",
            Command::ForceUnlock => "forceunlock",
            Command::GetLockStatus => "getLockStatus",
            Command::GetEverlockTime => "getEverlockTime",
            Command::GetAllStatus => "getAllStatus",
            Command::EverlockOn(_) => "everlockOn",
            Command::EverlockOff => "everlockOff",
            Command::EverlockOnLock(_) => "everlockOnLock",
            Command::EverlockOffUnlock => "everlockOffUnlock",
            Command::Disconnect => "disconnect",
        }
    }

    pub fn argument(&self) -> Option<u16> {
        match self {
            Command::EverlockOn(t) | Command::EverlockOnLock(t) => *t,
            _ => None,
        }
    }

    /// Rebuilds a command from its name and optional argument.
    ///
    /// Commands that take no argument ignore one if given.
    pub fn from_parts(name: &str, argument: Option<u16>) -> Result<Self, ProtocolError> {
        Ok(match name {
            "lock" => Command::Lock,
            "unlock" => Command::Unlock,
            "forcelock" => Command::ForceLock,
            "forceunlock" => Command::ForceUnlock,
            "getLockStatus" => Command::GetLockStatus,
            "getEverlockTime" => Command::GetEverlockTime,
            "getAllStatus" => Command::GetAllStatus,
            "everlockOn" => Command::EverlockOn(argument),
            "everlockOff" => Command::EverlockOff,
            "everlockOnLock" => Command::EverlockOnLock(argument),
            "everlockOffUnlock" => Command::EverlockOffUnlock,
            "disconnect" => Command::Disconnect,
            other => {
                return Err(ProtocolError::UnknownCommand {
                    name: other.to_string(),
                });
            }
        })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.argument() {
            Some(arg) => write!(f, "{}({arg})", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Locked,
    Unlocked,
    Unknown,
}

impl LockStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            crate::ble::session::STATUS_UNLOCKED => LockStatus::Unlocked,
            crate::ble::session::STATUS_LOCKED => LockStatus::Locked,
            _ => LockStatus::Unknown,
        }
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LockStatus::Locked => "locked",
            LockStatus::Unlocked => "unlocked",
            LockStatus::Unknown => "unknown",
        })
    }
}

/// Combined answer of `getAllStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusRecord {
    pub lock: LockStatus,
    pub everlocktime: u16,
}

/// What a successfully executed command produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Done,
    Status(LockStatus),
    EverlockTime(u16),
    AllStatus(StatusRecord),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_parts() {
        let all = [
            Command::Lock,
            Command::Unlock,
            Command::ForceLock,
            Command::ForceUnlock,
            Command::GetLockStatus,
            Command::GetEverlockTime,
            Command::GetAllStatus,
            Command::EverlockOn(Some(45)),
            Command::EverlockOff,
            Command::EverlockOnLock(None),
            Command::EverlockOffUnlock,
            Command::Disconnect,
        ];
        for cmd in all {
            assert_eq!(Command::from_parts(cmd.name(), cmd.argument()), Ok(cmd));
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert_eq!(
            Command::from_parts("open_sesame", None),
            Err(ProtocolError::UnknownCommand {
                name: "open_sesame".to_string()
            })
        );
    }

    #[test]
    fn status_byte_mapping() {
        assert_eq!(LockStatus::from_byte(0x05), LockStatus::Locked);
        assert_eq!(LockStatus::from_byte(0x03), LockStatus::Unlocked);
        assert_eq!(LockStatus::from_byte(0x7f), LockStatus::Unknown);
    }

    #[test]
    fn status_record_json_shape() {
        let record = StatusRecord {
            lock: LockStatus::Locked,
            everlocktime: 60,
        };
        assert_eq!(
            serde_json::to_value(record).unwrap(),
            serde_json::json!({"lock": "locked", "everlocktime": 60})
        );
    }
}
