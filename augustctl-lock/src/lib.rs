//! August lock driver: cipher channels, handshake, command vocabulary and the
//! single-flight command queue.
//!
//! The radio sits behind [`BleLink`]; with the `btleplug` feature a real
//! adapter implements it, tests use a simulated lock instead.

pub mod bridge;
#[cfg(feature = "btleplug")]
pub mod btle;
pub mod cipher;
pub mod controller;
pub mod driver;
pub mod link;
pub mod session;

pub use bridge::{BridgeClient, BridgeError, ProcessSpawner, Submitter};
pub use controller::{ControllerSnapshot, ExecutionState, LockController, LockHandle, TransportState};
pub use driver::{Lock, LockConfig, LockConnection};
pub use link::{BleLink, GattService, Notification};

pub use augustctl_proto::{Command, LockStatus, Outcome, ProtocolError, StatusRecord};
