//! The BLE primitives the driver needs from a radio stack

use futures::stream::BoxStream;
use uuid::Uuid;

use augustctl_proto::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// A value pushed by the peripheral on a characteristic we subscribed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// One peripheral reachable over BLE.
///
/// Every call may suspend and may fail; failures are reported as
/// [`ProtocolError::Transport`] unless a more specific kind applies.
#[async_trait::async_trait]
pub trait BleLink: Send + Sync + 'static {
    /// Address or other identity, for logs
    fn id(&self) -> String;

    async fn connect(&self) -> Result<(), ProtocolError>;

    async fn discover_services(&self) -> Result<Vec<GattService>, ProtocolError>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), ProtocolError>;

    /// Every notification from every subscribed characteristic. The stream
    /// ends when the link goes down.
    async fn notifications(&self) -> Result<BoxStream<'static, Notification>, ProtocolError>;

    /// Write with response
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), ProtocolError>;

    async fn disconnect(&self) -> Result<(), ProtocolError>;
}
