//! BLE backend on btleplug: discovery, and [`BleLink`] for a real peripheral

use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use augustctl_proto::ProtocolError;
use augustctl_proto::ble::COMMAND_SERVICE_UUID;

use crate::controller::LockHandle;
use crate::link::{BleLink, GattService, Notification};

/// A peripheral seen while scanning
#[derive(Debug, Clone)]
pub struct LockDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises the lock command service
    pub is_lock: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, ProtocolError> {
    let manager = Manager::new().await.map_err(ProtocolError::transport)?;
    let adapters = manager.adapters().await.map_err(ProtocolError::transport)?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| ProtocolError::transport("no Bluetooth adapter found"))
}

/// Lists every peripheral seen during `duration`.
pub async fn scan(adapter: &Adapter, duration: Duration) -> Result<Vec<LockDevice>, ProtocolError> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(ProtocolError::transport)?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await.map_err(ProtocolError::transport)?;
    let mut devices = Vec::new();
    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await.map_err(ProtocolError::transport)? {
            devices.push(LockDevice {
                name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                address: peripheral.address().to_string(),
                rssi: props.rssi,
                is_lock: props.services.contains(&COMMAND_SERVICE_UUID),
            });
        }
    }

    adapter.stop_scan().await.map_err(ProtocolError::transport)?;
    Ok(devices)
}

/// Scans until a peripheral advertising the command service shows up,
/// optionally only the one at `address`.
pub async fn find_lock(
    adapter: &Adapter,
    address: Option<&str>,
    timeout: Duration,
) -> Result<BtleLink, ProtocolError> {
    adapter
        .start_scan(ScanFilter {
            services: vec![COMMAND_SERVICE_UUID],
        })
        .await
        .map_err(ProtocolError::transport)?;

    let deadline = tokio::time::Instant::now() + timeout;
    let found = loop {
        if let Some(peripheral) = matching_peripheral(adapter, address).await? {
            break Some(peripheral);
        }
        if tokio::time::Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    adapter.stop_scan().await.map_err(ProtocolError::transport)?;
    let peripheral = found.ok_or(ProtocolError::ServiceNotFound { found: 0 })?;
    info!(address = %peripheral.address(), "found lock");
    Ok(BtleLink::new(peripheral))
}

async fn matching_peripheral(
    adapter: &Adapter,
    address: Option<&str>,
) -> Result<Option<Peripheral>, ProtocolError> {
    for peripheral in adapter.peripherals().await.map_err(ProtocolError::transport)? {
        let Some(props) = peripheral.properties().await.map_err(ProtocolError::transport)? else {
            continue;
        };
        if !props.services.contains(&COMMAND_SERVICE_UUID) {
            continue;
        }
        let addr = peripheral.address().to_string();
        match address {
            Some(want) if !addr.eq_ignore_ascii_case(want) => {
                debug!(address = %addr, "skipping lock, not the configured one");
            }
            _ => return Ok(Some(peripheral)),
        }
    }
    Ok(None)
}

/// Reports adapter-level disconnects of `link` to the controller, since the
/// notification stream does not end on every platform.
pub async fn watch_disconnects(
    adapter: Adapter,
    link: Arc<BtleLink>,
    handle: LockHandle,
) -> Result<(), ProtocolError> {
    let mut events = adapter.events().await.map_err(ProtocolError::transport)?;
    let id = link.peripheral_id();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if handle.is_closed() {
                break;
            }
            if let CentralEvent::DeviceDisconnected(gone) = event {
                if gone == id {
                    warn!(lock = %link.id(), "adapter reports disconnect");
                    handle.link_lost();
                }
            }
        }
    });
    Ok(())
}

/// [`BleLink`] over a btleplug peripheral
pub struct BtleLink {
    peripheral: Peripheral,
}

impl BtleLink {
    pub fn new(peripheral: Peripheral) -> Self {
        Self { peripheral }
    }

    pub fn peripheral_id(&self) -> PeripheralId {
        self.peripheral.id()
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, ProtocolError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(ProtocolError::CharacteristicMissing {
                uuid: uuid.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl BleLink for BtleLink {
    fn id(&self) -> String {
        self.peripheral.address().to_string()
    }

    async fn connect(&self) -> Result<(), ProtocolError> {
        if self.peripheral.is_connected().await.map_err(ProtocolError::transport)? {
            return Ok(());
        }
        self.peripheral.connect().await.map_err(ProtocolError::transport)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, ProtocolError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(ProtocolError::transport)?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s.characteristics.into_iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), ProtocolError> {
        let ch = self.characteristic(characteristic)?;
        self.peripheral
            .subscribe(&ch)
            .await
            .map_err(ProtocolError::transport)
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>, ProtocolError> {
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(ProtocolError::transport)?;
        Ok(stream
            .map(|n| Notification {
                characteristic: n.uuid,
                value: n.value,
            })
            .boxed())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), ProtocolError> {
        let ch = self.characteristic(characteristic)?;
        self.peripheral
            .write(&ch, value, WriteType::WithResponse)
            .await
            .map_err(ProtocolError::transport)
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(ProtocolError::transport)
    }
}

/// Finds the lock, hands it to the controller and keeps watching for
/// adapter disconnects.
pub async fn attach(
    handle: &LockHandle,
    address: Option<&str>,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let adapter = get_adapter().await?;
    let link = Arc::new(find_lock(&adapter, address, timeout).await?);
    watch_disconnects(adapter, link.clone(), handle.clone()).await?;
    handle.discovered(link);
    Ok(())
}
