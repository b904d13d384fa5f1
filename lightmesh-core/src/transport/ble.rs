//! btleplug-backed transport for real fixtures.

use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Advertisement, Link, Transport, TransportId};
use crate::config::DiscoveryConfig;
use crate::error::TransportError;

fn other(e: btleplug::Error) -> TransportError {
    TransportError::Other(e.to_string())
}

pub struct BleTransport {
    adapter: Adapter,
    discovery: DiscoveryConfig,
}

impl BleTransport {
    /// Use the first Bluetooth adapter the platform reports
    pub async fn new(discovery: DiscoveryConfig) -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(other)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(other)?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        info!(
            "Using Bluetooth adapter {}",
            adapter.adapter_info().await.unwrap_or_default()
        );
        Ok(Self { adapter, discovery })
    }

    async fn find_peripheral(&self, id: &TransportId) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await.map_err(other)? {
            if peripheral.address().to_string() == id.as_str() {
                return Ok(peripheral);
            }
        }
        Err(TransportError::DeviceNotFound(id.to_string()))
    }
}

async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let props = peripheral.properties().await.ok()??;

    Some(Advertisement {
        transport_id: TransportId(peripheral.address().to_string()),
        local_name: props.local_name,
        rssi: props.rssi,
        service_uuids: props.services,
        manufacturer_data: props.manufacturer_data,
    })
}

/// First characteristic from `candidates` the peripheral exposes with one of
/// the required properties
fn pick_characteristic(
    available: &BTreeSet<Characteristic>,
    candidates: &[Uuid],
    required: CharPropFlags,
) -> Option<Characteristic> {
    candidates.iter().find_map(|uuid| {
        available
            .iter()
            .find(|c| c.uuid == *uuid && c.properties.intersects(required))
            .cloned()
    })
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(
        &self,
        timeout: Duration,
    ) -> Result<BoxStream<'static, Advertisement>, TransportError> {
        let events = self.adapter.events().await.map_err(other)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(other)?;
        debug!("BLE scan started for {:?}", timeout);

        let adapter = self.adapter.clone();
        let seen = events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    match event {
                        CentralEvent::DeviceDiscovered(id)
                        | CentralEvent::DeviceUpdated(id)
                        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                        | CentralEvent::ServicesAdvertisement { id, .. } => {
                            advertisement_for(&adapter, &id).await.map(Some)
                        }
                        _ => None,
                    }
                }
            })
            .take_until(tokio::time::sleep(timeout));

        let adapter = self.adapter.clone();
        let stop = stream::once(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
            None
        });

        Ok(seen
            .chain(stop)
            .filter_map(|adv| async move { adv })
            .boxed())
    }

    async fn connect(&self, id: &TransportId) -> Result<Arc<dyn Link>, TransportError> {
        let peripheral = self.find_peripheral(id).await?;

        info!("Connecting to {}", id);
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        let command = pick_characteristic(
            &characteristics,
            &self.discovery.command_characteristics,
            CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
        )
        .ok_or_else(|| TransportError::CharacteristicNotFound("command".to_string()))?;
        let notify = pick_characteristic(
            &characteristics,
            &self.discovery.notify_characteristics,
            CharPropFlags::NOTIFY | CharPropFlags::INDICATE,
        )
        .ok_or_else(|| TransportError::CharacteristicNotFound("status".to_string()))?;

        debug!(
            "Command characteristic {}, status characteristic {}",
            command.uuid, notify.uuid
        );

        Ok(Arc::new(BleLink {
            id: id.clone(),
            peripheral,
            command,
            notify,
        }))
    }
}

pub struct BleLink {
    id: TransportId,
    peripheral: Peripheral,
    command: Characteristic,
    notify: Characteristic,
}

#[async_trait]
impl Link for BleLink {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            return Err(TransportError::Closed);
        }

        let write_type = if self.command.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(&self.command, bytes, write_type)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        self.peripheral
            .subscribe(&self.notify)
            .await
            .map_err(other)?;
        let notifications = self.peripheral.notifications().await.map_err(other)?;

        let uuid = self.notify.uuid;
        Ok(notifications
            .filter_map(move |n| async move { (n.uuid == uuid).then_some(n.value) })
            .boxed())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await.map_err(other)
    }
}
