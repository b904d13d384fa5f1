use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::command::LightStatus;
use crate::transport::TransportId;

/// A fixture seen during a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub mesh_address: u16,
    pub transport_id: TransportId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub last_seen: DateTime<Utc>,
    pub is_authenticated: bool,
    /// Last state the fixture reported, if any
    pub status: Option<LightStatus>,
    /// Consecutive failed exchanges
    #[serde(skip)]
    pub failures: u32,
}

impl Device {
    pub fn new(mesh_address: u16, transport_id: TransportId) -> Self {
        Self {
            mesh_address,
            transport_id,
            name: None,
            rssi: None,
            last_seen: Utc::now(),
            is_authenticated: false,
            status: None,
            failures: 0,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Every fixture the client knows about, keyed by transport id
#[derive(Debug, Clone, Default)]
pub struct Roster {
    devices: HashMap<TransportId, Device>,
    unreachable_budget: u32,
}

impl Roster {
    pub fn new(unreachable_budget: u32) -> Self {
        Self {
            devices: HashMap::new(),
            unreachable_budget,
        }
    }

    /// Insert a fresh scan observation, keeping session facts already known
    pub fn observe(&mut self, device: Device) {
        match self.devices.get_mut(&device.transport_id) {
            Some(known) => {
                known.mesh_address = device.mesh_address;
                known.name = device.name.or(known.name.take());
                known.rssi = device.rssi.or(known.rssi);
                known.last_seen = device.last_seen;
            }
            None => {
                debug!(
                    "New device {} at mesh address {:#06x}",
                    device.transport_id, device.mesh_address
                );
                self.devices.insert(device.transport_id.clone(), device);
            }
        }
    }

    pub fn get(&self, id: &TransportId) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Devices ordered by signal strength, strongest first
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| {
            b.rssi
                .unwrap_or(i16::MIN)
                .cmp(&a.rssi.unwrap_or(i16::MIN))
                .then_with(|| a.transport_id.cmp(&b.transport_id))
        });
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn mark_authenticated(&mut self, id: &TransportId, authenticated: bool) {
        if let Some(device) = self.devices.get_mut(id) {
            device.is_authenticated = authenticated;
        }
    }

    /// A frame was exchanged successfully
    pub fn record_exchange(&mut self, id: &TransportId) {
        if let Some(device) = self.devices.get_mut(id) {
            device.last_seen = Utc::now();
            device.failures = 0;
        }
    }

    pub fn update_status(&mut self, id: &TransportId, status: LightStatus) {
        if let Some(device) = self.devices.get_mut(id) {
            device.status = Some(status);
            device.last_seen = Utc::now();
        }
    }

    /// The transport could not reach the device. Returns true when the
    /// device exhausted its budget and was dropped.
    pub fn record_unreachable(&mut self, id: &TransportId) -> bool {
        let Some(device) = self.devices.get_mut(id) else {
            return false;
        };

        device.failures += 1;
        device.is_authenticated = false;
        if device.failures < self.unreachable_budget {
            debug!(
                "Device {} unreachable ({}/{})",
                id, device.failures, self.unreachable_budget
            );
            return false;
        }

        info!(
            "Dropping device {} after {} unreachable attempts",
            id, device.failures
        );
        self.devices.remove(id);
        true
    }
}
