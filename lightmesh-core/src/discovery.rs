//! Picking mesh fixtures out of the advertisements a scan turns up.

use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::codec::LOCAL_ADDRESS;
use crate::config::DiscoveryConfig;
use crate::error::{MeshError, Result};
use crate::state::Device;
use crate::transport::{Advertisement, Transport};

/// Whether an advertisement carries the mesh service signature: a known
/// service UUID, or a local name containing one of the configured patterns.
pub fn is_mesh_fixture(advert: &Advertisement, config: &DiscoveryConfig) -> bool {
    if advert
        .service_uuids
        .iter()
        .any(|uuid| config.service_uuids.contains(uuid))
    {
        return true;
    }

    let Some(name) = advert.local_name.as_deref() else {
        return false;
    };
    let name = name.to_lowercase();
    config
        .name_patterns
        .iter()
        .any(|pattern| name.contains(&pattern.to_lowercase()))
}

/// Mesh address from the first two bytes of manufacturer data. Falls back to
/// the directly connected node when the fixture does not advertise one.
pub fn mesh_address(advert: &Advertisement) -> u16 {
    let mut company_ids: Vec<&u16> = advert.manufacturer_data.keys().collect();
    company_ids.sort();

    company_ids
        .into_iter()
        .filter_map(|id| advert.manufacturer_data.get(id))
        .find(|data| data.len() >= 2)
        .map(|data| u16::from_le_bytes([data[0], data[1]]))
        .unwrap_or(LOCAL_ADDRESS)
}

pub fn device_from(advert: &Advertisement) -> Device {
    let mut device = Device::new(mesh_address(advert), advert.transport_id.clone());
    device.name = advert.local_name.clone();
    device.rssi = advert.rssi;
    device
}

/// Scan for `timeout` and return each matching fixture once, strongest
/// signal first
pub async fn scan(
    transport: &dyn Transport,
    config: &DiscoveryConfig,
    timeout: Duration,
) -> Result<Vec<Device>> {
    let mut adverts = transport
        .scan(timeout)
        .await
        .map_err(MeshError::Connection)?;

    let mut found: HashMap<_, Device> = HashMap::new();
    let mut ignored = 0usize;
    while let Some(advert) = adverts.next().await {
        if !is_mesh_fixture(&advert, config) {
            ignored += 1;
            continue;
        }
        debug!(
            "Mesh fixture {} ({}) rssi {:?}",
            advert.transport_id,
            advert.local_name.as_deref().unwrap_or("unnamed"),
            advert.rssi
        );
        found.insert(advert.transport_id.clone(), device_from(&advert));
    }

    info!(
        "Scan found {} mesh fixture(s), ignored {} advertisement(s)",
        found.len(),
        ignored
    );

    let mut devices: Vec<Device> = found.into_values().collect();
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    Ok(devices)
}
