//! Byte-moving abstraction over a BLE link.
//!
//! Nothing in here knows about frames, keys or sequence numbers. A
//! [`Transport`] finds and opens links; a [`Link`] writes bytes to the
//! command characteristic and streams notifications back.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::TransportError;

#[cfg(feature = "bluetooth")]
pub mod ble;
pub mod simulated;

/// Opaque handle the transport uses to find a peripheral again
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportId(pub String);

impl TransportId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One advertisement observed during a scan
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    pub transport_id: TransportId,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Advertisements seen within `timeout`. The stream ends when the window
    /// closes; calling `scan` again starts a fresh window.
    async fn scan(
        &self,
        timeout: Duration,
    ) -> Result<BoxStream<'static, Advertisement>, TransportError>;

    async fn connect(&self, id: &TransportId) -> Result<Arc<dyn Link>, TransportError>;
}

#[async_trait]
pub trait Link: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Write one frame to the command characteristic
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Notifications from the status characteristic. The stream ends when
    /// the link goes away.
    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
