//! Entry point for applications: scan for fixtures and open sessions.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::MeshConfig;
use crate::connection::{SessionManager, SessionState};
use crate::connection::manager::SessionCore;
use crate::discovery;
use crate::error::{MeshError, Result, TransportError};
use crate::state::{Device, Roster};
use crate::transport::{Link, Transport};

/// Owns the transport, the configuration and the device roster. Any number
/// of sessions to different fixtures can be open at once.
pub struct MeshClient {
    transport: Arc<dyn Transport>,
    config: MeshConfig,
    roster: Arc<Mutex<Roster>>,
    sessions: Mutex<Vec<Weak<SessionCore>>>,
}

impl MeshClient {
    pub fn new(transport: Arc<dyn Transport>, config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let roster = Roster::new(config.session.unreachable_budget);
        Ok(Self {
            transport,
            config,
            roster: Arc::new(Mutex::new(roster)),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn roster(&self) -> Arc<Mutex<Roster>> {
        self.roster.clone()
    }

    /// Devices currently on the roster, strongest signal first
    pub async fn devices(&self) -> Vec<Device> {
        self.roster.lock().await.devices()
    }

    /// Scan for mesh fixtures and add them to the roster
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<Device>> {
        info!("Scanning for mesh fixtures for {:?}", timeout);
        let devices =
            discovery::scan(self.transport.as_ref(), &self.config.discovery, timeout).await?;

        let mut roster = self.roster.lock().await;
        for device in &devices {
            roster.observe(device.clone());
        }
        Ok(devices)
    }

    /// Open a link and log in. Connection attempts are retried with backoff;
    /// a device that stays unreachable is eventually dropped from the roster.
    pub async fn connect(&self, device: &Device) -> Result<SessionManager> {
        self.roster.lock().await.observe(device.clone());

        let link = match self.open_link(device).await {
            Ok(link) => link,
            Err(e) => {
                self.roster
                    .lock()
                    .await
                    .record_unreachable(&device.transport_id);
                return Err(MeshError::Connection(e));
            }
        };

        let session =
            SessionManager::establish(link, device.clone(), &self.config, self.roster.clone())
                .await?;

        let mut sessions = self.sessions.lock().await;
        sessions.retain(|core| core.strong_count() > 0);
        sessions.push(Arc::downgrade(session.core()));
        Ok(session)
    }

    async fn open_link(
        &self,
        device: &Device,
    ) -> std::result::Result<Arc<dyn Link>, TransportError> {
        let session = &self.config.session;
        let mut attempt = 0;

        loop {
            let connecting = self.transport.connect(&device.transport_id);
            let result = tokio::time::timeout(session.connect_timeout(), connecting)
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::Connect(format!(
                        "timed out after {:?}",
                        session.connect_timeout()
                    )))
                });

            match result {
                Ok(link) => return Ok(link),
                Err(e @ TransportError::DeviceNotFound(_)) => return Err(e),
                Err(e) if attempt < session.connect_retries => {
                    attempt += 1;
                    let delay = session.backoff(attempt);
                    warn!(
                        "Connect to {} failed: {} (retry {}/{} in {:?})",
                        device.transport_id, e, attempt, session.connect_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn disconnect(&self, session: &SessionManager) -> Result<()> {
        session.disconnect().await
    }

    /// Close every session this client opened that is still alive. Returns
    /// how many were closed; the first error is reported after all of them
    /// were tried.
    pub async fn disconnect_all(&self) -> Result<usize> {
        let open: Vec<Arc<SessionCore>> = self
            .sessions
            .lock()
            .await
            .drain(..)
            .filter_map(|core| core.upgrade())
            .collect();

        let mut closed = 0;
        let mut first_error = None;
        for core in open {
            if core.state().await == SessionState::Disconnected {
                continue;
            }
            match core.disconnect().await {
                Ok(()) => closed += 1,
                Err(e) => {
                    warn!("Failed to disconnect {}: {}", core.transport_id(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        info!("Closed {} sessions", closed);
        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }
}
