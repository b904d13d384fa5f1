//! Mesh credentials, discovery filters and session tuning, loadable from JSON.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::crypto::{SessionKey, derive_session_key};
use crate::error::ConfigError;

/// Fixture firmware keeps name and password in 16-byte slots
pub const MAX_CREDENTIAL_LEN: usize = 16;

/// Name/password pair shared by every fixture in one mesh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshIdentity {
    name: String,
    password: String,
}

impl MeshIdentity {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Result<Self, ConfigError> {
        let identity = Self {
            name: name.into(),
            password: password.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Credentials recovered from the vendor app for URBARN fixtures
    pub fn urbarn() -> Self {
        Self {
            name: "URBARN".to_string(),
            password: "15102".to_string(),
        }
    }

    /// Fallback credentials used by Fulife-branded fixtures
    pub fn fulife() -> Self {
        Self {
            name: "Fulife".to_string(),
            password: "2846".to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn session_key(&self) -> SessionKey {
        derive_session_key(&self.name, &self.password)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("name", &self.name), ("password", &self.password)] {
            if value.is_empty() {
                return Err(ConfigError::InvalidIdentity(format!("mesh {field} is empty")));
            }
            if value.len() > MAX_CREDENTIAL_LEN {
                return Err(ConfigError::InvalidIdentity(format!(
                    "mesh {field} is {len} bytes, max {MAX_CREDENTIAL_LEN}",
                    len = value.len()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for MeshIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshIdentity")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for MeshIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// 16-bit Bluetooth SIG UUID expanded onto the base UUID
const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

pub const MESH_PROVISIONING_SERVICE: Uuid = sig_uuid(0x1827);
pub const MESH_PROXY_SERVICE: Uuid = sig_uuid(0x1828);
pub const TELINK_MESH_SERVICE: Uuid = Uuid::from_u128(0x00010203_0405_0607_0809_0a0b0c0d1910);
pub const TELINK_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x00010203_0405_0607_0809_0a0b0c0d1911);
pub const TELINK_COMMAND_CHAR: Uuid = Uuid::from_u128(0x00010203_0405_0607_0809_0a0b0c0d1912);
pub const NORDIC_UART_TX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const NORDIC_UART_RX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// How fixtures are recognized and which characteristics carry frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Advertised services that mark a mesh fixture
    pub service_uuids: Vec<Uuid>,
    /// Case-insensitive local-name fragments that mark a mesh fixture
    pub name_patterns: Vec<String>,
    /// Write characteristics to try, in order
    pub command_characteristics: Vec<Uuid>,
    /// Notify characteristics to try, in order
    pub notify_characteristics: Vec<Uuid>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_uuids: vec![
                TELINK_MESH_SERVICE,
                MESH_PROVISIONING_SERVICE,
                MESH_PROXY_SERVICE,
                sig_uuid(0xfe59),
                sig_uuid(0x16fe),
            ],
            name_patterns: vec!["URBARN".to_string(), "Fulife".to_string()],
            command_characteristics: vec![
                TELINK_COMMAND_CHAR,
                NORDIC_UART_TX,
                sig_uuid(0xfff1),
                sig_uuid(0x2a04),
            ],
            notify_characteristics: vec![
                TELINK_NOTIFY_CHAR,
                NORDIC_UART_RX,
                sig_uuid(0xfff2),
                sig_uuid(0xfff4),
                sig_uuid(0x2a05),
            ],
        }
    }
}

/// Timeouts, retry bounds and failure thresholds for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub connect_retries: u32,
    pub handshake_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Consecutive auth/transport failures before the session is invalidated
    pub failure_threshold: u32,
    /// Re-handshakes a single command may trigger before giving up. Also
    /// bounds the logins tried in the background after an idle session is
    /// invalidated; 0 leaves recovery to the next command.
    pub rehandshake_attempts: u32,
    pub write_retries: u32,
    /// Base delay, doubled after each failed write or connect
    pub retry_backoff_ms: u64,
    /// Failed exchanges before a device is dropped from the roster
    pub unreachable_budget: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            connect_retries: 2,
            handshake_timeout_ms: 3_000,
            ack_timeout_ms: 2_000,
            failure_threshold: 3,
            rehandshake_attempts: 2,
            write_retries: 3,
            retry_backoff_ms: 100,
            unreachable_budget: 3,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Everything the client needs, passed in explicitly at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Identities tried in order during the handshake
    pub credentials: Vec<MeshIdentity>,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            credentials: vec![MeshIdentity::urbarn(), MeshIdentity::fulife()],
            discovery: DiscoveryConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Put `identity` ahead of the configured ones, dropping any duplicate
    pub fn with_primary(mut self, identity: MeshIdentity) -> Self {
        self.credentials.retain(|existing| existing != &identity);
        self.credentials.insert(0, identity);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one mesh identity is required".to_string(),
            ));
        }
        for identity in &self.credentials {
            identity.validate()?;
        }
        if self.discovery.command_characteristics.is_empty()
            || self.discovery.notify_characteristics.is_empty()
        {
            return Err(ConfigError::Invalid(
                "command and notify characteristic lists must not be empty".to_string(),
            ));
        }
        if self.session.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
