//! Core library for controlling URBARN / Fulife mesh light fixtures
//!
//! This crate speaks the fixtures' Bluetooth mesh protocol: discovery,
//! login with the shared mesh credentials, and encrypted, sequenced
//! commands for power, brightness and color.

pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod light;
pub mod packet;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use client::MeshClient;
pub use command::{Command, LightStatus, Opcode, Rgb};
pub use config::{MeshConfig, MeshIdentity};
pub use connection::{SessionManager, SessionState};
pub use error::{MeshError, Result};
pub use state::Device;

#[cfg(test)]
mod tests;
