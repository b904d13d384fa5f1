//! Per-link session management: login, sequencing, acknowledgments and
//! recovery.

mod failure;
pub mod manager;
mod sequence;

use serde::Serialize;
use strum::Display;

pub use failure::FailureTracker;
pub use manager::SessionManager;
pub use sequence::{HANDSHAKE_SEQUENCE, SequenceCounter};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum SessionState {
    /// Linked but not logged in, or logged out after repeated failures
    Unauthenticated,
    Authenticated,
    /// Terminal. A new connect starts a new session.
    Disconnected,
}

/// Counters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub acks_received: u64,
    pub failures: u64,
    pub handshakes: u64,
    pub invalidations: u64,
    pub write_retries: u64,
}
