//! Error types for the sync protocol.

use thiserror::Error;

/// Errors raised by the coordinator and the peer client.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Socket or listener I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote side sent a line outside the expected grammar or phase.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A line exceeded the wire protocol's size cap.
    #[error("Line exceeds {} bytes", crate::proto::MAX_LINE_BYTES)]
    LineTooLong,

    /// The connection closed before the protocol completed.
    #[error("Connection closed during {phase}")]
    Disconnected { phase: &'static str },

    /// The barrier could not be completed: too few peers reached readiness
    /// before the grace period expired.
    #[error("Barrier failed: {ready} of {expected} peers ready")]
    BarrierFailed { ready: usize, expected: usize },

    /// Connecting to the coordinator failed after all retry attempts.
    #[error("Could not reach coordinator at {addr} after {attempts} attempts")]
    ConnectFailed { addr: String, attempts: u32 },

    /// The metadata table could not be encoded or decoded.
    #[error(transparent)]
    Core(#[from] conductor_core::CoreError),
}

impl SyncError {
    /// Creates a protocol violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
