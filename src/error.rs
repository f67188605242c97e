use std::time::Duration;

use thiserror::Error;

/// Failures reported by a device driver (the transport/protocol collaborator).
#[derive(Debug, Error)]
pub enum DriverError {
    /// The underlying byte channel failed (serial unplugged, socket reset, BLE drop).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver was used after its transport had been closed.
    #[error("transport closed")]
    Closed,

    /// A reply arrived but could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The device answered with an explicit error code.
    #[error("device rejected {op}")]
    Rejected { op: &'static str },
}

/// Errors surfaced by the device session, repeater manager and scheduler.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Transport unreachable or handshake failed. Retried by the scheduler on its own interval.
    #[error("connect failed: {0}")]
    Connect(String),

    /// No response within the bounded wait for `op`.
    #[error("{op} timed out after {}s", .after.as_secs())]
    CommandTimeout { op: &'static str, after: Duration },

    /// Malformed or unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation attempted while the session is down; reconnect first.
    #[error("not connected to device")]
    NotConnected,

    /// Name or key prefix does not resolve to a known contact.
    #[error("unknown contact: {0}")]
    UnknownContact(String),

    /// Repeater login denied or not confirmed in time.
    #[error("login to {0} failed")]
    LoginFailed(String),

    /// The session was shut down while the operation was pending.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl MeshError {
    /// True when the error means the transport is gone and the session must be torn down.
    pub fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            MeshError::Driver(DriverError::Io(_)) | MeshError::Driver(DriverError::Closed)
        )
    }
}

pub type Result<T, E = MeshError> = std::result::Result<T, E>;
