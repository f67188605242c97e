//! # Device Access Module
//!
//! Everything that touches the radio goes through this module. The node exposes a
//! half-duplex request/response channel with no multiplexing, so the module is built
//! around a single [`DeviceSession`] per node whose [`CommandGate`] serializes every
//! command exchange.
//!
//! ## Layers
//!
//! - [`driver`] - the collaborator boundary: [`MeshDriver`] primitives and the
//!   [`Connector`] that opens a transport for an [`Endpoint`]
//! - [`gate`] - the exclusive-access section, with cancellation and teardown when the
//!   link dies mid-command
//! - [`session`] - connect/disconnect lifecycle plus the logical operations the
//!   scheduler and command surface use (drain, node info, contacts, login, status...)
//! - [`memory`] - an in-process simulated node for tests and the `simulate` command
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshcore_mirror::device::{DeviceSession, Endpoint, SessionOptions};
//! use meshcore_mirror::device::memory::{MemoryConnector, MemoryDeviceState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = MemoryConnector::new(MemoryDeviceState::default());
//!     let endpoint = Endpoint::Tcp { host: "sim".into(), port: 5000 };
//!     let session = DeviceSession::new(endpoint, Arc::new(connector), SessionOptions::default());
//!     session.connect().await?;
//!     let messages = session.drain_new_messages().await?;
//!     println!("drained {} messages", messages.len());
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod driver;
pub mod gate;
pub mod memory;
pub mod session;

pub use driver::{Connector, DeviceFuture, MeshDriver, RawContact, RawMessage, RawStatus, SelfInfo};
pub use gate::CommandGate;
pub use session::{DeviceSession, Drained, SessionOptions};

/// Physical transport used to reach the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Usb,
    Ble,
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "usb"),
            TransportKind::Ble => write!(f, "ble"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Connection parameters for one transport kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Endpoint {
    Usb { path: String, baud: u32 },
    Ble { address: String },
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    pub fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Usb { .. } => TransportKind::Usb,
            Endpoint::Ble { .. } => TransportKind::Ble,
            Endpoint::Tcp { .. } => TransportKind::Tcp,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Usb { path, baud } => write!(f, "{} @ {} baud", path, baud),
            Endpoint::Ble { address } if address.is_empty() => write!(f, "first BLE node in range"),
            Endpoint::Ble { address } => write!(f, "{}", address),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}
