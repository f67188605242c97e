//! Driver boundary: the already-decoded command primitives of the radio's companion
//! protocol, and the payloads they return.
//!
//! Framing, CRC and byte-level transport live behind these traits. The payload structs
//! mirror the driver's decoded replies field for field (including its snake_case keys),
//! so they deserialize straight from recorded JSON. Validation into the crate's own
//! types happens in [`crate::model`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Endpoint;
use crate::error::{DriverError, MeshError};

/// Future returned by an operation run inside the exclusive-access section.
pub type DeviceFuture<'d, T> = Pin<Box<dyn Future<Output = Result<T, MeshError>> + Send + 'd>>;

/// Reply to `send_appstart`: the local node's identity and radio parameters, in raw device units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfInfo {
    pub name: String,
    pub public_key: String,
    pub adv_type: u8,
    /// dBm
    pub tx_power: i32,
    pub max_tx_power: i32,
    /// kHz
    pub radio_freq: u32,
    /// Hz
    pub radio_bw: u32,
    pub radio_sf: u8,
    pub radio_cr: u8,
    pub adv_lat: Option<f64>,
    pub adv_lon: Option<f64>,
}

/// One entry of `get_contacts`, keyed by advertised name in the reply map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawContact {
    pub public_key: Option<String>,
    pub adv_name: Option<String>,
    #[serde(rename = "type")]
    pub node_type: u8,
    pub last_advert: u64,
    pub adv_lat: Option<f64>,
    pub adv_lon: Option<f64>,
}

/// One buffered message returned by `get_msg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RawMessage {
    #[serde(rename = "PRIV")]
    Private {
        pubkey_prefix: String,
        #[serde(default)]
        txt_type: u8,
        #[serde(default)]
        sender_timestamp: u64,
        text: String,
    },
    #[serde(rename = "CHAN")]
    Channel {
        channel_idx: u8,
        #[serde(default)]
        sender_timestamp: u64,
        text: String,
    },
}

/// Reply to a repeater status request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStatus {
    pub pubkey_pre: String,
    /// millivolts
    pub bat: u32,
    pub tx_queue_len: u32,
    pub noise_floor: i32,
    pub last_rssi: i32,
    pub last_snr: f32,
    pub nb_recv: u32,
    pub nb_sent: u32,
    pub airtime: u32,
    pub uptime: u32,
    pub sent_flood: u32,
    pub sent_direct: u32,
    pub recv_flood: u32,
    pub recv_direct: u32,
    pub full_evts: u32,
    pub direct_dups: u32,
    pub flood_dups: u32,
}

/// Command primitives of an open device link.
///
/// `send_*` calls return `Ok(false)` when the device refuses the request; `wait_*` calls
/// return `Ok(false)` / `Ok(None)` when nothing arrives within `timeout`. Errors are
/// reserved for transport and decode failures.
#[async_trait]
pub trait MeshDriver: Send {
    /// App-start handshake; returns the node's self info.
    async fn send_appstart(&mut self) -> Result<SelfInfo, DriverError>;

    /// Battery level in millivolts.
    async fn get_bat(&mut self) -> Result<u32, DriverError>;

    async fn get_contacts(&mut self) -> Result<BTreeMap<String, RawContact>, DriverError>;

    /// Fetch one buffered message. `None` means the device buffer is exhausted.
    async fn get_msg(&mut self) -> Result<Option<RawMessage>, DriverError>;

    async fn send_msg(&mut self, dest_prefix: &[u8], text: &str) -> Result<bool, DriverError>;

    async fn wait_ack(&mut self, timeout: Duration) -> Result<bool, DriverError>;

    async fn send_chan_msg(&mut self, channel: u8, text: &str) -> Result<bool, DriverError>;

    async fn send_login(&mut self, peer_key: &[u8], password: &str) -> Result<bool, DriverError>;

    async fn wait_login(&mut self, timeout: Duration) -> Result<bool, DriverError>;

    async fn send_statusreq(&mut self, peer_key: &[u8]) -> Result<bool, DriverError>;

    async fn wait_status(&mut self, timeout: Duration) -> Result<Option<RawStatus>, DriverError>;

    async fn send_cmd(&mut self, peer_prefix: &[u8], command: &str) -> Result<bool, DriverError>;

    /// Wait for a new-message notification.
    async fn wait_msg(&mut self, timeout: Duration) -> Result<bool, DriverError>;

    async fn set_time(&mut self, unix_seconds: u32) -> Result<bool, DriverError>;

    /// Release the transport (socket, serial handle, BLE client). Safe to call repeatedly.
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Opens a transport for an endpoint and hands back a driver bound to it.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn MeshDriver>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_contact_accepts_sparse_driver_reply() {
        let contacts: BTreeMap<String, RawContact> =
            serde_json::from_str(r#"{"Alice": {"public_key": "ab12", "type": 1}}"#).unwrap();
        let alice = &contacts["Alice"];
        assert_eq!(alice.public_key.as_deref(), Some("ab12"));
        assert_eq!(alice.node_type, 1);
        assert_eq!(alice.adv_name, None);
        assert_eq!(alice.last_advert, 0);
    }

    #[test]
    fn raw_message_is_tagged_by_type() {
        let chan: RawMessage = serde_json::from_str(
            r#"{"type": "CHAN", "channel_idx": 0, "sender_timestamp": 1700000000, "text": "Bob: hi"}"#,
        )
        .unwrap();
        assert!(matches!(chan, RawMessage::Channel { channel_idx: 0, .. }));

        let private: RawMessage = serde_json::from_str(
            r#"{"type": "PRIV", "pubkey_prefix": "a1b2c3d4e5f6", "text": "ping"}"#,
        )
        .unwrap();
        match private {
            RawMessage::Private {
                txt_type,
                sender_timestamp,
                ..
            } => {
                assert_eq!(txt_type, 0);
                assert_eq!(sender_timestamp, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
