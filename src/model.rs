//! Typed mirror of node state.
//!
//! Driver payloads ([`crate::device::driver`]) are converted into these types at the
//! protocol boundary. Raw device units (millivolts, kHz) are carried unchanged; display
//! conversions belong to the presentation layer, with helpers provided here so every
//! consumer applies the same convention.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::driver::{RawContact, RawMessage, RawStatus, SelfInfo};
use crate::error::{MeshError, Result};

/// Number of public-key bytes used to address a peer in direct messages and remote commands.
pub const KEY_PREFIX_BYTES: usize = 6;

/// Display name used when the node has never answered.
pub const PLACEHOLDER_NODE_NAME: &str = "MeshCore Node";

const MIN_BATTERY_MV: f64 = 3200.0;
const MAX_BATTERY_MV: f64 = 4200.0;

/// Linear 3.2 V - 4.2 V battery percentage, clamped to 0-100. `None` for a zero reading.
pub fn battery_percent(millivolts: u32) -> Option<f64> {
    if millivolts == 0 {
        return None;
    }
    let pct = (millivolts as f64 - MIN_BATTERY_MV) / (MAX_BATTERY_MV - MIN_BATTERY_MV) * 100.0;
    Some((pct.clamp(0.0, 100.0) * 10.0).round() / 10.0)
}

/// Decode a hex public key (or key prefix) into bytes.
pub fn decode_key(hex_key: &str) -> Result<Vec<u8>> {
    hex::decode(hex_key.trim())
        .map_err(|e| MeshError::Protocol(format!("invalid public key '{}': {}", hex_key, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Client,
    Repeater,
    RoomServer,
    /// Sensors and any type code newer than this crate; carries the raw code.
    Unknown(u8),
}

impl NodeType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => NodeType::Client,
            2 => NodeType::Repeater,
            3 => NodeType::RoomServer,
            other => NodeType::Unknown(other),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Client => write!(f, "Client"),
            NodeType::Repeater => write!(f, "Repeater"),
            NodeType::RoomServer => write!(f, "Room Server"),
            NodeType::Unknown(_) => write!(f, "Unknown"),
        }
    }
}

/// Local node identity, radio parameters and battery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub public_key: String,
    pub radio_freq_khz: u32,
    pub radio_bw_hz: u32,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    pub tx_power_dbm: i32,
    pub max_tx_power_dbm: i32,
    pub battery_mv: Option<u32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl NodeInfo {
    pub fn placeholder() -> Self {
        Self {
            name: PLACEHOLDER_NODE_NAME.to_string(),
            public_key: String::new(),
            radio_freq_khz: 0,
            radio_bw_hz: 0,
            spreading_factor: 0,
            coding_rate: 0,
            tx_power_dbm: 0,
            max_tx_power_dbm: 0,
            battery_mv: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn from_self_info(info: &SelfInfo, battery_mv: Option<u32>) -> Self {
        let name = if info.name.trim().is_empty() {
            PLACEHOLDER_NODE_NAME.to_string()
        } else {
            info.name.clone()
        };
        Self {
            name,
            public_key: info.public_key.to_lowercase(),
            radio_freq_khz: info.radio_freq,
            radio_bw_hz: info.radio_bw,
            spreading_factor: info.radio_sf,
            coding_rate: info.radio_cr,
            tx_power_dbm: info.tx_power,
            max_tx_power_dbm: info.max_tx_power,
            battery_mv,
            latitude: info.adv_lat,
            longitude: info.adv_lon,
        }
    }

    pub fn radio_freq_mhz(&self) -> f64 {
        self.radio_freq_khz as f64 / 1000.0
    }

    pub fn battery_volts(&self) -> Option<f64> {
        self.battery_mv.filter(|mv| *mv > 0).map(|mv| mv as f64 / 1000.0)
    }
}

/// A peer known to the local node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub advertised_name: String,
    /// Lowercase hex; the stable identity when present.
    pub public_key: Option<String>,
    pub node_type: NodeType,
    pub last_advert_at: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Contact {
    /// Validate one `get_contacts` entry. The map key is the fallback name.
    ///
    /// Only an undecodable public key is rejected; unrecognised type codes are kept.
    pub fn from_raw(map_name: &str, raw: &RawContact) -> Result<Self> {
        let node_type = NodeType::from_code(raw.node_type);
        let public_key = match raw.public_key.as_deref().map(str::trim) {
            Some(k) if !k.is_empty() => {
                decode_key(k)?;
                Some(k.to_lowercase())
            }
            _ => None,
        };
        let advertised_name = raw
            .adv_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(map_name)
            .to_string();
        Ok(Self {
            advertised_name,
            public_key,
            node_type,
            last_advert_at: raw.last_advert,
            latitude: raw.adv_lat,
            longitude: raw.adv_lon,
        })
    }

    /// Key under which the contact is stored: public key when present, else the name.
    pub fn key(&self) -> &str {
        self.public_key.as_deref().unwrap_or(&self.advertised_name)
    }

    /// First [`KEY_PREFIX_BYTES`] bytes of the public key, as used for addressing.
    pub fn key_prefix_bytes(&self) -> Result<Vec<u8>> {
        let key = self.public_key.as_deref().ok_or_else(|| {
            MeshError::UnknownContact(format!("{} has no public key", self.advertised_name))
        })?;
        let mut bytes = decode_key(key)?;
        bytes.truncate(KEY_PREFIX_BYTES);
        Ok(bytes)
    }

    pub fn full_key_bytes(&self) -> Result<Vec<u8>> {
        let key = self.public_key.as_deref().ok_or_else(|| {
            MeshError::UnknownContact(format!("{} has no public key", self.advertised_name))
        })?;
        decode_key(key)
    }

    /// Identity match: key prefix when both sides carry a key, otherwise advertised name.
    pub fn same_identity(&self, other: &Contact) -> bool {
        match (&self.public_key, &other.public_key) {
            (Some(a), Some(b)) => a.starts_with(b.as_str()) || b.starts_with(a.as_str()),
            _ => self.advertised_name == other.advertised_name,
        }
    }

    pub fn key_starts_with(&self, prefix: &str) -> bool {
        let prefix = prefix.trim().to_lowercase();
        !prefix.is_empty()
            && self
                .public_key
                .as_deref()
                .map(|k| k.starts_with(&prefix))
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    /// One-to-one message. `peer_key_prefix` is the other party (sender when incoming).
    Direct { peer_key_prefix: String },
    Channel { index: u8 },
    /// Post relayed by a room server.
    Chatroom { room_key_prefix: String },
}

/// Conversation a message belongs to; keys the last-message-timestamp map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConversationKey {
    Channel(u8),
    Peer(String),
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Channel(idx) => write!(f, "channel_{}", idx),
            ConversationKey::Peer(prefix) => write!(f, "{}", prefix),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub direction: Direction,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub timestamp: u64,
}

/// `txt_type` of a room server post (signed plain text).
const TXT_TYPE_SIGNED_PLAIN: u8 = 2;

impl Message {
    pub fn from_raw(raw: &RawMessage) -> Result<Self> {
        match raw {
            RawMessage::Private {
                pubkey_prefix,
                txt_type,
                sender_timestamp,
                text,
            } => {
                let prefix = pubkey_prefix.trim().to_lowercase();
                if prefix.is_empty() {
                    return Err(MeshError::Protocol(
                        "direct message without sender key".to_string(),
                    ));
                }
                decode_key(&prefix)?;
                let kind = if *txt_type == TXT_TYPE_SIGNED_PLAIN {
                    MessageKind::Chatroom {
                        room_key_prefix: prefix,
                    }
                } else {
                    MessageKind::Direct {
                        peer_key_prefix: prefix,
                    }
                };
                Ok(Self {
                    text: text.clone(),
                    direction: Direction::Incoming,
                    kind,
                    timestamp: *sender_timestamp,
                })
            }
            RawMessage::Channel {
                channel_idx,
                sender_timestamp,
                text,
            } => Ok(Self {
                text: text.clone(),
                direction: Direction::Incoming,
                kind: MessageKind::Channel {
                    index: *channel_idx,
                },
                timestamp: *sender_timestamp,
            }),
        }
    }

    pub fn outgoing_direct(peer_key_prefix: String, text: String, timestamp: u64) -> Self {
        Self {
            text,
            direction: Direction::Outgoing,
            kind: MessageKind::Direct { peer_key_prefix },
            timestamp,
        }
    }

    pub fn outgoing_channel(index: u8, text: String, timestamp: u64) -> Self {
        Self {
            text,
            direction: Direction::Outgoing,
            kind: MessageKind::Channel { index },
            timestamp,
        }
    }

    /// Present iff the message was sent on a channel.
    pub fn channel_index(&self) -> Option<u8> {
        match self.kind {
            MessageKind::Channel { index } => Some(index),
            _ => None,
        }
    }

    /// Present iff the message is an incoming direct message.
    pub fn sender_key_prefix(&self) -> Option<&str> {
        match (&self.kind, self.direction) {
            (MessageKind::Direct { peer_key_prefix }, Direction::Incoming) => {
                Some(peer_key_prefix)
            }
            _ => None,
        }
    }

    pub fn conversation(&self) -> ConversationKey {
        match &self.kind {
            MessageKind::Channel { index } => ConversationKey::Channel(*index),
            MessageKind::Direct { peer_key_prefix } => ConversationKey::Peer(peer_key_prefix.clone()),
            MessageKind::Chatroom { room_key_prefix } => {
                ConversationKey::Peer(room_key_prefix.clone())
            }
        }
    }
}

/// Statistics reported by a repeater, with the raw battery value in millivolts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeaterStats {
    pub battery_mv: u32,
    pub uptime_secs: u32,
    pub airtime_secs: u32,
    pub packets_sent: u32,
    pub packets_received: u32,
    pub tx_queue_len: u32,
    pub noise_floor: i32,
    pub last_rssi: i32,
    pub last_snr: f32,
    pub sent_flood: u32,
    pub sent_direct: u32,
    pub recv_flood: u32,
    pub recv_direct: u32,
    pub full_events: u32,
    pub direct_dups: u32,
    pub flood_dups: u32,
    pub fetched_at: u64,
}

impl RepeaterStats {
    pub fn from_raw(raw: &RawStatus, fetched_at: u64) -> Self {
        Self {
            battery_mv: raw.bat,
            uptime_secs: raw.uptime,
            airtime_secs: raw.airtime,
            packets_sent: raw.nb_sent,
            packets_received: raw.nb_recv,
            tx_queue_len: raw.tx_queue_len,
            noise_floor: raw.noise_floor,
            last_rssi: raw.last_rssi,
            last_snr: raw.last_snr,
            sent_flood: raw.sent_flood,
            sent_direct: raw.sent_direct,
            recv_flood: raw.recv_flood,
            recv_direct: raw.recv_direct,
            full_events: raw.full_evts,
            direct_dups: raw.direct_dups,
            flood_dups: raw.flood_dups,
            fetched_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(name: &str, key: Option<&str>) -> Contact {
        Contact {
            advertised_name: name.to_string(),
            public_key: key.map(str::to_string),
            node_type: NodeType::Client,
            last_advert_at: 0,
            latitude: None,
            longitude: None,
        }
    }

    #[test]
    fn battery_percentage_is_linear_and_clamped() {
        assert_eq!(battery_percent(3700), Some(50.0));
        assert_eq!(battery_percent(4300), Some(100.0));
        assert_eq!(battery_percent(3000), Some(0.0));
        assert_eq!(battery_percent(0), None);
    }

    #[test]
    fn contact_from_raw_uses_map_name_when_adv_name_missing() {
        let raw = RawContact {
            public_key: Some("AB12CD".into()),
            node_type: 2,
            ..Default::default()
        };
        let c = Contact::from_raw("Hilltop", &raw).unwrap();
        assert_eq!(c.advertised_name, "Hilltop");
        assert_eq!(c.public_key.as_deref(), Some("ab12cd"));
        assert_eq!(c.node_type, NodeType::Repeater);
        assert_eq!(c.key(), "ab12cd");
    }

    #[test]
    fn contact_from_raw_keeps_unknown_type_but_rejects_bad_key() {
        let sensor = RawContact {
            node_type: 4,
            ..Default::default()
        };
        let c = Contact::from_raw("Sensor", &sensor).unwrap();
        assert_eq!(c.node_type, NodeType::Unknown(4));
        assert_eq!(c.node_type.to_string(), "Unknown");
        let zero = RawContact::default();
        assert_eq!(Contact::from_raw("x", &zero).unwrap().node_type, NodeType::Unknown(0));

        let bad_key = RawContact {
            public_key: Some("zz".into()),
            node_type: 1,
            ..Default::default()
        };
        assert!(Contact::from_raw("x", &bad_key).is_err());
    }

    #[test]
    fn identity_prefers_key_prefix_then_name() {
        let full = contact("Alice", Some("ab12cd34"));
        let prefix = contact("Alice renamed", Some("ab12"));
        let other = contact("Alice", Some("ff00"));
        let keyless = contact("Alice", None);

        assert!(full.same_identity(&prefix));
        assert!(!full.same_identity(&other));
        assert!(keyless.same_identity(&full));
        assert!(!keyless.same_identity(&contact("Bob", None)));
    }

    #[test]
    fn key_prefix_bytes_truncates_to_six() {
        let c = contact("R", Some("0102030405060708"));
        assert_eq!(c.key_prefix_bytes().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(c.full_key_bytes().unwrap().len(), 8);
        assert!(contact("N", None).key_prefix_bytes().is_err());
    }

    #[test]
    fn message_invariants_follow_kind() {
        let chan = Message::from_raw(&RawMessage::Channel {
            channel_idx: 3,
            sender_timestamp: 10,
            text: "hi".into(),
        })
        .unwrap();
        assert_eq!(chan.channel_index(), Some(3));
        assert_eq!(chan.sender_key_prefix(), None);
        assert_eq!(chan.conversation().to_string(), "channel_3");

        let dm = Message::from_raw(&RawMessage::Private {
            pubkey_prefix: "A1B2C3D4E5F6".into(),
            txt_type: 0,
            sender_timestamp: 11,
            text: "yo".into(),
        })
        .unwrap();
        assert_eq!(dm.sender_key_prefix(), Some("a1b2c3d4e5f6"));
        assert_eq!(dm.channel_index(), None);

        let room = Message::from_raw(&RawMessage::Private {
            pubkey_prefix: "a1b2c3d4e5f6".into(),
            txt_type: 2,
            sender_timestamp: 12,
            text: "post".into(),
        })
        .unwrap();
        assert!(matches!(room.kind, MessageKind::Chatroom { .. }));
        assert_eq!(room.sender_key_prefix(), None);

        let out = Message::outgoing_direct("a1b2".into(), "reply".into(), 13);
        assert_eq!(out.sender_key_prefix(), None);
    }

    #[test]
    fn node_info_conversions() {
        let info = SelfInfo {
            name: "Base".into(),
            radio_freq: 869525,
            ..Default::default()
        };
        let node = NodeInfo::from_self_info(&info, Some(3900));
        assert!((node.radio_freq_mhz() - 869.525).abs() < 1e-9);
        assert_eq!(node.battery_volts(), Some(3.9));

        let unnamed = NodeInfo::from_self_info(&SelfInfo::default(), None);
        assert_eq!(unnamed.name, PLACEHOLDER_NODE_NAME);
    }
}
