//! Test utilities & fixtures.
//! Builds sessions and coordinators over the in-process simulated node.
#![allow(dead_code)] // Each test binary uses a different subset.

use std::sync::Arc;

use meshcore_mirror::config::{PollingConfig, RepeaterConfig};
use meshcore_mirror::coordinator::MeshCoordinator;
use meshcore_mirror::device::memory::{
    MemoryConnector, MemoryDeviceState, MemoryHandle, MemoryRepeater,
};
use meshcore_mirror::device::{
    DeviceSession, Endpoint, RawContact, RawMessage, RawStatus, SessionOptions,
};

pub const ALICE_KEY: &str = "ab12cd34ef5678900000000000000000000000000000000000000000000000a1";
pub const BOB_KEY: &str = "b0b0b0b0b0b011111111111111111111111111111111111111111111111111b2";
pub const HILLTOP_KEY: &str = "c0ffee00112233445566778899aabbccddeeff00112233445566778899aabbcc";

pub fn tcp_endpoint() -> Endpoint {
    Endpoint::Tcp {
        host: "sim".to_string(),
        port: 5000,
    }
}

pub fn contact(key: &str, node_type: u8) -> RawContact {
    RawContact {
        public_key: Some(key.to_string()),
        node_type,
        last_advert: 1_700_000_000,
        ..RawContact::default()
    }
}

pub fn hilltop_status(battery_mv: u32) -> RawStatus {
    RawStatus {
        pubkey_pre: HILLTOP_KEY[..12].to_string(),
        bat: battery_mv,
        uptime: 86_400,
        nb_sent: 120,
        nb_recv: 340,
        last_rssi: -92,
        last_snr: 7.5,
        noise_floor: -118,
        ..RawStatus::default()
    }
}

/// Node with Alice (client) and Hilltop (repeater, admin password `secret`, guests allowed).
pub fn base_state() -> MemoryDeviceState {
    let mut state = MemoryDeviceState::default();
    state.contacts.insert("Alice".to_string(), contact(ALICE_KEY, 1));
    state.contacts.insert("Hilltop".to_string(), contact(HILLTOP_KEY, 2));
    state.repeaters.insert(
        "Hilltop".to_string(),
        MemoryRepeater {
            admin_password: Some("secret".to_string()),
            guest_allowed: true,
            status: Some(hilltop_status(4010)),
            version: Some("v1.7.2 (Build: 12-Jun-2025)".to_string()),
            immediate_login: false,
        },
    );
    state
}

pub fn chan(idx: u8, text: &str, ts: u64) -> RawMessage {
    RawMessage::Channel {
        channel_idx: idx,
        sender_timestamp: ts,
        text: text.to_string(),
    }
}

pub fn private(prefix: &str, text: &str, ts: u64) -> RawMessage {
    RawMessage::Private {
        pubkey_prefix: prefix.to_string(),
        txt_type: 0,
        sender_timestamp: ts,
        text: text.to_string(),
    }
}

pub fn session_with(state: MemoryDeviceState, options: SessionOptions) -> (DeviceSession, MemoryHandle) {
    let connector = MemoryConnector::new(state);
    let handle = connector.handle();
    let session = DeviceSession::new(tcp_endpoint(), Arc::new(connector), options);
    (session, handle)
}

pub fn session(state: MemoryDeviceState) -> (DeviceSession, MemoryHandle) {
    session_with(state, SessionOptions::default())
}

pub fn polling(messages: u64, info: u64) -> PollingConfig {
    PollingConfig {
        messages_interval_secs: messages,
        info_interval_secs: info,
        ..PollingConfig::default()
    }
}

pub fn hilltop(password: &str) -> RepeaterConfig {
    RepeaterConfig {
        name: "Hilltop".to_string(),
        password: password.to_string(),
        poll_interval_secs: 300,
        enabled: true,
    }
}

pub fn coordinator(
    state: MemoryDeviceState,
    repeaters: &[RepeaterConfig],
) -> (MeshCoordinator, MemoryHandle) {
    let (session, handle) = session(state);
    let coordinator = MeshCoordinator::new(session, &polling(10, 60), repeaters);
    (coordinator, handle)
}
