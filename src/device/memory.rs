//! In-process simulated node.
//!
//! [`MemoryConnector`] hands out [`MemoryDevice`] drivers that all share one
//! [`MemoryDeviceState`]. The state is plain serde data, so the `simulate` command can
//! load it from a JSON file. A [`MemoryHandle`] lets tests inject faults, add latency,
//! queue incoming traffic and inspect what the device saw.
//!
//! The device also watches for overlapping commands: if a second primitive starts while
//! another is still in flight, [`MemoryHandle::overlap_violations`] goes up.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::driver::{Connector, MeshDriver, RawContact, RawMessage, RawStatus, SelfInfo};
use super::Endpoint;
use crate::error::DriverError;

/// A remote repeater or room server reachable from the simulated node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryRepeater {
    /// Admin password. `None` means admin login is impossible.
    pub admin_password: Option<String>,
    pub guest_allowed: bool,
    pub status: Option<RawStatus>,
    pub version: Option<String>,
    /// Confirm logins in the `send_login` reply instead of via a later notification.
    pub immediate_login: bool,
}

/// Everything the simulated node knows. Repeaters are keyed by their contact name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryDeviceState {
    pub self_info: SelfInfo,
    pub battery_mv: u32,
    pub contacts: BTreeMap<String, RawContact>,
    pub inbox: VecDeque<RawMessage>,
    pub repeaters: BTreeMap<String, MemoryRepeater>,
    /// Whether direct messages get acknowledged.
    pub ack_direct: bool,
}

impl Default for MemoryDeviceState {
    fn default() -> Self {
        Self {
            self_info: SelfInfo {
                name: "SimNode".to_string(),
                public_key: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
                    .to_string(),
                adv_type: 1,
                tx_power: 20,
                max_tx_power: 22,
                radio_freq: 869_525,
                radio_bw: 250_000,
                radio_sf: 11,
                radio_cr: 5,
                adv_lat: None,
                adv_lon: None,
            },
            battery_mv: 3900,
            contacts: BTreeMap::new(),
            inbox: VecDeque::new(),
            repeaters: BTreeMap::new(),
            ack_direct: true,
        }
    }
}

/// Injected failure for the next call(s) of one primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Transport error; the link is dead.
    Io,
    /// Garbled reply.
    Decode,
    /// Never answers.
    Hang,
    /// The device declines: `Ok(false)` / `Ok(None)` where the primitive allows it.
    Refuse,
}

#[derive(Debug, Default)]
struct Shared {
    state: MemoryDeviceState,
    faults: HashMap<String, VecDeque<Fault>>,
    latency: Duration,
    calls: Vec<String>,
    in_flight: usize,
    overlap_violations: usize,
    opens: usize,
    closes: usize,
    logins: Vec<String>,
    sent_direct: Vec<(String, String)>,
    sent_channel: Vec<(u8, String)>,
    pending_login: Option<bool>,
    pending_status: Option<RawStatus>,
    time_synced: Option<u32>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Test-side view of a simulated node.
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryHandle {
    /// Queue an incoming message in the device buffer.
    pub fn push_message(&self, msg: RawMessage) {
        lock(&self.shared).state.inbox.push_back(msg);
    }

    pub fn inbox_len(&self) -> usize {
        lock(&self.shared).state.inbox.len()
    }

    pub fn add_contact(&self, name: &str, contact: RawContact) {
        lock(&self.shared)
            .state
            .contacts
            .insert(name.to_string(), contact);
    }

    /// Mutate the simulated state directly.
    pub fn update<F: FnOnce(&mut MemoryDeviceState)>(&self, f: F) {
        f(&mut lock(&self.shared).state);
    }

    /// Make the next `count` calls of `op` fail with `fault`. `op` is a primitive name
    /// such as `"get_msg"`, or `"open"` for the connector.
    pub fn fail_next(&self, op: &str, fault: Fault, count: usize) {
        let mut shared = lock(&self.shared);
        let queue = shared.faults.entry(op.to_string()).or_default();
        queue.extend(std::iter::repeat(fault).take(count));
    }

    /// Delay applied to every primitive before it answers.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.shared).latency = latency;
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.shared).calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        lock(&self.shared).calls.iter().filter(|c| c.as_str() == op).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.shared).calls.clear();
    }

    pub fn overlap_violations(&self) -> usize {
        lock(&self.shared).overlap_violations
    }

    pub fn opens(&self) -> usize {
        lock(&self.shared).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.shared).closes
    }

    /// Repeater names of every login attempt that reached the device, in order.
    pub fn logins(&self) -> Vec<String> {
        lock(&self.shared).logins.clone()
    }

    /// `(hex destination prefix, text)` for each direct message sent.
    pub fn sent_direct(&self) -> Vec<(String, String)> {
        lock(&self.shared).sent_direct.clone()
    }

    pub fn sent_channel(&self) -> Vec<(u8, String)> {
        lock(&self.shared).sent_channel.clone()
    }

    pub fn time_synced(&self) -> Option<u32> {
        lock(&self.shared).time_synced
    }
}

pub struct MemoryConnector {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryConnector {
    pub fn new(state: MemoryDeviceState) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state,
                ..Shared::default()
            })),
        }
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _endpoint: &Endpoint) -> Result<Box<dyn MeshDriver>, DriverError> {
        let fault = {
            let mut shared = lock(&self.shared);
            shared.calls.push("open".to_string());
            take_fault(&mut shared, "open")
        };
        match fault {
            Some(Fault::Hang) => std::future::pending::<()>().await,
            Some(Fault::Decode) => return Err(DriverError::Decode("bad banner".to_string())),
            Some(Fault::Io) | Some(Fault::Refuse) => {
                return Err(DriverError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "simulated node unreachable",
                )))
            }
            None => {}
        }
        lock(&self.shared).opens += 1;
        Ok(Box::new(MemoryDevice {
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }
}

fn take_fault(shared: &mut Shared, op: &str) -> Option<Fault> {
    shared.faults.get_mut(op).and_then(|q| q.pop_front())
}

/// Marks one primitive in flight; released on drop so timeouts and cancellation
/// leave the counter consistent.
struct InFlight {
    shared: Arc<Mutex<Shared>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut shared = lock(&self.shared);
        shared.in_flight = shared.in_flight.saturating_sub(1);
    }
}

/// Driver bound to one simulated link.
pub struct MemoryDevice {
    shared: Arc<Mutex<Shared>>,
    closed: bool,
}

impl MemoryDevice {
    /// Register the call, apply latency and any queued fault. Returns the in-flight
    /// marker and whether the device should refuse.
    async fn begin(&self, op: &str) -> Result<(InFlight, bool), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let (fault, latency) = {
            let mut shared = lock(&self.shared);
            shared.calls.push(op.to_string());
            if shared.in_flight > 0 {
                shared.overlap_violations += 1;
            }
            shared.in_flight += 1;
            (take_fault(&mut shared, op), shared.latency)
        };
        let marker = InFlight {
            shared: Arc::clone(&self.shared),
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(Fault::Io) => Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated link drop",
            ))),
            Some(Fault::Decode) => Err(DriverError::Decode(format!("garbled {} reply", op))),
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Ok((marker, true))
            }
            Some(Fault::Refuse) => Ok((marker, true)),
            None => Ok((marker, false)),
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }
}

/// Name of the repeater whose contact key starts with `key`.
fn repeater_for_key(state: &MemoryDeviceState, key: &[u8]) -> Option<String> {
    let wanted = hex::encode(key);
    if wanted.is_empty() {
        return None;
    }
    state.repeaters.keys().find_map(|name| {
        let contact = state.contacts.get(name)?;
        let public_key = contact.public_key.as_deref()?.to_lowercase();
        public_key.starts_with(&wanted).then(|| name.clone())
    })
}

#[async_trait]
impl MeshDriver for MemoryDevice {
    async fn send_appstart(&mut self) -> Result<SelfInfo, DriverError> {
        let (_marker, refuse) = self.begin("send_appstart").await?;
        if refuse {
            return Err(DriverError::Rejected { op: "send_appstart" });
        }
        let info = self.shared().state.self_info.clone();
        Ok(info)
    }

    async fn get_bat(&mut self) -> Result<u32, DriverError> {
        let (_marker, refuse) = self.begin("get_bat").await?;
        if refuse {
            return Err(DriverError::Rejected { op: "get_bat" });
        }
        let battery = self.shared().state.battery_mv;
        Ok(battery)
    }

    async fn get_contacts(&mut self) -> Result<BTreeMap<String, RawContact>, DriverError> {
        let (_marker, refuse) = self.begin("get_contacts").await?;
        if refuse {
            return Err(DriverError::Rejected { op: "get_contacts" });
        }
        let contacts = self.shared().state.contacts.clone();
        Ok(contacts)
    }

    async fn get_msg(&mut self) -> Result<Option<RawMessage>, DriverError> {
        let (_marker, refuse) = self.begin("get_msg").await?;
        if refuse {
            return Ok(None);
        }
        let next = self.shared().state.inbox.pop_front();
        Ok(next)
    }

    async fn send_msg(&mut self, dest_prefix: &[u8], text: &str) -> Result<bool, DriverError> {
        let (_marker, refuse) = self.begin("send_msg").await?;
        if refuse {
            return Ok(false);
        }
        self.shared()
            .sent_direct
            .push((hex::encode(dest_prefix), text.to_string()));
        Ok(true)
    }

    async fn wait_ack(&mut self, timeout: Duration) -> Result<bool, DriverError> {
        let (_marker, refuse) = self.begin("wait_ack").await?;
        let acked = !refuse && self.shared().state.ack_direct;
        if !acked {
            tokio::time::sleep(timeout).await;
        }
        Ok(acked)
    }

    async fn send_chan_msg(&mut self, channel: u8, text: &str) -> Result<bool, DriverError> {
        let (_marker, refuse) = self.begin("send_chan_msg").await?;
        if refuse {
            return Ok(false);
        }
        self.shared().sent_channel.push((channel, text.to_string()));
        Ok(true)
    }

    async fn send_login(&mut self, peer_key: &[u8], password: &str) -> Result<bool, DriverError> {
        let (_marker, refuse) = self.begin("send_login").await?;
        let mut shared = self.shared();
        shared.pending_login = None;
        let name = match repeater_for_key(&shared.state, peer_key) {
            Some(name) => name,
            None => return Ok(false),
        };
        shared.logins.push(name.clone());
        if refuse {
            return Ok(false);
        }
        let granted = shared
            .state
            .repeaters
            .get(&name)
            .map(|r| {
                let admin = r.admin_password.as_deref().map_or(false, |pw| pw == password);
                let guest = r.guest_allowed && password.is_empty();
                (admin || guest, r.immediate_login)
            });
        match granted {
            Some((true, true)) => Ok(true),
            Some((ok, _)) => {
                shared.pending_login = Some(ok);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn wait_login(&mut self, timeout: Duration) -> Result<bool, DriverError> {
        let (_marker, refuse) = self.begin("wait_login").await?;
        let pending = self.shared().pending_login.take();
        match pending {
            Some(true) if !refuse => Ok(true),
            Some(false) => Ok(false),
            _ => {
                tokio::time::sleep(timeout).await;
                Ok(false)
            }
        }
    }

    async fn send_statusreq(&mut self, peer_key: &[u8]) -> Result<bool, DriverError> {
        let (_marker, refuse) = self.begin("send_statusreq").await?;
        let mut shared = self.shared();
        shared.pending_status = None;
        if refuse {
            return Ok(false);
        }
        match repeater_for_key(&shared.state, peer_key) {
            Some(name) => {
                shared.pending_status = shared
                    .state
                    .repeaters
                    .get(&name)
                    .and_then(|r| r.status.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn wait_status(&mut self, timeout: Duration) -> Result<Option<RawStatus>, DriverError> {
        let (_marker, refuse) = self.begin("wait_status").await?;
        let pending = self.shared().pending_status.take();
        match pending {
            Some(status) if !refuse => Ok(Some(status)),
            _ => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn send_cmd(&mut self, peer_prefix: &[u8], command: &str) -> Result<bool, DriverError> {
        let (_marker, refuse) = self.begin("send_cmd").await?;
        if refuse {
            return Ok(false);
        }
        let mut shared = self.shared();
        let name = match repeater_for_key(&shared.state, peer_prefix) {
            Some(name) => name,
            None => return Ok(false),
        };
        let reply = match command.trim() {
            "ver" => shared.state.repeaters.get(&name).and_then(|r| r.version.clone()),
            other => Some(format!("Error: unknown command '{}'", other)),
        };
        if let Some(text) = reply {
            shared.state.inbox.push_back(RawMessage::Private {
                pubkey_prefix: hex::encode(peer_prefix),
                txt_type: 1,
                sender_timestamp: 0,
                text,
            });
        }
        Ok(true)
    }

    async fn wait_msg(&mut self, timeout: Duration) -> Result<bool, DriverError> {
        let (_marker, refuse) = self.begin("wait_msg").await?;
        let waiting = !refuse && !self.shared().state.inbox.is_empty();
        if !waiting {
            tokio::time::sleep(timeout).await;
        }
        Ok(waiting)
    }

    async fn set_time(&mut self, unix_seconds: u32) -> Result<bool, DriverError> {
        let (_marker, refuse) = self.begin("set_time").await?;
        if refuse {
            return Ok(false);
        }
        self.shared().time_synced = Some(unix_seconds);
        Ok(true)
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            let mut shared = self.shared();
            shared.calls.push("close".to_string());
            shared.closes += 1;
        }
        Ok(())
    }
}
