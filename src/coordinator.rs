//! Coordinator: owns the session, scheduler and repeater manager for one node and
//! exposes the command surface.
//!
//! There is no global registry. Callers build a [`MeshCoordinator`], keep it (usually in
//! an `Arc`) and pass it to whatever needs the node.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshcore_mirror::config::Config;
//! use meshcore_mirror::coordinator::MeshCoordinator;
//! use meshcore_mirror::device::memory::{MemoryConnector, MemoryDeviceState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::default();
//!     config.device.connection = meshcore_mirror::device::TransportKind::Tcp;
//!     config.device.tcp_host = "sim".into();
//!     let connector = Arc::new(MemoryConnector::new(MemoryDeviceState::default()));
//!     let coordinator = MeshCoordinator::from_config(&config, connector)?;
//!     let snapshot = coordinator.refresh_now().await;
//!     println!("{} contacts", snapshot.contacts.len());
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex as StdMutex};

use log::info;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{Config, PollingConfig, RepeaterConfig};
use crate::device::{Connector, DeviceSession, SessionOptions};
use crate::error::{MeshError, Result};
use crate::logutil::escape_log;
use crate::metrics::{self, Metrics};
use crate::model::{Contact, Message, RepeaterStats};
use crate::repeater::{RepeaterPeer, RepeaterSessionManager};
use crate::scheduler::{unix_now, MeshEvent, RefreshScheduler, SchedulerSettings, TickReport};
use crate::snapshot::{SnapshotCache, StateSnapshot};

/// Result of a direct send: whether the recipient acknowledged, and who it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectSendReceipt {
    pub acknowledged: bool,
    pub public_key: String,
    pub name: String,
}

pub struct MeshCoordinator {
    session: Arc<DeviceSession>,
    scheduler: Arc<RefreshScheduler>,
    repeaters: Arc<Mutex<RepeaterSessionManager>>,
    cache: Arc<SnapshotCache>,
    metrics: Arc<Metrics>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
}

impl MeshCoordinator {
    /// Build everything from a validated configuration.
    pub fn from_config(config: &Config, connector: Arc<dyn Connector>) -> anyhow::Result<Self> {
        config.validate()?;
        let session = DeviceSession::new(
            config.endpoint()?,
            connector,
            SessionOptions::from_config(config),
        );
        Ok(Self::new(session, &config.polling, &config.repeaters))
    }

    pub fn new(session: DeviceSession, polling: &PollingConfig, repeaters: &[RepeaterConfig]) -> Self {
        let session = Arc::new(session);
        let metrics = Arc::new(Metrics::new());
        let repeaters = Arc::new(Mutex::new(RepeaterSessionManager::new(
            repeaters,
            Arc::clone(&metrics),
        )));
        let cache = Arc::new(SnapshotCache::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&session),
            Arc::clone(&repeaters),
            Arc::clone(&cache),
            events_tx,
            Arc::clone(&metrics),
            SchedulerSettings::from(polling),
        ));
        Self {
            session,
            scheduler,
            repeaters,
            cache,
            metrics,
            events: StdMutex::new(Some(events_rx)),
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.cache.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.cache.subscribe()
    }

    /// The event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Session bookkeeping for one repeater, for status displays.
    pub async fn repeater_peer(&self, name: &str) -> Option<RepeaterPeer> {
        self.repeaters.lock().await.peer(name).cloned()
    }

    pub fn metrics(&self) -> metrics::Snapshot {
        self.metrics.snapshot()
    }

    /// Spawn the polling loop. It stops on [`shutdown`](Self::shutdown).
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let cancel = self.session.shutdown_token();
        tokio::spawn(async move { scheduler.run(cancel).await })
    }

    /// Run one tick now and return the snapshot it published. On a cold failure this is
    /// the placeholder snapshot.
    pub async fn refresh_now(&self) -> Arc<StateSnapshot> {
        match self.scheduler.tick_at(unix_now()).await {
            Ok(report) => report.snapshot,
            Err(e) => {
                log::warn!("On-demand refresh failed: {}", e);
                self.cache.current()
            }
        }
    }

    /// Like [`refresh_now`](Self::refresh_now) but with the full per-kind report.
    pub async fn refresh_report(&self) -> Result<TickReport> {
        self.scheduler.tick_at(unix_now()).await
    }

    fn resolve_contact(&self, target: &str) -> Result<Contact> {
        let snapshot = self.cache.current();
        snapshot
            .contact_by_name(target)
            .or_else(|| snapshot.contact_by_key_prefix(target))
            .cloned()
            .ok_or_else(|| MeshError::UnknownContact(target.to_string()))
    }

    /// Send a direct message to a contact given by name or public key prefix.
    pub async fn send_direct_message(&self, target: &str, text: &str) -> Result<DirectSendReceipt> {
        let contact = self.resolve_contact(target)?;
        let prefix = contact.key_prefix_bytes()?;
        let prefix_hex = hex::encode(&prefix);
        let acknowledged = self.session.send_direct(prefix, text.to_string()).await?;
        info!(
            "Sent direct message to {} (ack: {})",
            escape_log(&contact.advertised_name),
            acknowledged
        );
        self.metrics.inc_message_sent();
        self.scheduler.record_outgoing(Message::outgoing_direct(
            prefix_hex,
            text.to_string(),
            unix_now(),
        ));
        Ok(DirectSendReceipt {
            acknowledged,
            public_key: contact.public_key.clone().unwrap_or_default(),
            name: contact.advertised_name,
        })
    }

    pub async fn send_channel_message(&self, channel: u8, text: &str) -> Result<()> {
        self.session.send_channel(channel, text.to_string()).await?;
        info!("Sent message on channel {}", channel);
        self.metrics.inc_message_sent();
        self.scheduler
            .record_outgoing(Message::outgoing_channel(channel, text.to_string(), unix_now()));
        Ok(())
    }

    /// Log in to a repeater. `Ok(false)` when the repeater denied or never confirmed.
    pub async fn login_to_repeater(&self, name: &str, password: &str) -> Result<bool> {
        let contacts = self.cache.current();
        let mut manager = self.repeaters.lock().await;
        match manager
            .login(name, password, &self.session, &contacts.contacts, unix_now())
            .await
        {
            Ok(()) => Ok(true),
            Err(MeshError::LoginFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Live stats, logging in first when the session expired. Falls back to the cache.
    pub async fn get_repeater_stats(&self, name: &str) -> Result<Option<RepeaterStats>> {
        let contacts = self.cache.current();
        let mut manager = self.repeaters.lock().await;
        manager
            .stats(name, &self.session, &contacts.contacts, unix_now())
            .await
    }

    pub async fn get_repeater_version(&self, name: &str) -> Result<Option<String>> {
        let contacts = self.cache.current();
        let mut manager = self.repeaters.lock().await;
        manager
            .version(name, &self.session, &contacts.contacts, unix_now())
            .await
    }

    /// Send a text command to a repeater and return its reply.
    pub async fn send_repeater_command(&self, name: &str, command: &str) -> Result<Option<String>> {
        let contacts = self.cache.current();
        let mut manager = self.repeaters.lock().await;
        manager
            .command(name, command, &self.session, &contacts.contacts, unix_now())
            .await
    }

    /// Stop the polling loop, interrupt in-flight commands and close the transport.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }
}
