//! Multi-rate refresh scheduler.
//!
//! One tick at a time, each tick running up to three refresh kinds in a fixed order:
//! messages (every tick), node info plus contacts (every `info_interval`), then stats for
//! each repeater whose own poll interval has elapsed. Ticks run everything until one
//! of them gets a connected session and refreshes something. A failing kind is logged
//! and keeps its cached value; the others still run. Results are applied to a private
//! copy of the snapshot and published once at the end of the tick.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::PollingConfig;
use crate::device::session::validate_messages;
use crate::device::{DeviceSession, Drained};
use crate::error::{MeshError, Result};
use crate::logutil::{escape_log, key_preview};
use crate::metrics::Metrics;
use crate::model::{Contact, Message, NodeInfo};
use crate::repeater::RepeaterSessionManager;
use crate::snapshot::{SnapshotCache, StateSnapshot};

/// Side-channel notification for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    ContactDiscovered { contact: Contact },
    MessageReceived { message: Message },
    MessageSent { message: Message },
}

impl fmt::Display for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshEvent::ContactDiscovered { contact } => write!(
                f,
                "new {} contact '{}' ({})",
                contact.node_type,
                escape_log(&contact.advertised_name),
                key_preview(contact.public_key.as_deref().unwrap_or(""))
            ),
            MeshEvent::MessageReceived { message } => write!(
                f,
                "received on {}: {}",
                message.conversation(),
                escape_log(&message.text)
            ),
            MeshEvent::MessageSent { message } => write!(
                f,
                "sent to {}: {}",
                message.conversation(),
                escape_log(&message.text)
            ),
        }
    }
}

/// What happened to one refresh kind in a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Skipped,
    Refreshed,
    Failed(String),
}

impl RefreshOutcome {
    pub fn ran(&self) -> bool {
        !matches!(self, RefreshOutcome::Skipped)
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub at: u64,
    pub cold_start: bool,
    pub connected: bool,
    pub messages: RefreshOutcome,
    pub info: RefreshOutcome,
    pub repeaters: BTreeMap<String, RefreshOutcome>,
    #[serde(skip)]
    pub snapshot: Arc<StateSnapshot>,
}

impl TickReport {
    fn new(at: u64, snapshot: Arc<StateSnapshot>) -> Self {
        Self {
            at,
            cold_start: false,
            connected: false,
            messages: RefreshOutcome::Skipped,
            info: RefreshOutcome::Skipped,
            repeaters: BTreeMap::new(),
            snapshot,
        }
    }

    fn any_succeeded(&self) -> bool {
        self.messages.succeeded()
            || self.info.succeeded()
            || self.repeaters.values().any(RefreshOutcome::succeeded)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub messages_interval_secs: u64,
    pub info_interval_secs: u64,
    pub message_history: usize,
}

impl From<&PollingConfig> for SchedulerSettings {
    fn from(polling: &PollingConfig) -> Self {
        Self {
            messages_interval_secs: polling.messages_interval_secs.max(1),
            info_interval_secs: polling.info_interval_secs.max(1),
            message_history: polling.message_history.max(1),
        }
    }
}

#[derive(Debug)]
struct TickState {
    cold_start_pending: bool,
    last_messages_at: Option<u64>,
    last_info_at: Option<u64>,
}

pub struct RefreshScheduler {
    session: Arc<DeviceSession>,
    repeaters: Arc<Mutex<RepeaterSessionManager>>,
    cache: Arc<SnapshotCache>,
    events: mpsc::UnboundedSender<MeshEvent>,
    metrics: Arc<Metrics>,
    settings: SchedulerSettings,
    /// Held for the whole tick; ticks never overlap.
    state: Mutex<TickState>,
    /// Outgoing messages recorded by the command surface, merged on the next tick.
    outgoing: StdMutex<Vec<Message>>,
}

pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl RefreshScheduler {
    pub fn new(
        session: Arc<DeviceSession>,
        repeaters: Arc<Mutex<RepeaterSessionManager>>,
        cache: Arc<SnapshotCache>,
        events: mpsc::UnboundedSender<MeshEvent>,
        metrics: Arc<Metrics>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            session,
            repeaters,
            cache,
            events,
            metrics,
            settings,
            state: Mutex::new(TickState {
                cold_start_pending: true,
                last_messages_at: None,
                last_info_at: None,
            }),
            outgoing: StdMutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Queue a message the caller just sent for the next snapshot and announce it.
    pub fn record_outgoing(&self, message: Message) {
        self.emit(MeshEvent::MessageSent {
            message: message.clone(),
        });
        self.outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }

    fn emit(&self, event: MeshEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Run one tick unless another is in progress. `None` means skipped.
    pub async fn try_tick_at(&self, now: u64) -> Option<Result<TickReport>> {
        match self.state.try_lock() {
            Ok(mut state) => Some(self.tick_locked(&mut state, now).await),
            Err(_) => {
                self.metrics.inc_tick_skipped();
                debug!("previous refresh still running; skipping tick");
                None
            }
        }
    }

    /// Run one tick at `now` (seconds since the epoch), waiting for a running tick first.
    ///
    /// Returns `Err` only when nothing could be refreshed and no earlier data exists; the
    /// published snapshot is then the placeholder.
    pub async fn tick_at(&self, now: u64) -> Result<TickReport> {
        let mut state = self.state.lock().await;
        self.tick_locked(&mut state, now).await
    }

    async fn tick_locked(&self, state: &mut TickState, now: u64) -> Result<TickReport> {
        let started = Instant::now();
        let result = self.run_tick(state, now).await;
        self.metrics.observe_tick(started);
        result
    }

    async fn run_tick(&self, state: &mut TickState, now: u64) -> Result<TickReport> {
        let previous = self.cache.current();
        let mut report = TickReport::new(now, Arc::clone(&previous));

        if !self.session.is_connected() {
            self.metrics.inc_connect_attempt();
            if let Err(e) = self.session.connect().await {
                self.metrics.inc_connect_failure();
                error!("Refresh skipped, device unreachable: {}", e);
                if !previous.has_data {
                    return Err(e);
                }
                let reason = e.to_string();
                report.messages = RefreshOutcome::Failed(reason.clone());
                report.info = RefreshOutcome::Failed(reason);
                return Ok(report);
            }
        }
        report.connected = true;

        let cold_start = state.cold_start_pending;
        report.cold_start = cold_start;
        if cold_start {
            info!("Initial refresh: fetching messages, node info, contacts and repeater stats");
        }

        let mut next = (*previous).clone();

        // Messages run every tick.
        state.last_messages_at = Some(now);
        report.messages = self.refresh_messages(&mut next).await;

        let info_due = cold_start
            || state
                .last_info_at
                .map_or(true, |at| now.saturating_sub(at) >= self.settings.info_interval_secs);
        if info_due {
            state.last_info_at = Some(now);
            report.info = self.refresh_info(&mut next).await;
        }

        report.repeaters = self.refresh_repeaters(&mut next, cold_start, now).await;

        // A cold start that produced nothing is repeated on the next tick.
        if cold_start && report.any_succeeded() {
            state.cold_start_pending = false;
        }

        if report.any_succeeded() {
            next.has_data = true;
            next.last_successful_refresh_at = Some(now);
        } else if !next.messages.is_empty() {
            // Messages pulled off the device before a failure can't be fetched again.
            next.has_data = true;
        } else if !next.has_data {
            // Every kind failed and there is nothing cached.
            let snapshot = self.cache.publish(StateSnapshot::placeholder());
            report.snapshot = snapshot;
            error!("Initial refresh failed for every data kind");
            return Err(first_failure(&report));
        }

        report.snapshot = self.cache.publish(next);
        Ok(report)
    }

    async fn refresh_messages(&self, next: &mut StateSnapshot) -> RefreshOutcome {
        let cap = self.settings.message_history;

        let stray = self.repeaters.lock().await.take_stray_messages();
        for message in validate_messages(&stray) {
            self.emit(MeshEvent::MessageReceived {
                message: message.clone(),
            });
            next.push_message(message, cap);
        }
        let outgoing = std::mem::take(
            &mut *self
                .outgoing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for message in outgoing {
            next.push_message(message, cap);
        }

        let Drained { messages, error } = self.session.drain().await;
        self.metrics.add_messages_drained(messages.len());
        if !messages.is_empty() {
            info!("Drained {} new message(s)", messages.len());
        }
        for message in messages {
            debug!(
                "message on {}: {}",
                message.conversation(),
                escape_log(&message.text)
            );
            self.emit(MeshEvent::MessageReceived {
                message: message.clone(),
            });
            next.push_message(message, cap);
        }
        self.metrics.record_messages(error.is_none());
        match error {
            None => RefreshOutcome::Refreshed,
            Some(e) => {
                warn!("Message refresh failed, keeping what arrived before the error: {}", e);
                RefreshOutcome::Failed(e.to_string())
            }
        }
    }

    /// Node info then contacts. Whatever succeeds is applied; either failure fails the kind.
    async fn refresh_info(&self, next: &mut StateSnapshot) -> RefreshOutcome {
        let mut failures = Vec::new();

        match self.session.node_info().await {
            Ok((info, battery)) => {
                next.node_info = NodeInfo::from_self_info(&info, battery);
            }
            Err(e) => {
                warn!("Node info refresh failed, keeping cached values: {}", e);
                failures.push(e.to_string());
            }
        }

        match self.session.contacts().await {
            Ok(raw) => {
                let mut contacts = BTreeMap::new();
                for (name, entry) in &raw {
                    match Contact::from_raw(name, entry) {
                        Ok(contact) => {
                            contacts.insert(contact.key().to_string(), contact);
                        }
                        Err(e) => warn!("Skipping contact '{}': {}", escape_log(name), e),
                    }
                }
                let count = contacts.len();
                for contact in next.replace_contacts(contacts) {
                    info!(
                        "Discovered contact '{}' ({})",
                        escape_log(&contact.advertised_name),
                        contact.node_type
                    );
                    self.emit(MeshEvent::ContactDiscovered { contact });
                }
                debug!("contact table has {} entries", count);
            }
            Err(e) => {
                warn!("Contact refresh failed, keeping cached table: {}", e);
                failures.push(e.to_string());
            }
        }

        self.metrics.record_info(failures.is_empty());
        if failures.is_empty() {
            RefreshOutcome::Refreshed
        } else {
            RefreshOutcome::Failed(failures.join("; "))
        }
    }

    async fn refresh_repeaters(
        &self,
        next: &mut StateSnapshot,
        cold_start: bool,
        now: u64,
    ) -> BTreeMap<String, RefreshOutcome> {
        let mut manager = self.repeaters.lock().await;
        let due = if cold_start {
            manager.enabled()
        } else {
            manager.due(now)
        };
        let mut outcomes = BTreeMap::new();
        for name in due {
            let outcome = match manager
                .refresh(&name, &self.session, &next.contacts, now)
                .await
            {
                Ok(_) => RefreshOutcome::Refreshed,
                Err(e) => {
                    warn!(
                        "Stats refresh for repeater {} failed, keeping cached stats: {}",
                        escape_log(&name),
                        e
                    );
                    RefreshOutcome::Failed(e.to_string())
                }
            };
            outcomes.insert(name, outcome);
        }
        next.repeater_stats = manager.cached_stats();
        outcomes
    }

    /// Tick every `messages_interval` until `cancel` fires. Overrunning ticks cause the
    /// missed ones to be skipped, not queued.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.settings.messages_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Refresh scheduler started (messages every {}s, info every {}s)",
            self.settings.messages_interval_secs, self.settings.info_interval_secs
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.try_tick_at(unix_now()) => match outcome {
                    Some(Ok(report)) => debug!(
                        "tick done: messages={:?} info={:?} repeaters={}",
                        report.messages,
                        report.info,
                        report.repeaters.len()
                    ),
                    Some(Err(e)) => warn!("Refresh tick failed with no cached data: {}", e),
                    None => {}
                },
            }
        }
        info!("Refresh scheduler stopped");
    }
}

fn first_failure(report: &TickReport) -> MeshError {
    let reason = [&report.messages, &report.info]
        .into_iter()
        .chain(report.repeaters.values())
        .find_map(|o| match o {
            RefreshOutcome::Failed(reason) => Some(reason.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "no refresh succeeded".to_string());
    MeshError::Protocol(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_clamp_zero_values() {
        let polling = PollingConfig {
            messages_interval_secs: 0,
            info_interval_secs: 60,
            message_history: 0,
            refresh_timeout_secs: 30,
        };
        let settings = SchedulerSettings::from(&polling);
        assert_eq!(settings.messages_interval_secs, 1);
        assert_eq!(settings.message_history, 1);
    }

    #[test]
    fn outcome_predicates() {
        assert!(!RefreshOutcome::Skipped.ran());
        assert!(RefreshOutcome::Refreshed.succeeded());
        let failed = RefreshOutcome::Failed("x".into());
        assert!(failed.ran() && !failed.succeeded());
    }

    #[test]
    fn first_failure_prefers_messages() {
        let mut report = TickReport::new(0, Arc::new(StateSnapshot::placeholder()));
        report.messages = RefreshOutcome::Failed("drain broke".into());
        report.info = RefreshOutcome::Failed("contacts broke".into());
        assert!(first_failure(&report).to_string().contains("drain broke"));
    }
}
