//! Device session: one transport, one driver, one command gate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::driver::{Connector, MeshDriver, RawContact, RawMessage, RawStatus, SelfInfo};
use super::gate::CommandGate;
use super::{Endpoint, TransportKind};
use crate::config::Config;
use crate::error::{DriverError, MeshError, Result};
use crate::logutil::{escape_log, key_preview, redact_secret};
use crate::model::Message;

/// Timing policy for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pause after opening a serial link before the handshake.
    pub serial_settle: Duration,
    /// Pause between transport open and handshake on every transport.
    pub init_delay: Duration,
    pub sync_time: bool,
    /// Budget for transport open, and separately for the handshake.
    pub connect_timeout: Duration,
    /// Outer budget for one refresh operation (drain, contacts, node info).
    pub refresh_timeout: Duration,
    pub ack_timeout: Duration,
    pub login_timeout: Duration,
    pub status_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            serial_settle: Duration::from_millis(500),
            init_delay: Duration::from_millis(100),
            sync_time: false,
            connect_timeout: Duration::from_secs(10),
            refresh_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(3),
            login_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sync_time: config.device.sync_time,
            connect_timeout: Duration::from_secs(config.device.connect_timeout_secs),
            refresh_timeout: Duration::from_secs(config.polling.refresh_timeout_secs),
            ..Self::default()
        }
    }

    /// Budget for a send-then-wait exchange whose inner wait is `wait`.
    fn exchange_budget(&self, wait: Duration) -> Duration {
        wait + self.connect_timeout
    }
}

/// Reply to a remote command, plus any unrelated messages pulled off the device while
/// looking for it. Those must be merged into the backlog by the caller.
#[derive(Debug, Default)]
pub struct CommandReply {
    pub text: Option<String>,
    pub stray: Vec<RawMessage>,
}

/// Outcome of a drain: what was fetched, and the failure that ended it early, if any.
#[derive(Debug, Default)]
pub struct Drained {
    pub messages: Vec<Message>,
    pub error: Option<MeshError>,
}

pub struct DeviceSession {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    gate: CommandGate,
    shutdown: CancellationToken,
    /// Messages fetched by a failed `drain_new_messages`, returned by the next drain.
    held: StdMutex<Vec<Message>>,
}

impl DeviceSession {
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            endpoint,
            connector,
            options,
            gate: CommandGate::new(shutdown.clone()),
            shutdown,
            held: StdMutex::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.endpoint.kind()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.gate.is_connected()
    }

    pub fn gate(&self) -> &CommandGate {
        &self.gate
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); scheduler loops watch it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Reset any existing link, then open the transport, handshake and optionally sync time.
    ///
    /// Holds the gate for the whole sequence. Any failure closes whatever was opened so
    /// the next call starts clean. No retries happen here.
    pub async fn connect(&self) -> Result<SelfInfo> {
        if self.shutdown.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let mut slot = self.gate.lock().await?;
        if self.gate.teardown(&mut slot).await {
            debug!("closed previous link before reconnecting");
        }

        info!(
            "Connecting to MeshCore device over {} ({})",
            self.endpoint.kind(),
            self.endpoint
        );
        let mut driver = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(MeshError::Cancelled),
            opened = timeout(self.options.connect_timeout, self.connector.open(&self.endpoint)) => {
                match opened {
                    Ok(Ok(driver)) => driver,
                    Ok(Err(e)) => {
                        error!("Failed to open transport {}: {}", self.endpoint, e);
                        return Err(MeshError::Connect(format!("transport open failed: {}", e)));
                    }
                    Err(_) => {
                        error!("Timed out opening transport {}", self.endpoint);
                        return Err(MeshError::Connect(format!(
                            "transport open timed out after {}s",
                            self.options.connect_timeout.as_secs()
                        )));
                    }
                }
            }
        };

        let initialized = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(MeshError::Cancelled),
            res = timeout(self.options.connect_timeout, self.initialize(driver.as_mut())) => {
                res.unwrap_or_else(|_| Err(MeshError::Connect("handshake timed out".to_string())))
            }
        };

        match initialized {
            Ok(info) => {
                self.gate.install(&mut slot, driver);
                info!(
                    "Connected to MeshCore node '{}' ({})",
                    escape_log(&info.name),
                    key_preview(&info.public_key)
                );
                Ok(info)
            }
            Err(e) => {
                if let Err(close_err) = driver.close().await {
                    warn!("error while closing transport after failed handshake: {}", close_err);
                }
                error!("Failed to initialize MeshCore connection: {}", e);
                match e {
                    MeshError::Cancelled | MeshError::Connect(_) => Err(e),
                    other => Err(MeshError::Connect(format!("handshake failed: {}", other))),
                }
            }
        }
    }

    async fn initialize(&self, driver: &mut dyn MeshDriver) -> Result<SelfInfo> {
        if self.endpoint.kind() == TransportKind::Usb {
            // Serial links drop the first frames if spoken to immediately after open.
            sleep(self.options.serial_settle).await;
        }
        sleep(self.options.init_delay).await;

        let info = driver.send_appstart().await?;

        if self.options.sync_time {
            let now = chrono::Utc::now().timestamp().max(0) as u32;
            match driver.set_time(now).await {
                Ok(true) => info!("Synchronized device time to {}", now),
                Ok(false) => warn!("Device refused time synchronization"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(info)
    }

    /// Close the transport. Always succeeds and is safe to call in any state.
    pub async fn disconnect(&self) {
        let mut slot = self.gate.lock_for_release().await;
        if self.gate.teardown(&mut slot).await {
            info!("Disconnected from MeshCore device");
        }
    }

    /// Cancel in-flight operations, then disconnect. The session cannot reconnect afterwards.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.disconnect().await;
    }

    /// See [`CommandGate::with_exclusive_access`].
    pub async fn with_exclusive_access<T, F>(
        &self,
        op_name: &'static str,
        budget: Duration,
        op: F,
    ) -> Result<T>
    where
        F: for<'d> FnOnce(&'d mut (dyn MeshDriver + 'static)) -> super::DeviceFuture<'d, T>,
    {
        self.gate.with_exclusive_access(op_name, budget, op).await
    }

    /// App-start plus battery read, as one exclusive operation. A failed battery read
    /// is tolerated and reported as `None`.
    pub async fn node_info(&self) -> Result<(SelfInfo, Option<u32>)> {
        self.with_exclusive_access("node_info", self.options.refresh_timeout, |d| {
            Box::pin(async move {
                let info = d.send_appstart().await?;
                let battery = match d.get_bat().await {
                    Ok(mv) => Some(mv),
                    Err(e) => {
                        warn!("Failed to get battery level: {}", e);
                        None
                    }
                };
                Ok::<_, MeshError>((info, battery))
            })
        })
        .await
    }

    pub async fn contacts(&self) -> Result<BTreeMap<String, RawContact>> {
        self.with_exclusive_access("get_contacts", self.options.refresh_timeout, |d| {
            Box::pin(async move { Ok::<_, MeshError>(d.get_contacts().await?) })
        })
        .await
    }

    /// Fetch buffered messages until the device reports exhaustion.
    ///
    /// Returns everything that came off the device, including messages fetched before a
    /// failure, together with that failure. The device never re-delivers a message, so
    /// callers must keep `messages` even when `error` is set. Messages held back by an
    /// earlier failed [`drain_new_messages`](Self::drain_new_messages) come first.
    pub async fn drain(&self) -> Drained {
        let mut messages = std::mem::take(&mut *self.lock_held());
        let sink: Arc<StdMutex<Vec<RawMessage>>> = Arc::default();
        let fetched = Arc::clone(&sink);
        // The loop has no iteration cap; the refresh budget bounds a device that never
        // stops answering.
        let result = self
            .with_exclusive_access("drain_messages", self.options.refresh_timeout, move |d| {
                Box::pin(async move {
                    while let Some(msg) = d.get_msg().await? {
                        fetched
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push(msg);
                    }
                    Ok::<_, MeshError>(())
                })
            })
            .await;
        let raw = std::mem::take(&mut *sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        messages.extend(validate_messages(&raw));
        let error = result.err();
        if let Some(e) = &error {
            if !raw.is_empty() {
                warn!("Drain interrupted after {} message(s): {}", raw.len(), e);
            }
        }
        Drained { messages, error }
    }

    /// [`drain`](Self::drain) as a plain result. On failure the messages already fetched
    /// are held and returned by the next drain.
    pub async fn drain_new_messages(&self) -> Result<Vec<Message>> {
        let Drained { messages, error } = self.drain().await;
        match error {
            None => Ok(messages),
            Some(e) => {
                self.lock_held().extend(messages);
                Err(e)
            }
        }
    }

    fn lock_held(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send a direct message and wait for the ACK. Returns whether an ACK arrived.
    pub async fn send_direct(&self, dest_prefix: Vec<u8>, text: String) -> Result<bool> {
        let ack_timeout = self.options.ack_timeout;
        self.with_exclusive_access("send_msg", self.options.exchange_budget(ack_timeout), move |d| {
            Box::pin(async move {
                if !d.send_msg(&dest_prefix, &text).await? {
                    return Err(DriverError::Rejected { op: "send_msg" }.into());
                }
                Ok::<_, MeshError>(d.wait_ack(ack_timeout).await?)
            })
        })
        .await
    }

    /// Send to a channel. Channel messages are not acknowledged.
    pub async fn send_channel(&self, channel: u8, text: String) -> Result<()> {
        self.with_exclusive_access("send_chan_msg", self.options.refresh_timeout, move |d| {
            Box::pin(async move {
                if !d.send_chan_msg(channel, &text).await? {
                    return Err(DriverError::Rejected { op: "send_chan_msg" }.into());
                }
                Ok::<_, MeshError>(())
            })
        })
        .await
    }

    /// Log in to a peer. An immediate acknowledgement counts as success; otherwise wait
    /// for the asynchronous confirmation. `Ok(false)` means denied or not confirmed.
    pub async fn login(&self, peer_key: Vec<u8>, password: String) -> Result<bool> {
        let login_timeout = self.options.login_timeout;
        debug!(
            "sending login to {} ({})",
            hex::encode(&peer_key[..peer_key.len().min(6)]),
            redact_secret(&password)
        );
        self.with_exclusive_access("login", self.options.exchange_budget(login_timeout), move |d| {
            Box::pin(async move {
                if d.send_login(&peer_key, &password).await? {
                    return Ok(true);
                }
                Ok::<_, MeshError>(d.wait_login(login_timeout).await?)
            })
        })
        .await
    }

    /// Request status from a peer. `Ok(None)` means no reply within the status timeout.
    pub async fn status(&self, peer_key: Vec<u8>) -> Result<Option<RawStatus>> {
        let status_timeout = self.options.status_timeout;
        self.with_exclusive_access("status", self.options.exchange_budget(status_timeout), move |d| {
            Box::pin(async move {
                if !d.send_statusreq(&peer_key).await? {
                    return Err(DriverError::Rejected { op: "send_statusreq" }.into());
                }
                Ok::<_, MeshError>(d.wait_status(status_timeout).await?)
            })
        })
        .await
    }

    /// Send a text command to a peer and collect its reply.
    ///
    /// After the new-message notification, buffered messages are read until one from
    /// `peer_prefix` shows up or the buffer is exhausted. Anything else read on the way
    /// is returned in [`CommandReply::stray`].
    pub async fn remote_command(&self, peer_prefix: Vec<u8>, command: String) -> Result<CommandReply> {
        let reply_timeout = self.options.reply_timeout;
        let expected = hex::encode(&peer_prefix);
        self.with_exclusive_access("remote_command", self.options.exchange_budget(reply_timeout), move |d| {
            Box::pin(async move {
                if !d.send_cmd(&peer_prefix, &command).await? {
                    return Err(DriverError::Rejected { op: "send_cmd" }.into());
                }
                let mut reply = CommandReply::default();
                if !d.wait_msg(reply_timeout).await? {
                    return Ok(reply);
                }
                while let Some(msg) = d.get_msg().await? {
                    match msg {
                        RawMessage::Private { pubkey_prefix, text, .. }
                            if pubkey_matches(&pubkey_prefix, &expected) =>
                        {
                            reply.text = Some(text.trim().to_string());
                            break;
                        }
                        other => reply.stray.push(other),
                    }
                }
                Ok::<_, MeshError>(reply)
            })
        })
        .await
    }
}

fn pubkey_matches(prefix: &str, expected: &str) -> bool {
    let prefix = prefix.trim().to_lowercase();
    !prefix.is_empty() && (expected.starts_with(&prefix) || prefix.starts_with(expected))
}

/// Convert drained payloads, skipping any that fail validation.
pub fn validate_messages(raw: &[RawMessage]) -> Vec<Message> {
    raw.iter()
        .filter_map(|r| match Message::from_raw(r) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                None
            }
        })
        .collect()
}
