//! Repeater login sessions and the stats/version queries they gate.
//!
//! Each configured repeater moves through `LoggedOut -> LoggingIn -> LoggedIn` and
//! falls back to `LoggedOut` once the login is older than [`LOGIN_TTL_SECS`]. Sessions
//! are never verified actively: a failed stats or version query is a miss that keeps
//! the cached value, and re-login only happens when the TTL runs out.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::RepeaterConfig;
use crate::device::{DeviceSession, RawMessage};
use crate::error::{MeshError, Result};
use crate::logutil::{escape_log, redact_secret};
use crate::metrics::Metrics;
use crate::model::{Contact, RepeaterStats};

/// Age after which a repeater login is considered expired.
pub const LOGIN_TTL_SECS: u64 = 3600;
/// Minimum spacing of firmware version checks after an admin login.
pub const VERSION_CHECK_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoginState {
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

/// Session bookkeeping for one repeater. Timestamps are seconds since the epoch;
/// `None` means never.
#[derive(Debug, Clone, Serialize)]
pub struct RepeaterPeer {
    pub name: String,
    #[serde(skip)]
    pub password: String,
    pub poll_interval_secs: u64,
    /// Polled by the scheduler. Peers added through an explicit login are not.
    pub enabled: bool,
    pub login_state: LoginState,
    /// Last login was with a password rather than as guest.
    pub admin: bool,
    pub last_login_at: Option<u64>,
    pub last_stats_at: Option<u64>,
    pub last_version_check_at: Option<u64>,
    pub cached_stats: Option<RepeaterStats>,
    pub cached_version: Option<String>,
}

impl RepeaterPeer {
    pub fn new(name: &str, password: &str, poll_interval_secs: u64, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            password: password.to_string(),
            poll_interval_secs,
            enabled,
            login_state: LoginState::LoggedOut,
            admin: false,
            last_login_at: None,
            last_stats_at: None,
            last_version_check_at: None,
            cached_stats: None,
            cached_version: None,
        }
    }

    pub fn from_config(cfg: &RepeaterConfig) -> Self {
        Self::new(&cfg.name, &cfg.password, cfg.poll_interval_secs, cfg.enabled)
    }

    /// Stats refresh due: enabled and the poll interval has passed since the last attempt.
    pub fn is_due(&self, now: u64) -> bool {
        self.enabled
            && match self.last_stats_at {
                None => true,
                Some(at) => now.saturating_sub(at) >= self.poll_interval_secs,
            }
    }

    pub fn login_fresh(&self, now: u64) -> bool {
        self.login_state == LoginState::LoggedIn
            && match self.last_login_at {
                Some(at) => now.saturating_sub(at) <= LOGIN_TTL_SECS,
                None => false,
            }
    }

    fn version_check_due(&self, now: u64) -> bool {
        self.admin
            && match self.last_version_check_at {
                None => true,
                Some(at) => now.saturating_sub(at) >= VERSION_CHECK_INTERVAL_SECS,
            }
    }
}

/// Find the contact for a repeater by advertised name.
fn resolve<'c>(contacts: &'c BTreeMap<String, Contact>, name: &str) -> Result<&'c Contact> {
    contacts
        .values()
        .find(|c| c.advertised_name == name)
        .ok_or_else(|| MeshError::UnknownContact(name.to_string()))
}

pub struct RepeaterSessionManager {
    peers: BTreeMap<String, RepeaterPeer>,
    /// Messages read off the device while waiting for command replies.
    stray: Vec<RawMessage>,
    metrics: Arc<Metrics>,
}

impl RepeaterSessionManager {
    pub fn new(configs: &[RepeaterConfig], metrics: Arc<Metrics>) -> Self {
        Self {
            peers: configs
                .iter()
                .map(|c| (c.name.clone(), RepeaterPeer::from_config(c)))
                .collect(),
            stray: Vec::new(),
            metrics,
        }
    }

    pub fn peer(&self, name: &str) -> Option<&RepeaterPeer> {
        self.peers.get(name)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RepeaterPeer> {
        self.peers.values()
    }

    /// Names of enabled repeaters whose stats refresh is due at `now`.
    pub fn due(&self, now: u64) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.is_due(now))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Names of every enabled repeater, due or not.
    pub fn enabled(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.enabled)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Cached stats for every repeater that has any.
    pub fn cached_stats(&self) -> BTreeMap<String, RepeaterStats> {
        self.peers
            .values()
            .filter_map(|p| p.cached_stats.clone().map(|s| (p.name.clone(), s)))
            .collect()
    }

    pub fn take_stray_messages(&mut self) -> Vec<RawMessage> {
        std::mem::take(&mut self.stray)
    }

    /// Scheduled refresh for one peer: login if the session expired, then stats, then
    /// the daily version check when logged in as admin.
    ///
    /// `last_stats_at` is stamped on every attempt, so a failing peer is retried only
    /// after its own poll interval. Returns the fresh stats, or the reason for the miss.
    pub async fn refresh(
        &mut self,
        name: &str,
        session: &DeviceSession,
        contacts: &BTreeMap<String, Contact>,
        now: u64,
    ) -> Result<RepeaterStats> {
        let peer = self
            .peers
            .get_mut(name)
            .ok_or_else(|| MeshError::UnknownContact(name.to_string()))?;
        peer.last_stats_at = Some(now);

        let contact = resolve(contacts, name)?;
        if !peer.login_fresh(now) {
            let password = peer.password.clone();
            Self::login_peer(peer, session, contact, &password, now, &self.metrics).await?;
        }

        let stats = Self::query_stats(peer, session, contact, now, &self.metrics).await;

        if peer.version_check_due(now) {
            peer.last_version_check_at = Some(now);
            match Self::remote_command(&mut self.stray, session, contact, "ver").await {
                Ok(Some(version)) => {
                    info!("Repeater {} runs {}", escape_log(name), escape_log(&version));
                    peer.cached_version = Some(version);
                }
                Ok(None) => warn!("No version reply from repeater {}", escape_log(name)),
                Err(e) => warn!("Version check for {} failed: {}", escape_log(name), e),
            }
        }
        stats
    }

    /// Explicit login, e.g. from the command surface. Unknown names become unpolled
    /// peers so later stats or version calls can reuse the session.
    pub async fn login(
        &mut self,
        name: &str,
        password: &str,
        session: &DeviceSession,
        contacts: &BTreeMap<String, Contact>,
        now: u64,
    ) -> Result<()> {
        let contact = resolve(contacts, name)?;
        let peer = self
            .peers
            .entry(name.to_string())
            .or_insert_with(|| RepeaterPeer::new(name, password, 300, false));
        peer.password = password.to_string();
        Self::login_peer(peer, session, contact, password, now, &self.metrics).await
    }

    /// Live stats query, logging in first when needed. A refused login or a missed
    /// status reply returns the cached value; session and lookup errors propagate.
    pub async fn stats(
        &mut self,
        name: &str,
        session: &DeviceSession,
        contacts: &BTreeMap<String, Contact>,
        now: u64,
    ) -> Result<Option<RepeaterStats>> {
        let contact = resolve(contacts, name)?;
        let metrics = Arc::clone(&self.metrics);
        let cached = self.peers.get(name).and_then(|p| p.cached_stats.clone());
        let peer = match self.ensure_session(name, session, contact, now).await {
            Ok(peer) => peer,
            Err(MeshError::LoginFailed(_)) => {
                debug!("Login to {} failed, returning cached stats", escape_log(name));
                return Ok(cached);
            }
            Err(e) => return Err(e),
        };
        peer.last_stats_at = Some(now);
        match Self::query_stats(peer, session, contact, now, &metrics).await {
            Ok(stats) => Ok(Some(stats)),
            Err(_) => Ok(peer.cached_stats.clone()),
        }
    }

    /// Firmware version via the `ver` command. A refused login or a missed reply
    /// returns the cached value.
    pub async fn version(
        &mut self,
        name: &str,
        session: &DeviceSession,
        contacts: &BTreeMap<String, Contact>,
        now: u64,
    ) -> Result<Option<String>> {
        let contact = resolve(contacts, name)?;
        match self.ensure_session(name, session, contact, now).await {
            Ok(_) => {}
            Err(MeshError::LoginFailed(_)) => {
                debug!("Login to {} failed, returning cached version", escape_log(name));
                return Ok(self.peers.get(name).and_then(|p| p.cached_version.clone()));
            }
            Err(e) => return Err(e),
        }
        let reply = Self::remote_command(&mut self.stray, session, contact, "ver").await;
        let peer = self
            .peers
            .get_mut(name)
            .ok_or_else(|| MeshError::UnknownContact(name.to_string()))?;
        peer.last_version_check_at = Some(now);
        match reply {
            Ok(Some(version)) => {
                peer.cached_version = Some(version.clone());
                Ok(Some(version))
            }
            Ok(None) => Ok(peer.cached_version.clone()),
            Err(e) => {
                warn!("Version query for {} failed: {}", escape_log(name), e);
                Ok(peer.cached_version.clone())
            }
        }
    }

    /// Arbitrary text command to a logged-in repeater. Returns the reply text, if any.
    pub async fn command(
        &mut self,
        name: &str,
        command: &str,
        session: &DeviceSession,
        contacts: &BTreeMap<String, Contact>,
        now: u64,
    ) -> Result<Option<String>> {
        let contact = resolve(contacts, name)?;
        self.ensure_session(name, session, contact, now).await?;
        Self::remote_command(&mut self.stray, session, contact, command).await
    }

    /// Peer for `name` with a fresh login, logging in with the stored password if not.
    async fn ensure_session(
        &mut self,
        name: &str,
        session: &DeviceSession,
        contact: &Contact,
        now: u64,
    ) -> Result<&mut RepeaterPeer> {
        let peer = self
            .peers
            .entry(name.to_string())
            .or_insert_with(|| RepeaterPeer::new(name, "", 300, false));
        if !peer.login_fresh(now) {
            let password = peer.password.clone();
            Self::login_peer(peer, session, contact, &password, now, &self.metrics).await?;
        }
        Ok(peer)
    }

    /// Login transition. Success stamps `last_login_at`; denial or timeout leaves the
    /// peer logged out with only `last_stats_at` bumped so the retry waits a poll interval.
    async fn login_peer(
        peer: &mut RepeaterPeer,
        session: &DeviceSession,
        contact: &Contact,
        password: &str,
        now: u64,
        metrics: &Metrics,
    ) -> Result<()> {
        if peer.login_state == LoginState::LoggedIn {
            debug!("Login to {} expired", escape_log(&peer.name));
        }
        peer.login_state = LoginState::LoggingIn;
        let key = match contact.full_key_bytes() {
            Ok(key) => key,
            Err(e) => {
                peer.login_state = LoginState::LoggedOut;
                return Err(e);
            }
        };
        info!(
            "Logging in to repeater {} ({})",
            escape_log(&peer.name),
            redact_secret(password)
        );
        match session.login(key, password.to_string()).await {
            Ok(true) => {
                peer.login_state = LoginState::LoggedIn;
                peer.last_login_at = Some(now);
                peer.admin = !password.is_empty();
                metrics.record_login(&peer.name, true);
                info!("Logged in to repeater {}", escape_log(&peer.name));
                Ok(())
            }
            Ok(false) => {
                peer.login_state = LoginState::LoggedOut;
                peer.last_stats_at = Some(now);
                metrics.record_login(&peer.name, false);
                warn!("Login to repeater {} denied or unconfirmed", escape_log(&peer.name));
                Err(MeshError::LoginFailed(peer.name.clone()))
            }
            Err(e) => {
                peer.login_state = LoginState::LoggedOut;
                peer.last_stats_at = Some(now);
                metrics.record_login(&peer.name, false);
                warn!("Login to repeater {} failed: {}", escape_log(&peer.name), e);
                Err(e)
            }
        }
    }

    async fn query_stats(
        peer: &mut RepeaterPeer,
        session: &DeviceSession,
        contact: &Contact,
        now: u64,
        metrics: &Metrics,
    ) -> Result<RepeaterStats> {
        let key = contact.full_key_bytes()?;
        let reply = session.status(key).await;
        metrics.record_stats(&peer.name, matches!(reply, Ok(Some(_))));
        match reply {
            Ok(Some(raw)) => {
                let stats = RepeaterStats::from_raw(&raw, now);
                debug!(
                    "Repeater {} stats: bat={}mV uptime={}s",
                    escape_log(&peer.name),
                    stats.battery_mv,
                    stats.uptime_secs
                );
                peer.cached_stats = Some(stats.clone());
                Ok(stats)
            }
            Ok(None) => {
                warn!("No status reply from repeater {}", escape_log(&peer.name));
                Err(MeshError::CommandTimeout {
                    op: "status",
                    after: session.options().status_timeout,
                })
            }
            Err(e) => {
                warn!("Status request to {} failed: {}", escape_log(&peer.name), e);
                Err(e)
            }
        }
    }

    async fn remote_command(
        stray: &mut Vec<RawMessage>,
        session: &DeviceSession,
        contact: &Contact,
        command: &str,
    ) -> Result<Option<String>> {
        let prefix = contact.key_prefix_bytes()?;
        let reply = session.remote_command(prefix, command.to_string()).await?;
        stray.extend(reply.stray);
        Ok(reply.text)
    }
}
