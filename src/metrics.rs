//! Counters for one coordinator.
//!
//! Plain atomics, read through [`Metrics::snapshot`]. Per-repeater counters sit behind a
//! mutex since the set of repeaters is only known at runtime.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RepeaterCounter {
    pub logins: u64,
    pub login_failures: u64,
    pub stats_fetched: u64,
    pub stats_missed: u64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    ticks_run: AtomicU64,
    ticks_skipped: AtomicU64,
    messages_refreshed: AtomicU64,
    messages_failed: AtomicU64,
    info_refreshed: AtomicU64,
    info_failed: AtomicU64,
    messages_drained: AtomicU64,
    messages_sent: AtomicU64,
    tick_duration_sum_ms: AtomicU64,
    tick_duration_count: AtomicU64,
    repeaters: Mutex<BTreeMap<String, RepeaterCounter>>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub messages_refreshed: u64,
    pub messages_failed: u64,
    pub info_refreshed: u64,
    pub info_failed: u64,
    pub messages_drained: u64,
    pub messages_sent: u64,
    pub tick_duration_avg_ms: Option<u64>,
    pub repeaters: BTreeMap<String, RepeaterCounter>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_connect_attempt(&self) {
        bump(&self.connect_attempts);
    }

    pub fn inc_connect_failure(&self) {
        bump(&self.connect_failures);
    }

    pub fn inc_tick_skipped(&self) {
        bump(&self.ticks_skipped);
    }

    pub fn observe_tick(&self, started: Instant) {
        bump(&self.ticks_run);
        let ms = started.elapsed().as_millis() as u64;
        self.tick_duration_sum_ms.fetch_add(ms, Ordering::Relaxed);
        bump(&self.tick_duration_count);
    }

    pub fn record_messages(&self, ok: bool) {
        bump(if ok {
            &self.messages_refreshed
        } else {
            &self.messages_failed
        });
    }

    pub fn record_info(&self, ok: bool) {
        bump(if ok { &self.info_refreshed } else { &self.info_failed });
    }

    pub fn add_messages_drained(&self, count: usize) {
        self.messages_drained
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_message_sent(&self) {
        bump(&self.messages_sent);
    }

    fn repeaters(&self) -> MutexGuard<'_, BTreeMap<String, RepeaterCounter>> {
        self.repeaters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_login(&self, repeater: &str, ok: bool) {
        let mut guard = self.repeaters();
        let counter = guard.entry(repeater.to_string()).or_default();
        if ok {
            counter.logins = counter.logins.saturating_add(1);
        } else {
            counter.login_failures = counter.login_failures.saturating_add(1);
        }
    }

    pub fn record_stats(&self, repeater: &str, ok: bool) {
        let mut guard = self.repeaters();
        let counter = guard.entry(repeater.to_string()).or_default();
        if ok {
            counter.stats_fetched = counter.stats_fetched.saturating_add(1);
        } else {
            counter.stats_missed = counter.stats_missed.saturating_add(1);
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let sum = self.tick_duration_sum_ms.load(Ordering::Relaxed);
        let count = self.tick_duration_count.load(Ordering::Relaxed);
        Snapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            ticks_run: self.ticks_run.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            messages_refreshed: self.messages_refreshed.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            info_refreshed: self.info_refreshed.load(Ordering::Relaxed),
            info_failed: self.info_failed.load(Ordering::Relaxed),
            messages_drained: self.messages_drained.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            tick_duration_avg_ms: if count > 0 { Some(sum / count) } else { None },
            repeaters: self.repeaters().clone(),
        }
    }
}
