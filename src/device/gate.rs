//! Exclusive-access section guarding the single command channel.
//!
//! The gate owns the driver slot. Holding the slot lock is the only way to reach the
//! driver, so two exchanges can never interleave on the wire. Every exchange runs
//! under a time budget and the session's cancellation token; the lock is released on
//! every exit path when the guard drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::driver::{DeviceFuture, MeshDriver};
use crate::error::{MeshError, Result};

pub(crate) type Slot = Option<Box<dyn MeshDriver>>;

pub struct CommandGate {
    slot: Mutex<Slot>,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl CommandGate {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            slot: Mutex::new(None),
            connected: AtomicBool::new(false),
            cancel,
        }
    }

    /// True only between a successful connect and the next disconnect or fatal error.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `op` with exclusive use of the driver.
    ///
    /// The lock is taken once for the whole operation, so a multi-primitive sequence
    /// (send then wait, login then verify) cannot be split by another caller. The
    /// operation fails with [`MeshError::CommandTimeout`] when `budget` elapses and with
    /// [`MeshError::Cancelled`] when the session shuts down. A link-fatal error closes
    /// the driver and marks the gate disconnected before the lock is released.
    pub async fn with_exclusive_access<T, F>(
        &self,
        op_name: &'static str,
        budget: Duration,
        op: F,
    ) -> Result<T>
    where
        F: for<'d> FnOnce(&'d mut (dyn MeshDriver + 'static)) -> DeviceFuture<'d, T>,
    {
        let mut slot = self.lock().await?;
        let outcome = match slot.as_mut() {
            None => return Err(MeshError::NotConnected),
            Some(driver) => {
                debug!("gate: {} acquired", op_name);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(MeshError::Cancelled),
                    res = tokio::time::timeout(budget, op(driver.as_mut())) => {
                        res.unwrap_or_else(|_| Err(MeshError::CommandTimeout { op: op_name, after: budget }))
                    }
                }
            }
        };
        if let Err(err) = &outcome {
            if err.is_link_fatal() {
                warn!("{} failed with a dead link ({}); tearing down session", op_name, err);
                self.teardown(&mut slot).await;
            }
        }
        outcome
    }

    /// Lock the driver slot, giving up if the session is cancelled first.
    pub(crate) async fn lock(&self) -> Result<MutexGuard<'_, Slot>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MeshError::Cancelled),
            guard = self.slot.lock() => Ok(guard),
        }
    }

    /// Lock the slot ignoring cancellation. Used by disconnect, which must run after shutdown.
    pub(crate) async fn lock_for_release(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().await
    }

    pub(crate) fn install(&self, slot: &mut MutexGuard<'_, Slot>, driver: Box<dyn MeshDriver>) {
        **slot = Some(driver);
        self.connected.store(true, Ordering::Release);
    }

    /// Close and drop the driver held in `slot`. Never fails; returns whether a driver was present.
    pub(crate) async fn teardown(&self, slot: &mut MutexGuard<'_, Slot>) -> bool {
        self.connected.store(false, Ordering::Release);
        match slot.take() {
            Some(mut driver) => {
                if let Err(e) = driver.close().await {
                    warn!("error while closing transport: {}", e);
                }
                true
            }
            None => false,
        }
    }
}
