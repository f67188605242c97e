//! # meshcore-mirror - Local Mirror of a MeshCore Radio Node
//!
//! Keeps an eventually-consistent copy of a MeshCore node's state (identity and radio
//! parameters, battery, contact table, message backlog, repeater statistics) over the
//! node's half-duplex companion command channel.
//!
//! ## Features
//!
//! - **Serialized Device Access**: every command exchange runs inside one exclusive
//!   section per node, with per-operation timeouts and prompt cancellation on shutdown.
//! - **Multi-Rate Polling**: messages every tick, node info and contacts on a slower
//!   interval, each repeater on its own interval; one failing kind never blocks the others.
//! - **Repeater Sessions**: guest or admin logins kept for an hour, stats and daily
//!   firmware version checks, cached values served through misses.
//! - **Copy-on-Write Snapshots**: readers get an `Arc` to a complete snapshot through a
//!   `watch` channel and never see a half-applied refresh.
//! - **Event Channel**: new contacts and sent/received messages are announced on an
//!   `mpsc` channel instead of callbacks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshcore_mirror::config::Config;
//! use meshcore_mirror::coordinator::MeshCoordinator;
//! use meshcore_mirror::device::memory::{MemoryConnector, MemoryDeviceState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let connector = Arc::new(MemoryConnector::new(MemoryDeviceState::default()));
//!     let coordinator = MeshCoordinator::from_config(&config, connector)?;
//!     let poller = coordinator.start();
//!     tokio::signal::ctrl_c().await?;
//!     coordinator.shutdown().await;
//!     poller.await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`device`] - driver boundary, command gate, device session, simulated node
//! - [`model`] - typed node info, contacts, messages and repeater stats
//! - [`repeater`] - repeater login state machine
//! - [`snapshot`] - the published mirror
//! - [`scheduler`] - the refresh loop and its event channel
//! - [`coordinator`] - facade and command surface
//! - [`config`] - configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Coordinator   │ ← Command surface, owns everything below
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Scheduler     │ ← Ticks, repeater sessions, snapshot publish
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Device Session  │ ← Command gate over one driver
//! └─────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod logutil;
pub mod metrics;
pub mod model;
pub mod repeater;
pub mod scheduler;
pub mod snapshot;

pub use error::{DriverError, MeshError};
