//! # quiesce-core
//!
//! Core library for quiesce - a quiescence batcher with crash-safe persistence.
//!
//! This library provides:
//! - The [`Collector`], which buffers items and flushes them as one batch
//!   after a quiescence delay
//! - Scheduler implementations (virtual clock and tokio)
//! - Key-value stores for persisting the pending batch (memory and SQLite)
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! The collector depends on two injected capabilities:
//! - **Scheduler:** runs a task after a delay and can cancel it
//! - **Store:** `get`/`set`/`delete` by key, plus an atomic claim
//!
//! ## Example
//!
//! ```rust,no_run
//! use quiesce_core::{Collector, Config, TokioScheduler};
//! use std::sync::Arc;
//!
//! # async fn run() -> quiesce_core::Result<()> {
//! let config = Config::load()?;
//! let scheduler = Arc::new(TokioScheduler::current()?);
//!
//! let collector: Collector<String> = Collector::new(&config.collector, scheduler)?;
//! collector.on_flush(|batch| println!("{}", batch.join(",")));
//! collector.push("event".to_string());
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use collector::{
    Collector, CollectorEvent, CollectorStats, EmitReport, ListenerError, ListenerResult,
    PersistedState, Persistence, Subscription,
};
pub use config::{CollectorConfig, Config, LoggingConfig, StorageType, DEFAULT_STORAGE_KEY};
pub use error::{Error, Result};
pub use scheduler::{Scheduler, Task, TimerHandle, TokioScheduler, VirtualClock};
pub use store::{session_store, KeyValueStore, MemoryStore, SqliteStore};

// Public modules
pub mod collector;
pub mod config;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod store;
