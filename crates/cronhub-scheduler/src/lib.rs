//! # cronhub scheduler
//!
//! Cron-driven execution engine for shell commands and HTTP requests.
//!
//! ## Design Principles
//! - The task store is the only shared state; claims live there too
//! - At most one in-flight execution per task, across processes
//! - Tokio timers only, zero overhead when idle
//! - Recording is authoritative, notification is best-effort
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval)
//!   ├── fetch non-INACTIVE tasks → cron due check
//!   ├── claim (store lease) → bounded worker pool
//!   └── per execution:
//!         TaskRunner ──┬── CommandExecutor (bash / pwsh, kill on drop)
//!                      └── RequestExecutor (AuthTokenResolver, retry)
//!         → ExecutionRecorder (one atomic store update)
//!         → NotificationDispatcher → worker → Notifier
//!                                        ├── Email (SMTP)
//!                                        ├── Webhook (HTTP POST)
//!                                        └── Log
//! ```

use std::sync::Arc;

use cronhub_core::config::{StoreBackend, StoreConfig, expand_path};
use cronhub_core::error::Result;
use cronhub_core::traits::TaskStore;

pub mod auth;
pub mod command;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod recorder;
pub mod request;
pub mod runner;
pub mod store;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::AuthTokenResolver;
pub use command::CommandExecutor;
pub use cron::CronSchedule;
pub use dispatch::{EmailNotifier, LogNotifier, WebhookNotifier, notifier_from_config};
pub use engine::{SchedulerEngine, TaskPhase, TickReport, spawn_scheduler};
pub use notify::NotificationDispatcher;
pub use persistence::SqliteTaskStore;
pub use recorder::ExecutionRecorder;
pub use request::RequestExecutor;
pub use runner::TaskRunner;
pub use store::MemoryTaskStore;

/// Open the task store selected in config.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn TaskStore>> {
    let path = expand_path(&config.path);
    let store: Arc<dyn TaskStore> = match config.backend {
        StoreBackend::Sqlite => Arc::new(SqliteTaskStore::open(&path)?),
        StoreBackend::Json => Arc::new(MemoryTaskStore::open(&path)?),
    };
    tracing::debug!("Opened {:?} store at {}", config.backend, path.display());
    Ok(store)
}
