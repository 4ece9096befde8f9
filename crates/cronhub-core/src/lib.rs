//! # cronhub core
//!
//! Shared data model, error taxonomy, configuration and the boundary traits
//! the scheduling engine talks through. No I/O lives here apart from loading
//! the config file.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::CronHubConfig;
pub use error::{CronHubError, Result};
