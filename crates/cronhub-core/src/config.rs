//! cronhub configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CronHubError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronHubConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl CronHubConfig {
    /// Load config from the default path (~/.cronhub/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CronHubError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CronHubError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the cronhub home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cronhub")
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn bool_true() -> bool { true }

/// Polling loop and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Added to a task's timeout to size its claim lease.
    #[serde(default = "default_claim_grace")]
    pub claim_grace_secs: u64,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Only poll tasks of this organization.
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default = "default_notification_queue")]
    pub notification_queue: usize,
}

fn default_poll_interval() -> u64 { 30 }
fn default_max_concurrency() -> usize { 4 }
fn default_claim_grace() -> u64 { 60 }
fn default_notification_queue() -> usize { 64 }

/// `<hostname>-<8 hex>`, unique per process.
pub fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "cronhub".into());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_concurrency: default_max_concurrency(),
            claim_grace_secs: default_claim_grace(),
            instance_id: default_instance_id(),
            organization_id: None,
            notification_queue: default_notification_queue(),
        }
    }
}

/// Executor defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Used when a task has no (enabled) timeout of its own.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    #[serde(default = "default_bash_path")]
    pub bash_path: String,
    #[serde(default = "default_pwsh_path")]
    pub pwsh_path: String,
    #[serde(default = "default_sudo_path")]
    pub sudo_path: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout() -> u64 { 30 }
fn default_max_output() -> usize { 64 * 1024 }
fn default_bash_path() -> String { "bash".into() }
fn default_pwsh_path() -> String { "pwsh".into() }
fn default_sudo_path() -> String { "sudo".into() }
fn default_user_agent() -> String { format!("cronhub/{}", env!("CARGO_PKG_VERSION")) }

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout(),
            max_output_bytes: default_max_output(),
            bash_path: default_bash_path(),
            pwsh_path: default_pwsh_path(),
            sudo_path: default_sudo_path(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Json,
}

/// Task store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite file, or directory holding `tasks.json`.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.cronhub/cronhub.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyBackend {
    #[default]
    Log,
    Email,
    Webhook,
}

/// Notification transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub backend: NotifyBackend,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub email: Option<EmailNotifyConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookNotifyConfig>,
}

fn default_notify_timeout() -> u64 { 10 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            backend: NotifyBackend::default(),
            timeout_secs: default_notify_timeout(),
            email: None,
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailNotifyConfig {
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Sender address.
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "bool_true")]
    pub starttls: bool,
}

fn default_smtp_port() -> u16 { 587 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookNotifyConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}
