//! Configuration types.
//!
//! Tenant mail settings are owned by tenant storage and handed to the pipeline
//! read-only; runtime knobs come from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default polling interval: 5 minutes.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Default bound on every mailbox / SMTP network call.
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;

/// Inbound mailbox endpoint for one tenant.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub use_tls: bool,
}

impl ImapConfig {
    /// A tenant is polled only when it has both a server host and a port.
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }
}

/// Outbound SMTP endpoint for one tenant.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Implicit TLS when true, STARTTLS otherwise.
    pub use_tls: bool,
    /// Address replies are sent from. Falls back to `username` when empty.
    pub from_address: String,
}

impl SmtpConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    pub fn sender(&self) -> &str {
        if self.from_address.trim().is_empty() {
            &self.username
        } else {
            &self.from_address
        }
    }
}

/// Per-tenant mail configuration.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
}

/// One website served by the pipeline.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub mail: MailConfig,
    /// Location of this tenant's message store.
    pub db_path: PathBuf,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub network_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            network_timeout: Duration::from_secs(DEFAULT_NETWORK_TIMEOUT_SECS),
        }
    }
}

impl SchedulerConfig {
    /// Build config from environment variables, keeping defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let poll_interval = env_secs("REPLYDESK_POLL_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);
        let network_timeout = env_secs("REPLYDESK_NETWORK_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.network_timeout);

        Ok(Self {
            poll_interval,
            network_timeout,
        })
    }
}

/// Host process configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Control database holding the `websites` table.
    pub db_path: PathBuf,
    pub scheduler: SchedulerConfig,
}

impl HostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("REPLYDESK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/replydesk.db"));

        Ok(Self {
            db_path,
            scheduler: SchedulerConfig::from_env()?,
        })
    }
}

/// Read a positive number of seconds from `key`. Unset means `None`.
fn env_secs(key: &str) -> Result<Option<u64>, ConfigError> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    let secs: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{e}"),
    })?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(Some(secs))
}
