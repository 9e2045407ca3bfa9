//! Account and engine configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How the TCP connection to the IMAP server is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// TLS from the first byte (usually port 993).
    #[default]
    Tls,
    /// Plain TCP upgraded with STARTTLS (usually port 143).
    StartTls,
}

impl FromStr for Security {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tls" | "ssl" | "implicit" => Ok(Self::Tls),
            "starttls" => Ok(Self::StartTls),
            other => Err(Error::Config(format!("Unknown security mode: {other}"))),
        }
    }
}

/// The remote IMAP account a sync session runs against.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// OAuth2 bearer token; takes precedence over the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub security: Security,
}

impl Account {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: None,
            access_token: None,
            security: Security::default(),
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    #[must_use]
    pub const fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Load the account from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `IMAP_HOST`
    /// - `IMAP_USERNAME`
    /// - `IMAP_PASSWORD` or `IMAP_ACCESS_TOKEN`
    ///
    /// Optional (with defaults):
    /// - `IMAP_SECURITY` (`tls` or `starttls`, default: `tls`)
    /// - `IMAP_PORT` (default: `993` for TLS, `143` for STARTTLS)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let security = match env::var("IMAP_SECURITY") {
            Ok(value) => value.parse()?,
            Err(_) => Security::default(),
        };
        let default_port = match security {
            Security::Tls => 993,
            Security::StartTls => 143,
        };

        let account = Self {
            host: env::var("IMAP_HOST").map_err(|_| Error::Config("IMAP_HOST not set".into()))?,
            port: env_parse("IMAP_PORT", default_port)?,
            username: env::var("IMAP_USERNAME")
                .map_err(|_| Error::Config("IMAP_USERNAME not set".into()))?,
            password: env::var("IMAP_PASSWORD").ok(),
            access_token: env::var("IMAP_ACCESS_TOKEN").ok(),
            security,
        };

        if account.password.is_none() && account.access_token.is_none() {
            return Err(Error::Config(
                "Neither IMAP_PASSWORD nor IMAP_ACCESS_TOKEN is set".into(),
            ));
        }
        Ok(account)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("security", &self.security)
            .finish()
    }
}

/// What to do when a sync process cannot connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connection failures tolerated per mailbox before it is abandoned
    /// for the rest of the run. Zero disables retries.
    pub max_retries: u32,
    /// Base delay before a failed mailbox is eligible again. Doubles
    /// with every further failure of the same mailbox.
    pub cooldown: Duration,
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive
    /// connection failures.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.cooldown.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Tuning knobs of the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Run several sync processes and tune their number. When disabled
    /// a single process syncs one mailbox at a time.
    pub parallel_processes_optimizer: bool,
    /// Tune each mailbox's fetch window size from observed throughput.
    pub block_size_optimizer: bool,
    /// Processes started per "increase" decision.
    pub parallel_processes_step: usize,
    /// Messages added to or removed from a window per decision.
    pub block_size_step: u32,
    /// Fetch only messages changed since the highest known MODSEQ when
    /// the server supports it.
    pub qresync: bool,
    /// Hand already imported attachment hashes to the collaborator.
    pub attachment_deduplication: bool,
    pub initial_block_size: u32,
    pub processes_optimizer_interval: Duration,
    pub block_size_optimizer_interval: Duration,
    /// Throughput drop (bytes/ms) still considered "flat".
    pub throughput_threshold: f64,
    /// Bytes kept in reserve below the account quota.
    pub quota_safety_threshold: u64,
    /// How long a session stays postponed after hitting the quota.
    pub postpone_duration: Duration,
    /// Retention of throughput and block size samples per mailbox.
    pub mailbox_history_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallel_processes_optimizer: true,
            block_size_optimizer: true,
            parallel_processes_step: 2,
            block_size_step: 100,
            qresync: true,
            attachment_deduplication: true,
            initial_block_size: 500,
            processes_optimizer_interval: Duration::from_secs(5),
            block_size_optimizer_interval: Duration::from_secs(10),
            throughput_threshold: 0.0,
            quota_safety_threshold: 50_000_000,
            postpone_duration: Duration::from_secs(24 * 60 * 60),
            mailbox_history_ttl: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Load the configuration from environment variables
    ///
    /// Reads from `.env` file if present. Every variable is optional and
    /// falls back to [`SyncConfig::default`]:
    /// - `ADSYNC_PARALLEL` / `ADSYNC_BLOCK_SIZE_OPTIMIZER` /
    ///   `ADSYNC_QRESYNC` / `ADSYNC_ATTACHMENT_DEDUP` (`true`/`false`)
    /// - `ADSYNC_PROCESS_STEP`, `ADSYNC_BLOCK_SIZE_STEP`,
    ///   `ADSYNC_INITIAL_BLOCK_SIZE`
    /// - `ADSYNC_QUOTA_SAFETY_THRESHOLD` (bytes)
    /// - `ADSYNC_MAX_RETRIES`, `ADSYNC_RETRY_COOLDOWN_SECS`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            parallel_processes_optimizer: env_parse(
                "ADSYNC_PARALLEL",
                defaults.parallel_processes_optimizer,
            )?,
            block_size_optimizer: env_parse(
                "ADSYNC_BLOCK_SIZE_OPTIMIZER",
                defaults.block_size_optimizer,
            )?,
            parallel_processes_step: env_parse(
                "ADSYNC_PROCESS_STEP",
                defaults.parallel_processes_step,
            )?,
            block_size_step: env_parse("ADSYNC_BLOCK_SIZE_STEP", defaults.block_size_step)?,
            qresync: env_parse("ADSYNC_QRESYNC", defaults.qresync)?,
            attachment_deduplication: env_parse(
                "ADSYNC_ATTACHMENT_DEDUP",
                defaults.attachment_deduplication,
            )?,
            initial_block_size: env_parse(
                "ADSYNC_INITIAL_BLOCK_SIZE",
                defaults.initial_block_size,
            )?,
            quota_safety_threshold: env_parse(
                "ADSYNC_QUOTA_SAFETY_THRESHOLD",
                defaults.quota_safety_threshold,
            )?,
            retry: RetryPolicy {
                max_retries: env_parse("ADSYNC_MAX_RETRIES", defaults.retry.max_retries)?,
                cooldown: Duration::from_secs(env_parse(
                    "ADSYNC_RETRY_COOLDOWN_SECS",
                    defaults.retry.cooldown.as_secs(),
                )?),
            },
            ..defaults
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
