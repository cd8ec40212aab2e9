//! Typed configuration.
//!
//! [`Config`] holds process settings from environment variables and fails
//! fast if required vars are missing. The database URL is wrapped in
//! `secrecy::SecretString` to keep it out of logs.
//!
//! [`DispatcherConfig`] fixes the dispatcher's shape for its whole lifetime:
//! queue, worker count, poll and visibility timings, and handler scope.

pub mod secrets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Optional TOML file with a `[dispatcher]` table.
    pub dispatcher_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dispatcher_config: std::env::var("DISPATCHQ_CONFIG").ok().map(PathBuf::from),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Dispatcher settings. Immutable once the dispatcher is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    pub queue_name: String,
    /// Number of persistent workers. At least 1.
    pub concurrency_level: usize,
    /// Long-poll bound for each receive.
    pub poll_wait_seconds: u32,
    /// Visibility timeout for receives, and the fallback for an unparsable override.
    pub default_visibility_timeout_seconds: u32,
    /// Dotted namespace a message type must fall under to be dispatched.
    pub handler_scope: Option<String>,
    /// Receive batch size. Defaults to `concurrency_level`.
    pub max_messages: Option<u32>,
    /// Longest the poller waits for a worker to report ready before polling anyway.
    pub ready_wait_ms: u64,
    /// How long shutdown waits for workers to drain.
    pub drain_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_name: "dispatch".to_string(),
            concurrency_level: 2,
            poll_wait_seconds: 20,
            default_visibility_timeout_seconds: 20,
            handler_scope: None,
            max_messages: None,
            ready_wait_ms: 20_000,
            drain_grace_ms: 10_000,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    dispatcher: DispatcherConfig,
}

impl DispatcherConfig {
    pub fn new(queue_name: impl Into<String>, concurrency_level: usize) -> Self {
        Self {
            queue_name: queue_name.into(),
            concurrency_level,
            ..Default::default()
        }
    }

    /// Parse the `[dispatcher]` table of a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad dispatcher config: {e}")))?;
        Ok(file.dispatcher)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read dispatcher config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `DISPATCHQ_*` environment overrides.
    pub fn apply_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(queue) = lookup("DISPATCHQ_QUEUE") {
            self.queue_name = queue;
        }
        if let Some(value) = lookup("DISPATCHQ_CONCURRENCY") {
            self.concurrency_level = parse_var("DISPATCHQ_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("DISPATCHQ_POLL_WAIT_SECONDS") {
            self.poll_wait_seconds = parse_var("DISPATCHQ_POLL_WAIT_SECONDS", &value)?;
        }
        if let Some(value) = lookup("DISPATCHQ_VISIBILITY_TIMEOUT_SECONDS") {
            self.default_visibility_timeout_seconds =
                parse_var("DISPATCHQ_VISIBILITY_TIMEOUT_SECONDS", &value)?;
        }
        if let Some(scope) = lookup("DISPATCHQ_HANDLER_SCOPE") {
            self.handler_scope = Some(scope).filter(|s| !s.is_empty());
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(Error::Config("queue_name must not be empty".to_string()));
        }
        if self.concurrency_level == 0 {
            return Err(Error::Config("concurrency_level must be at least 1".to_string()));
        }
        if self.max_messages == Some(0) {
            return Err(Error::Config("max_messages must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn receive_batch_size(&self) -> u32 {
        self.max_messages
            .unwrap_or_else(|| u32::try_from(self.concurrency_level).unwrap_or(u32::MAX))
    }

    pub fn ready_wait(&self) -> Duration {
        Duration::from_millis(self.ready_wait_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} has invalid value {value:?}")))
}
