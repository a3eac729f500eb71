use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowlineError, Result};

/// Top-level Flowline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// What happens to the run when one node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop scheduling, emit an error and finish the run.
    #[default]
    AbortExecution,
    /// Record the node as failed, keep running the other branches.
    IsolateBranch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard deadline for a whole run. 0 disables it.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// Per-node deadline. 0 disables it.
    #[serde(default)]
    pub node_timeout_secs: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Upper bound on activations of one node under `reset_on_revisit`.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: default_execution_timeout(),
            node_timeout_secs: 0,
            failure_policy: FailurePolicy::default(),
            max_node_visits: default_max_node_visits(),
        }
    }
}

fn default_execution_timeout() -> u64 { 600 }
fn default_max_node_visits() -> u32 { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Event log lifetime, counted from creation.
    #[serde(default = "default_event_ttl")]
    pub event_ttl_secs: u64,
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
    /// Live events buffered per subscriber before it is dropped as lagging.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            event_ttl_secs: default_event_ttl(),
            janitor_interval_secs: default_janitor_interval(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

fn default_ping_interval() -> u64 { 15 }
fn default_event_ttl() -> u64 { 3600 }
fn default_janitor_interval() -> u64 { 60 }
fn default_subscriber_buffer() -> usize { 1024 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLogBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    #[serde(default)]
    pub backend: EventLogBackend,
    /// Database file for the sqlite backend.
    #[serde(default = "default_event_log_path")]
    pub path: String,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            backend: EventLogBackend::default(),
            path: default_event_log_path(),
        }
    }
}

impl EventLogConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_event_log_path() -> String { "~/.flowline/events.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Base URL advertised in stream links. Defaults to `http://<bind>`.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Directory of `<graph_id>.json` specs for submissions by id.
    #[serde(default)]
    pub spec_dir: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
            spec_dir: None,
        }
    }
}

impl GatewayConfig {
    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.bind),
        }
    }

    pub fn resolved_spec_dir(&self) -> Option<PathBuf> {
        self.spec_dir.as_deref().map(expand_home)
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

/// Where agent nodes are delegated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
    /// Retries for transient failures (HTTP 429/5xx, timeouts, connection errors).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_model_timeout() -> u64 { 120 }
fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 8000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive. `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String { "flowline=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowlineError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse TOML text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| FlowlineError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables are kept verbatim.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(val) => result.push_str(&val),
                    Err(_) => result.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
