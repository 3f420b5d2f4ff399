//! Configuration parsing and validation.
//!
//! Kibana Harness is configured via a TOML file (default: `config/kh.toml`).
//! The file is parsed once into an immutable [`Config`] snapshot. Runtime
//! changes never mutate a snapshot in place: [`Config::apply_overrides`]
//! returns a new, re-validated one.
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! host = "kibana.example.com"
//! base_path = "/_plugin/kibana"
//! default_index = "logs-app*"
//!
//! [cache]
//! schema_ttl_secs = 3600
//! search_ttl_secs = 300
//!
//! [pool]
//! max_connections = 20
//! max_idle = 10
//!
//! [retry]
//! max_retries = 2
//! initial_backoff_ms = 1000
//!
//! [query]
//! default_time_range = "1d"
//!
//! [analysis]
//! provider = "heuristic"
//! chunk_threshold = 100
//! ```
//!
//! # Sections
//!
//! | Section | Required | Purpose |
//! |---------|----------|---------|
//! | `[backend]` | yes | Kibana host, paths, credentials, timeouts |
//! | `[cache]` | no | TTL and size bound per TTL class |
//! | `[pool]` | no | Connection ceiling, idle bound, streams per connection |
//! | `[retry]` | no | Transient retry bound and backoff |
//! | `[query]` | no | Default window and result limits |
//! | `[analysis]` | no | Analysis provider and chunking |

use anyhow::{bail, Context, Result};
use kibana_harness_core::time_filter::parse_relative;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted when `backend.auth_token` is unset.
pub const AUTH_TOKEN_ENV: &str = "KIBANA_AUTH_TOKEN";

/// Top-level configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

// ============ Backend ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Host name, optionally with a port. No scheme.
    pub host: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_kibana_version")]
    pub kibana_version: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    #[serde(default)]
    pub default_index: Option<String>,
}

fn default_base_path() -> String {
    "/_plugin/kibana".to_string()
}
fn default_kibana_version() -> String {
    "7.10.2".to_string()
}
fn default_true() -> bool {
    true
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_timestamp_field() -> String {
    "@timestamp".to_string()
}

impl BackendConfig {
    /// Token from the config file, falling back to the environment.
    pub fn resolved_auth_token(&self) -> Option<String> {
        self.auth_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var(AUTH_TOKEN_ENV).ok())
            .filter(|t| !t.trim().is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ============ Cache ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_schema_ttl_secs")]
    pub schema_ttl_secs: u64,
    #[serde(default = "default_search_ttl_secs")]
    pub search_ttl_secs: u64,
    #[serde(default = "default_schema_max_entries")]
    pub schema_max_entries: usize,
    #[serde(default = "default_search_max_entries")]
    pub search_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_ttl_secs: default_schema_ttl_secs(),
            search_ttl_secs: default_search_ttl_secs(),
            schema_max_entries: default_schema_max_entries(),
            search_max_entries: default_search_max_entries(),
        }
    }
}

fn default_schema_ttl_secs() -> u64 {
    3600
}
fn default_search_ttl_secs() -> u64 {
    300
}
fn default_schema_max_entries() -> usize {
    100
}
fn default_search_max_entries() -> usize {
    1000
}

// ============ Pool ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Logical requests multiplexed over one connection.
    #[serde(default = "default_max_streams")]
    pub max_streams_per_connection: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_idle: default_max_idle(),
            max_streams_per_connection: default_max_streams(),
        }
    }
}

fn default_max_connections() -> usize {
    20
}
fn default_max_idle() -> usize {
    10
}
fn default_max_streams() -> usize {
    8
}

// ============ Retry ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Additional attempts after the first transient failure.
    #[serde(default = "default_retry_max")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retry_max(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_retry_max() -> u32 {
    2
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_factor() -> f64 {
    0.3
}

// ============ Query ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    #[serde(default = "default_time_range")]
    pub default_time_range: String,
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
    #[serde(default = "default_max_results_cap")]
    pub max_results_cap: usize,
    /// Overall deadline for one logical query, including retries.
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
    /// When non-zero, relative windows end at `now` rounded down to this
    /// many seconds so repeated requests within the bucket share a
    /// fingerprint. `0` (the default) ends them at `now` exactly.
    #[serde(default = "default_relative_alignment_secs")]
    pub relative_alignment_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_time_range: default_time_range(),
            default_max_results: default_max_results(),
            max_results_cap: default_max_results_cap(),
            timeout_secs: default_query_timeout_secs(),
            relative_alignment_secs: default_relative_alignment_secs(),
        }
    }
}

fn default_time_range() -> String {
    "1d".to_string()
}
fn default_max_results() -> usize {
    100
}
fn default_max_results_cap() -> usize {
    1000
}
fn default_query_timeout_secs() -> u64 {
    60
}
fn default_relative_alignment_secs() -> u64 {
    0
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ============ Analysis ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL of an OpenAI-compatible API.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: usize,
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_analysis_max_retries")]
    pub max_retries: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            chunk_threshold: default_chunk_threshold(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            timeout_secs: default_analysis_timeout_secs(),
            max_retries: default_analysis_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_chunk_threshold() -> usize {
    100
}
fn default_max_concurrent_chunks() -> usize {
    4
}
fn default_analysis_timeout_secs() -> u64 {
    120
}
fn default_analysis_max_retries() -> u32 {
    3
}

impl AnalysisConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

// ============ Loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Minimal configuration pointing at `host`, everything else defaulted.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig {
                host: host.into(),
                base_path: default_base_path(),
                kibana_version: default_kibana_version(),
                verify_ssl: true,
                request_timeout_secs: default_request_timeout_secs(),
                connect_timeout_secs: default_connect_timeout_secs(),
                auth_token: None,
                timestamp_field: default_timestamp_field(),
                default_index: None,
            },
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            query: QueryConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Validate backend
        if self.backend.host.trim().is_empty() {
            bail!("backend.host must not be empty");
        }
        if self.backend.host.contains("://") {
            bail!("backend.host must not include a scheme: '{}'", self.backend.host);
        }
        if !self.backend.base_path.is_empty() && !self.backend.base_path.starts_with('/') {
            bail!("backend.base_path must start with '/': '{}'", self.backend.base_path);
        }
        if self.backend.request_timeout_secs == 0 {
            bail!("backend.request_timeout_secs must be > 0");
        }

        // Validate cache
        if self.cache.schema_ttl_secs == 0 || self.cache.search_ttl_secs == 0 {
            bail!("cache TTLs must be > 0");
        }
        if self.cache.schema_max_entries == 0 || self.cache.search_max_entries == 0 {
            bail!("cache max entries must be > 0");
        }

        // Validate pool
        if self.pool.max_connections == 0 {
            bail!("pool.max_connections must be > 0");
        }
        if self.pool.max_streams_per_connection == 0 {
            bail!("pool.max_streams_per_connection must be > 0");
        }
        if self.pool.max_idle > self.pool.max_connections {
            bail!(
                "pool.max_idle ({}) must not exceed pool.max_connections ({})",
                self.pool.max_idle,
                self.pool.max_connections
            );
        }

        // Validate retry
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            bail!("retry.jitter_factor must be in [0.0, 1.0]");
        }
        if self.retry.backoff_multiplier < 1.0 {
            bail!("retry.backoff_multiplier must be >= 1.0");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            bail!("retry.max_backoff_ms must be >= retry.initial_backoff_ms");
        }

        // Validate query
        parse_relative(&self.query.default_time_range).with_context(|| {
            format!(
                "query.default_time_range is invalid: '{}'",
                self.query.default_time_range
            )
        })?;
        if self.query.default_max_results == 0 || self.query.max_results_cap == 0 {
            bail!("query result limits must be > 0");
        }
        if self.query.timeout_secs == 0 {
            bail!("query.timeout_secs must be > 0");
        }

        // Validate analysis
        if self.analysis.chunk_threshold == 0 {
            bail!("analysis.chunk_threshold must be > 0");
        }
        if self.analysis.max_concurrent_chunks == 0 {
            bail!("analysis.max_concurrent_chunks must be > 0");
        }
        match self.analysis.provider.as_str() {
            "disabled" | "heuristic" => {}
            "openai" => {
                if self.analysis.model.is_none() {
                    bail!("analysis.model must be specified when provider is 'openai'");
                }
            }
            other => bail!(
                "Unknown analysis provider: '{}'. Must be disabled, heuristic, or openai.",
                other
            ),
        }

        Ok(())
    }

    /// Produce a new snapshot with `overrides` applied.
    ///
    /// Keys are dotted paths (`cache.search_ttl_secs`). Values are parsed as
    /// TOML literals, falling back to a plain string. The result is
    /// validated; `self` is left untouched.
    pub fn apply_overrides(&self, overrides: &[(String, String)]) -> Result<Config> {
        let mut doc = toml::Value::try_from(self).context("Failed to serialize config")?;

        for (key, raw) in overrides {
            set_dotted(&mut doc, key, parse_override_value(raw))
                .with_context(|| format!("Invalid override '{}={}'", key, raw))?;
        }

        let next: Config = doc
            .try_into()
            .context("Override produced an invalid config")?;
        next.validate()?;
        Ok(next)
    }

    /// Copy safe to print: the auth token is masked.
    pub fn redacted(&self) -> Config {
        let mut copy = self.clone();
        if copy.backend.auth_token.is_some() {
            copy.backend.auth_token = Some("***".to_string());
        }
        copy
    }
}

/// Parse `key=value` as given on the command line.
pub fn parse_override(arg: &str) -> Result<(String, String)> {
    let (key, value) = arg
        .split_once('=')
        .with_context(|| format!("Expected key=value, got '{}'", arg))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("Override key must not be empty: '{}'", arg);
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn parse_override_value(raw: &str) -> toml::Value {
    format!("v = {}", raw)
        .parse::<toml::Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

fn set_dotted(doc: &mut toml::Value, key: &str, value: toml::Value) -> Result<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let leaf = parts.pop().filter(|p| !p.is_empty()).context("empty key")?;
    if parts.is_empty() {
        bail!("key must name a section and a field, e.g. cache.search_ttl_secs");
    }

    let mut node = doc;
    for part in parts {
        node = node
            .get_mut(part)
            .filter(|v| v.is_table())
            .with_context(|| format!("unknown section '{}'", part))?;
    }

    let table = node.as_table_mut().context("not a table")?;
    table.insert(leaf.to_string(), value);
    Ok(())
}
