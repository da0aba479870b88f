//! Declarative engine configuration.
//!
//! The engine is configured by a single YAML document with sections
//! `server`, `cache`, `sources`, `performance`, and `content_types`.
//! Unknown keys at the top level or inside a known section are startup
//! errors; unknown keys inside a source entry are collected verbatim and
//! handed to the adapter factory, which owns their validation.
//!
//! Credentials are never written inline. A [`SecretRef`] names the
//! environment variable holding the value; resolution happens at adapter
//! construction time and the resolved value never appears in logs or
//! serialized output.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::document::ContentType;
use crate::error::{EngineError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Wire-layer settings (host/port are consumed by the wire crates, not
    /// the engine; they ride along so one file configures the whole server).
    #[serde(default)]
    pub server: ServerConfig,

    /// Cache layer settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Documentation sources, one entry per adapter instance.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Concurrency, deadline, and matcher tuning.
    #[serde(default)]
    pub performance: PerformanceConfig,

    /// Per-content-type cache policy overrides.
    #[serde(default)]
    pub content_types: HashMap<ContentType, ContentTypePolicy>,
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from a YAML string and validate it.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_yml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(EngineError::Configuration(
                    "source entry with empty name".to_string(),
                ));
            }
            if !seen.insert(&source.name) {
                return Err(EngineError::Configuration(format!(
                    "duplicate source name: {}",
                    source.name
                )));
            }
        }
        if self.performance.per_call_concurrency == 0 {
            return Err(EngineError::Configuration(
                "performance.per_call_concurrency must be at least 1".to_string(),
            ));
        }
        if self.performance.global_concurrency < self.performance.per_call_concurrency {
            return Err(EngineError::Configuration(
                "performance.global_concurrency must be >= per_call_concurrency".to_string(),
            ));
        }
        Ok(())
    }

    /// TTL for a content type, falling back to the built-in defaults.
    pub fn ttl_for(&self, content_type: ContentType) -> Duration {
        self.content_types
            .get(&content_type)
            .map(|p| Duration::from_secs(p.ttl_seconds))
            .unwrap_or_else(|| default_ttl(content_type))
    }

    /// Content types flagged for startup warmup, with their alert types.
    pub fn warmup_targets(&self) -> Vec<(ContentType, Vec<String>)> {
        self.content_types
            .iter()
            .filter(|(_, p)| p.warmup)
            .map(|(ct, p)| (*ct, p.warmup_alert_types.clone()))
            .collect()
    }
}

/// Built-in default TTLs per content type.
fn default_ttl(content_type: ContentType) -> Duration {
    let secs = match content_type {
        ContentType::Runbook => 3600,
        ContentType::DecisionTree => 2400,
        ContentType::Procedure => 1800,
        ContentType::KnowledgeBase => 900,
        ContentType::ListSources => 300,
        ContentType::Health => 10,
    };
    Duration::from_secs(secs)
}

/// Wire-layer settings, opaque to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8711
}

/// Cache strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Memory tier plus the remote tier when configured and reachable.
    #[default]
    Hybrid,
    /// Memory tier only, even if a remote tier is configured.
    MemoryOnly,
}

/// Cache layer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub strategy: CacheStrategy,
    #[serde(default)]
    pub memory: MemoryCacheConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteCacheConfig>,
}

/// Memory tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryCacheConfig {
    /// Maximum entries before approximate-LRU eviction.
    #[serde(default = "default_memory_entries")]
    pub max_entries: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_memory_entries(),
        }
    }
}

fn default_memory_entries() -> usize {
    5000
}

/// Remote tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteCacheConfig {
    /// Connection URL (e.g. "redis://localhost:6379").
    pub url: String,
    /// Key prefix for all entries.
    #[serde(default = "default_remote_prefix")]
    pub prefix: String,
    /// Breaker protecting the remote tier.
    #[serde(default)]
    pub breaker: BreakerSettings,
}

fn default_remote_prefix() -> String {
    "rundex:cache:".to_string()
}

/// Circuit breaker tuning, shared by adapters and the remote cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettings {
    /// Failures within the rolling window before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Rolling window over which failures are counted.
    #[serde(default = "default_breaker_window_seconds")]
    pub window_seconds: u64,
    /// How long the breaker stays open before probing.
    #[serde(default = "default_open_seconds")]
    pub open_seconds: u64,
    /// Concurrent probes allowed while half-open.
    #[serde(default = "default_half_open_probes")]
    pub half_open_max_probes: u32,
    /// Per-call timeout counted as a failure.
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_seconds: default_breaker_window_seconds(),
            open_seconds: default_open_seconds(),
            half_open_max_probes: default_half_open_probes(),
            call_timeout_seconds: default_call_timeout_seconds(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_window_seconds() -> u64 {
    30
}

fn default_open_seconds() -> u64 {
    30
}

fn default_half_open_probes() -> u32 {
    1
}

fn default_call_timeout_seconds() -> u64 {
    10
}

/// Deletion confirmation policy for documents that disappear from an
/// adapter's inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Delete after the document is absent for two consecutive passes.
    #[default]
    TwoPass,
    /// Delete after the document has been absent for `deletion_grace_seconds`.
    TimeBased,
}

/// One documentation source. `extra` carries adapter-specific keys opaquely;
/// the adapter factory validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique name across the process.
    pub name: String,
    /// Registered adapter type (e.g. "filesystem", "confluence").
    #[serde(rename = "type")]
    pub adapter_type: String,
    /// Lower value = preferred in ranking tiebreaks.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Seconds between index refresh passes.
    #[serde(default = "default_refresh_seconds")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Credential reference, resolved by the adapter factory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SecretRef>,
    /// Breaker tuning for this adapter.
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Deletion confirmation policy.
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    /// Grace window for [`DeletionPolicy::TimeBased`].
    #[serde(default = "default_deletion_grace_seconds")]
    pub deletion_grace_seconds: u64,
    /// Adapter-specific fields, passed through unvalidated.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_priority() -> u32 {
    100
}

fn default_refresh_seconds() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

fn default_deletion_grace_seconds() -> u64 {
    600
}

/// Indirect credential reference (`env:VAR_NAME`).
///
/// `Debug` and `Display` never show a resolved value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    /// Reference a value held in the named environment variable.
    pub fn from_env(var: impl Into<String>) -> Self {
        Self(format!("env:{}", var.into()))
    }

    /// Resolve the referenced secret.
    ///
    /// # Errors
    ///
    /// `Configuration` if the reference is malformed or the variable is
    /// unset.
    pub fn resolve(&self) -> Result<String> {
        match self.0.strip_prefix("env:") {
            Some(var) => std::env::var(var).map_err(|_| {
                EngineError::Configuration(format!(
                    "credential variable {var} is not set"
                ))
            }),
            None => Err(EngineError::Configuration(format!(
                "credential reference must use the env: form, got {}",
                self.0
            ))),
        }
    }
}

impl std::fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretRef(<redacted>)")
    }
}

/// Concurrency, deadline, and matcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceConfig {
    /// Adapter fan-out bound per tool call.
    #[serde(default = "default_per_call_concurrency")]
    pub per_call_concurrency: usize,
    /// Adapter fan-out bound across all in-flight tool calls.
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    /// Default per-call deadline.
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    /// Startup warmup deadline.
    #[serde(default = "default_warmup_seconds")]
    pub warmup_deadline_seconds: u64,
    /// Health check interval.
    #[serde(default = "default_health_interval_seconds")]
    pub health_interval_seconds: u64,
    /// Rolling health window.
    #[serde(default = "default_health_window_seconds")]
    pub health_window_seconds: u64,
    /// Matcher confidence floor.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Matcher result cap.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Retry attempts for transient adapter failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    /// Known aliases for affected systems, used in context enhancement.
    #[serde(default)]
    pub system_aliases: HashMap<String, Vec<String>>,
    /// Known aliases for alert types.
    #[serde(default)]
    pub alert_aliases: HashMap<String, Vec<String>>,
    /// Keyword markers for runbook detection (title/metadata signal).
    #[serde(default = "default_runbook_markers")]
    pub runbook_markers: Vec<String>,
    /// Weigh document quality scores into ranking.
    #[serde(default)]
    pub quality_bias: bool,
    /// Directory for indexer checkpoints; unset disables persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<String>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            per_call_concurrency: default_per_call_concurrency(),
            global_concurrency: default_global_concurrency(),
            default_timeout_seconds: default_timeout_seconds(),
            warmup_deadline_seconds: default_warmup_seconds(),
            health_interval_seconds: default_health_interval_seconds(),
            health_window_seconds: default_health_window_seconds(),
            min_confidence: default_min_confidence(),
            max_results: default_max_results(),
            retry_max_attempts: default_retry_attempts(),
            system_aliases: HashMap::new(),
            alert_aliases: HashMap::new(),
            runbook_markers: default_runbook_markers(),
            quality_bias: false,
            checkpoint_dir: None,
        }
    }
}

fn default_per_call_concurrency() -> usize {
    10
}

fn default_global_concurrency() -> usize {
    50
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_warmup_seconds() -> u64 {
    30
}

fn default_health_interval_seconds() -> u64 {
    30
}

fn default_health_window_seconds() -> u64 {
    300
}

fn default_min_confidence() -> f64 {
    0.3
}

fn default_max_results() -> usize {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_runbook_markers() -> Vec<String> {
    vec![
        "runbook".to_string(),
        "incident".to_string(),
        "postmortem playbook".to_string(),
    ]
}

/// Per-content-type cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentTypePolicy {
    /// Cache TTL in seconds.
    pub ttl_seconds: u64,
    /// Proactively populate the cache at startup.
    #[serde(default)]
    pub warmup: bool,
    /// Alert types to issue synthetic warmup queries for.
    #[serde(default)]
    pub warmup_alert_types: Vec<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  host: 0.0.0.0
  port: 9000
cache:
  strategy: hybrid
  memory:
    max_entries: 2000
  remote:
    url: redis://localhost:6379
sources:
  - name: ops-wiki
    type: confluence
    priority: 10
    refresh_interval_seconds: 600
    auth: env:CONFLUENCE_TOKEN
    space_key: OPS
  - name: local-docs
    type: filesystem
    path: /var/runbooks
performance:
  min_confidence: 0.25
content_types:
  runbook:
    ttl_seconds: 1800
    warmup: true
    warmup_alert_types: [disk_space_critical]
"#;

    #[test]
    fn test_parse_sample() {
        let config = EngineConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].adapter_type, "confluence");
        // Adapter-specific keys ride through opaquely.
        assert_eq!(
            config.sources[0].extra.get("space_key"),
            Some(&serde_json::json!("OPS"))
        );
        assert_eq!(config.cache.memory.max_entries, 2000);
        assert!((config.performance.min_confidence - 0.25).abs() < f64::EPSILON);
        assert_eq!(
            config.ttl_for(ContentType::Runbook),
            Duration::from_secs(1800)
        );
        // Unconfigured types keep their defaults.
        assert_eq!(
            config.ttl_for(ContentType::Health),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let raw = "serverz:\n  port: 1\n";
        assert!(EngineConfig::from_yaml(raw).is_err());
    }

    #[test]
    fn test_duplicate_source_names_rejected() {
        let raw = r#"
sources:
  - name: a
    type: filesystem
  - name: a
    type: filesystem
"#;
        let err = EngineConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate source name"));
    }

    #[test]
    fn test_warmup_targets() {
        let config = EngineConfig::from_yaml(SAMPLE).unwrap();
        let targets = config.warmup_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, ContentType::Runbook);
        assert_eq!(targets[0].1, vec!["disk_space_critical".to_string()]);
    }

    #[test]
    fn test_secret_ref_resolution() {
        std::env::set_var("RUNDEX_TEST_TOKEN", "s3cret");
        let secret = SecretRef::from_env("RUNDEX_TEST_TOKEN");
        assert_eq!(secret.resolve().unwrap(), "s3cret");
        // Debug output never contains the value.
        assert!(!format!("{secret:?}").contains("s3cret"));

        let missing = SecretRef::from_env("RUNDEX_TEST_TOKEN_MISSING");
        assert!(missing.resolve().is_err());
    }

    #[test]
    fn test_default_config_validates() {
        EngineConfig::default().validate().unwrap();
    }
}
