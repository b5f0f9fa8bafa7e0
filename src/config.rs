use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::ConfigError;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level configuration loaded once from `config.json`
// (or the path passed as the first CLI argument).
//
// It defines:
// - Outbound publisher settings
// - Cache backend selection
// - Tolerance filter threshold
// - Upstream platforms and their connection parameters
// - Derived instruments and their dependency rules
//
// The structure is validated once and treated as immutable.
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub tolerance: ToleranceConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    pub platforms: Vec<PlatformConfig>,

    /// Instruments subscribed on every registered platform
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Derived instrument rules.
    ///
    /// When absent, the built-in USDTRY / EURTRY / GBPTRY table is used.
    pub derived: Option<Vec<DerivedConfig>>,

    pub debug: Option<DebugConfig>,
}

// ------------------------------------------------------------
// Publisher configuration
// ------------------------------------------------------------
//
// Notes:
// - The `key` is security-sensitive and must never be committed.
// - `connections` controls parallel WebSocket connections.
// - `demo` disables sending (accepted rates are only logged).
//
#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    /// WebSocket URL of the distribution endpoint
    pub url: String,

    /// Number of parallel connections
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Sent during login as: key=XYZ&role=coordinator
    pub key: String,

    pub demo: Option<bool>,
}

// ------------------------------------------------------------
// Cache configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Local,
    Redis,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Required when `backend` is `redis`
    pub redis_url: Option<String>,
}

// ------------------------------------------------------------
// Tolerance filter
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct ToleranceConfig {
    /// Maximum accepted relative change between consecutive quotes
    /// (0.01 = 1%)
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self { threshold: default_threshold() }
    }
}

// ------------------------------------------------------------
// Coordinator runtime
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct CoordinatorConfig {
    /// Hard limit for connector shutdown before forced termination
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Enables periodic recalculation of every derived instrument
    pub recalculate_interval_ms: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            recalculate_interval_ms: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn recalculate_interval(&self) -> Option<Duration> {
        self.recalculate_interval_ms.map(Duration::from_millis)
    }
}

// ------------------------------------------------------------
// Platform configuration
// ------------------------------------------------------------
//
// One upstream feed. `kind` selects the connector implementation
// from the compile-time registry (see `collector::registry`).
//
// IMPORTANT:
// - `tcp` platforms require `host` + `port`
// - `rest` platforms require at least one entry in `base_urls`,
//   listed in priority order
//
#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    /// Platform identifier (e.g. "PF1", "PF2")
    pub name: String,

    /// Connector kind tag ("tcp" | "rest")
    pub kind: String,

    pub enabled: bool,

    pub host: Option<String>,
    pub port: Option<u16>,

    #[serde(default)]
    pub base_urls: Vec<String>,

    pub user: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// Instruments subscribed on this platform only
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

impl PlatformConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

// ------------------------------------------------------------
// Derived instruments
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DerivedConfig {
    /// Derived instrument name (e.g. "USDTRY")
    pub name: String,

    /// Instruments that must be cached before calculation
    pub depends_on: Vec<String>,

    /// Optional formula; built-in native formulas are used otherwise
    pub formula: Option<FormulaConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FormulaConfig {
    /// "native" | "expr"
    pub language: String,
    pub source: String,
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DebugConfig {
    /// Logs every outbound frame and login at info level
    pub log: Option<bool>,
}

impl Config {
    pub fn debug_log(&self) -> bool {
        self.debug.as_ref().is_some_and(|d| d.log.unwrap_or(false))
    }

    /// Dependency rules, either configured or the built-in table.
    pub fn dependency_rules(&self) -> BTreeMap<String, BTreeSet<String>> {
        match &self.derived {
            Some(derived) => derived
                .iter()
                .map(|d| (d.name.clone(), d.depends_on.iter().cloned().collect()))
                .collect(),
            None => crate::coordinator::dependency::builtin_rules(),
        }
    }

    /// Semantic validation. Any error here is fatal at startup.
    ///
    /// Dependency cycles are detected when the graph is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();

        for p in &self.platforms {
            if p.name.trim().is_empty() {
                return Err(ConfigError::Invalid("platform with empty name".into()));
            }

            if !names.insert(p.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate platform name {}",
                    p.name
                )));
            }

            match p.kind.as_str() {
                "tcp" => {
                    if p.host.is_none() || p.port.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "tcp platform {} requires host and port",
                            p.name
                        )));
                    }
                }
                "rest" => {
                    if p.base_urls.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "rest platform {} requires at least one base url",
                            p.name
                        )));
                    }
                }
                other => {
                    return Err(ConfigError::UnknownConnectorKind {
                        platform: p.name.clone(),
                        kind: other.to_string(),
                    });
                }
            }

            let timings = [
                ("retry_interval_ms", p.retry_interval_ms),
                ("connect_timeout_ms", p.connect_timeout_ms),
                ("poll_interval_ms", p.poll_interval_ms),
                ("request_timeout_ms", p.request_timeout_ms),
                ("health_check_interval_ms", p.health_check_interval_ms),
                ("health_timeout_ms", p.health_timeout_ms),
            ];
            if let Some((field, _)) = timings.iter().find(|(_, ms)| *ms == 0) {
                return Err(ConfigError::Invalid(format!(
                    "platform {}: {} must be greater than zero",
                    p.name, field
                )));
            }
        }

        if self.coordinator.recalculate_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "coordinator recalculate_interval_ms must be greater than zero".into(),
            ));
        }

        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "redis cache backend requires redis_url".into(),
            ));
        }

        let threshold = self.tolerance.threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "tolerance threshold must be positive, got {}",
                threshold
            )));
        }

        if self.publisher.connections == 0 && !self.publisher.demo.unwrap_or(false) {
            return Err(ConfigError::Invalid(
                "publisher requires at least one connection".into(),
            ));
        }

        if let Some(derived) = &self.derived {
            for d in derived {
                if d.depends_on.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "derived instrument {} has no dependencies",
                        d.name
                    )));
                }

                if d.formula.is_none() && !crate::calculator::builtin::is_builtin(&d.name) {
                    return Err(ConfigError::Invalid(format!(
                        "derived instrument {} has no formula",
                        d.name
                    )));
                }
            }
        }

        Ok(())
    }
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads a JSON configuration file from disk, deserializes it
// into `Config` and runs semantic validation.
//
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;

    parse_config(&data)
}

pub fn parse_config(data: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_json::from_str(data)?;
    cfg.validate()?;
    Ok(cfg)
}

fn default_connections() -> usize {
    1
}

fn default_threshold() -> f64 {
    0.01
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_retry_count() -> u32 {
    5
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "publisher": { "url": "ws://127.0.0.1:9000", "key": "secret" },
        "platforms": [
            { "name": "PF1", "kind": "tcp", "enabled": true, "host": "127.0.0.1", "port": 8081 },
            { "name": "PF2", "kind": "rest", "enabled": true, "base_urls": ["http://127.0.0.1:8082/api/rates"] }
        ],
        "subscriptions": ["PF1_USDTRY"]
    }"#;

    fn with_platforms(platforms: &str) -> String {
        format!(
            r#"{{ "publisher": {{ "url": "ws://x", "key": "k" }}, "platforms": {} }}"#,
            platforms
        )
    }

    #[test]
    fn applies_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();

        assert_eq!(cfg.publisher.connections, 1);
        assert_eq!(cfg.cache.backend, CacheBackend::Local);
        assert_eq!(cfg.tolerance.threshold, 0.01);
        assert_eq!(cfg.coordinator.shutdown_timeout(), Duration::from_secs(10));
        assert!(cfg.coordinator.recalculate_interval().is_none());

        let pf1 = &cfg.platforms[0];
        assert_eq!(pf1.retry_count, 5);
        assert_eq!(pf1.retry_interval(), Duration::from_secs(5));
        assert_eq!(pf1.health_check_interval(), Duration::from_secs(30));
        assert_eq!(pf1.health_timeout(), Duration::from_secs(60));
        assert!(!cfg.debug_log());
    }

    #[test]
    fn falls_back_to_builtin_rules() {
        let cfg = parse_config(MINIMAL).unwrap();
        let rules = cfg.dependency_rules();

        assert!(rules["USDTRY"].contains("PF1_USDTRY"));
        assert!(rules["USDTRY"].contains("PF2_USDTRY"));
        assert_eq!(rules["EURTRY"].len(), 4);
    }

    #[test]
    fn rejects_duplicate_platforms() {
        let raw = with_platforms(
            r#"[
                { "name": "PF1", "kind": "tcp", "enabled": true, "host": "h", "port": 1 },
                { "name": "PF1", "kind": "tcp", "enabled": true, "host": "h", "port": 2 }
            ]"#,
        );

        assert!(matches!(parse_config(&raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_kind() {
        let raw = with_platforms(r#"[{ "name": "PF1", "kind": "fix", "enabled": true }]"#);

        assert!(matches!(
            parse_config(&raw),
            Err(ConfigError::UnknownConnectorKind { .. })
        ));
    }

    #[test]
    fn rejects_incomplete_transports() {
        let tcp = with_platforms(r#"[{ "name": "PF1", "kind": "tcp", "enabled": true, "host": "h" }]"#);
        let rest = with_platforms(r#"[{ "name": "PF2", "kind": "rest", "enabled": true }]"#);

        assert!(parse_config(&tcp).is_err());
        assert!(parse_config(&rest).is_err());
    }

    #[test]
    fn rejects_redis_without_url_and_bad_threshold() {
        let redis = r#"{
            "publisher": { "url": "ws://x", "key": "k" },
            "cache": { "backend": "redis" },
            "platforms": []
        }"#;
        let threshold = r#"{
            "publisher": { "url": "ws://x", "key": "k" },
            "tolerance": { "threshold": 0 },
            "platforms": []
        }"#;

        assert!(parse_config(redis).is_err());
        assert!(parse_config(threshold).is_err());
    }

    #[test]
    fn rejects_zero_intervals() {
        for field in [
            "retry_interval_ms",
            "connect_timeout_ms",
            "poll_interval_ms",
            "request_timeout_ms",
            "health_check_interval_ms",
            "health_timeout_ms",
        ] {
            let raw = with_platforms(&format!(
                r#"[{{ "name": "PF2", "kind": "rest", "enabled": true, "base_urls": ["http://h"], "{}": 0 }}]"#,
                field
            ));

            match parse_config(&raw) {
                Err(ConfigError::Invalid(message)) => assert!(message.contains(field), "{}", message),
                other => panic!("{} = 0 accepted: {:?}", field, other.map(|_| ())),
            }
        }

        let recalculate = r#"{
            "publisher": { "url": "ws://x", "key": "k" },
            "coordinator": { "recalculate_interval_ms": 0 },
            "platforms": []
        }"#;
        assert!(matches!(parse_config(recalculate), Err(ConfigError::Invalid(_))));

        let positive = recalculate.replace(": 0 }", ": 250 }");
        let cfg = parse_config(&positive).unwrap();
        assert_eq!(cfg.coordinator.recalculate_interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn derived_rules_need_dependencies_and_formula() {
        let empty_deps = r#"{
            "publisher": { "url": "ws://x", "key": "k" },
            "platforms": [],
            "derived": [ { "name": "USDTRY", "depends_on": [] } ]
        }"#;
        let no_formula = r#"{
            "publisher": { "url": "ws://x", "key": "k" },
            "platforms": [],
            "derived": [ { "name": "CHFTRY", "depends_on": ["PF1_USDCHF"] } ]
        }"#;
        let expr = r#"{
            "publisher": { "url": "ws://x", "key": "k" },
            "platforms": [],
            "derived": [ {
                "name": "CHFTRY",
                "depends_on": ["PF1_USDCHF", "USDTRY"],
                "formula": { "language": "expr", "source": "bid = USDTRY.bid / PF1_USDCHF.ask; ask = USDTRY.ask / PF1_USDCHF.bid" }
            } ]
        }"#;

        assert!(parse_config(empty_deps).is_err());
        assert!(parse_config(no_formula).is_err());

        let cfg = parse_config(expr).unwrap();
        assert_eq!(cfg.dependency_rules()["CHFTRY"].len(), 2);
    }

    #[test]
    fn example_config_is_valid() {
        let cfg = parse_config(include_str!("../config.example.json")).unwrap();

        assert_eq!(cfg.platforms.len(), 2);
        assert_eq!(cfg.platforms[1].base_urls.len(), 2);
        assert_eq!(cfg.platforms[1].poll_interval(), Duration::from_secs(1));
        assert!(cfg.publisher.demo.unwrap_or(false));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            load_config("/definitely/not/here.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
