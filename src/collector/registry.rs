//! Connector registry and factory
//!
//! Maps the `kind` tag of a platform configuration to the constructor
//! of its connector. The table is fixed at compile time.

use std::sync::Arc;

use super::PlatformConnector;
use super::rest::RestConnector;
use super::tcp::TcpConnector;
use crate::config::PlatformConfig;
use crate::errors::ConfigError;

/// Builds a connector from its platform configuration.
pub type ConnectorConstructor = fn(&PlatformConfig) -> Arc<dyn PlatformConnector>;

fn tcp(cfg: &PlatformConfig) -> Arc<dyn PlatformConnector> {
    TcpConnector::from_config(cfg)
}

fn rest(cfg: &PlatformConfig) -> Arc<dyn PlatformConnector> {
    RestConnector::from_config(cfg)
}

/// Every supported kind tag.
pub const KINDS: &[&str] = &["tcp", "rest"];

/// Returns the constructor registered for `kind`.
///
/// CONTRACT:
/// - `kind` MUST match the `platforms[].kind` field in config.json
/// - Tags are lowercase and stable
pub fn constructor(kind: &str) -> Option<ConnectorConstructor> {
    match kind {
        "tcp" => Some(tcp),
        "rest" => Some(rest),
        _ => None,
    }
}

pub fn build_connector(cfg: &PlatformConfig) -> Result<Arc<dyn PlatformConnector>, ConfigError> {
    let build = constructor(&cfg.kind).ok_or_else(|| ConfigError::UnknownConnectorKind {
        platform: cfg.name.clone(),
        kind: cfg.kind.clone(),
    })?;

    Ok(build(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(kind: &str) -> PlatformConfig {
        serde_json::from_value(serde_json::json!({
            "name": "PF1",
            "kind": kind,
            "enabled": true,
            "host": "127.0.0.1",
            "port": 8081,
            "base_urls": ["http://127.0.0.1:8080/api/rates"]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn resolves_every_registered_kind() {
        for kind in KINDS {
            let connector = build_connector(&platform(kind)).unwrap();
            assert_eq!(connector.platform_name(), "PF1");
        }
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        assert!(constructor("fix").is_none());
        assert!(matches!(
            build_connector(&platform("fix")),
            Err(ConfigError::UnknownConnectorKind { .. })
        ));
    }
}
