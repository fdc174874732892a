//! Server configuration: a JSON document read once at startup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::net::dial::DialConfig;
use crate::net::registry::ConnRegistry;

/// Default location of deployment data (config, sponsor DB, GeoIP DB,
/// traffic rules) inside the container image.
pub const DEFAULT_CONFIG_DIR: &str = "/opt/veiltun/config";
/// Default log output directory.
pub const DEFAULT_LOG_DIR: &str = "/var/log/veiltun";

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Log file path; absent logs to stderr.
    #[serde(default)]
    pub log_filename: Option<String>,
    #[serde(default)]
    pub log_verbose: bool,

    #[serde(default)]
    pub geoip_database_filename: Option<String>,
    #[serde(default)]
    pub sponsor_database_filename: Option<String>,
    #[serde(default)]
    pub traffic_rules_filename: Option<String>,

    /// Period of the tunnel-load telemetry record; 0 disables the monitor.
    #[serde(default)]
    pub load_monitor_period_seconds: u64,

    #[serde(default)]
    pub web_server: Option<WebServerConfig>,

    #[serde(default)]
    pub tunnel_listeners: Vec<TunnelListenerConfig>,

    #[serde(default)]
    pub dial: DialSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebServerConfig {
    pub listen_address: String,
    pub tls_certificate_filename: String,
    pub tls_private_key_filename: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunnelListenerConfig {
    /// Opaque tunnel protocol label, e.g. "plain" or "obfuscated".
    pub protocol: String,
    pub listen_address: String,
    /// Where tunneled application traffic is proxied.
    pub upstream_address: String,
    /// Evict the least-recently-active client once this many are active.
    #[serde(default)]
    pub max_clients: Option<u64>,
}

/// Upstream dialing options shared by all tunnel listeners.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DialSettings {
    #[serde(default)]
    pub upstream_proxy_url: Option<String>,
    #[serde(default)]
    pub upstream_proxy_custom_headers: HashMap<String, String>,
    #[serde(default)]
    pub connect_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub device_region: Option<String>,
}

impl DialSettings {
    /// Materialize a dial config bound to the given pending-dial registry.
    pub fn to_dial_config(&self, pending_conns: Option<Arc<ConnRegistry>>) -> DialConfig {
        DialConfig {
            upstream_proxy_url: self.upstream_proxy_url.clone(),
            upstream_proxy_custom_headers: self
                .upstream_proxy_custom_headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            connect_timeout: self.connect_timeout_seconds.map(Duration::from_secs),
            pending_conns,
            device_region: self.device_region.clone(),
            ..DialConfig::default()
        }
    }
}

impl ServerConfig {
    pub fn load(config_json: &[u8]) -> Result<Self> {
        let config: ServerConfig = serde_json::from_slice(config_json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tunnel_listeners.is_empty() {
            return Err(AppError::Config(
                "at least one tunnel listener is required".into(),
            ));
        }
        let mut protocols = HashSet::new();
        for listener in &self.tunnel_listeners {
            if listener.protocol.is_empty() {
                return Err(AppError::Config(
                    "tunnel listener protocol must not be empty".into(),
                ));
            }
            if !protocols.insert(listener.protocol.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate tunnel protocol {:?}",
                    listener.protocol
                )));
            }
        }
        if let Some(web) = &self.web_server {
            if web.tls_certificate_filename.is_empty() || web.tls_private_key_filename.is_empty() {
                return Err(AppError::Config(
                    "web server requires TLS certificate and key filenames".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn run_web_server(&self) -> bool {
        self.web_server.is_some()
    }

    pub fn run_load_monitor(&self) -> bool {
        self.load_monitor_period_seconds > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let json = br#"{
            "tunnel_listeners": [
                { "protocol": "plain",
                  "listen_address": "0.0.0.0:3001",
                  "upstream_address": "127.0.0.1:8080" }
            ]
        }"#;
        let config = ServerConfig::load(json).unwrap();
        assert!(!config.run_web_server());
        assert!(!config.run_load_monitor());
        assert_eq!(config.tunnel_listeners.len(), 1);
    }

    #[test]
    fn test_listeners_required() {
        let err = ServerConfig::load(b"{}").unwrap_err();
        assert!(err.to_string().contains("tunnel listener"));
    }

    #[test]
    fn test_duplicate_protocols_rejected() {
        let json = br#"{
            "tunnel_listeners": [
                { "protocol": "plain", "listen_address": "0.0.0.0:3001", "upstream_address": "a:1" },
                { "protocol": "plain", "listen_address": "0.0.0.0:3002", "upstream_address": "a:1" }
            ]
        }"#;
        let err = ServerConfig::load(json).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_web_server_requires_tls_files() {
        let json = br#"{
            "tunnel_listeners": [
                { "protocol": "plain", "listen_address": "0.0.0.0:3001", "upstream_address": "a:1" }
            ],
            "web_server": {
                "listen_address": "0.0.0.0:3000",
                "tls_certificate_filename": "",
                "tls_private_key_filename": ""
            }
        }"#;
        let err = ServerConfig::load(json).unwrap_err();
        assert!(err.to_string().contains("TLS certificate"));
    }

    #[test]
    fn test_dial_settings_materialize() {
        let settings = DialSettings {
            upstream_proxy_url: Some("http://proxy:8080".into()),
            connect_timeout_seconds: Some(20),
            ..DialSettings::default()
        };
        let dial = settings.to_dial_config(None);
        assert_eq!(dial.upstream_proxy_url.as_deref(), Some("http://proxy:8080"));
        assert_eq!(dial.connect_timeout, Some(Duration::from_secs(20)));
    }
}
