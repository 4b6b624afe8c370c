//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — applied by `main` after loading
//! 2. **Environment variables** — `MERF_DOMAIN`, `MERF_HTTP_PORT`,
//!    `MERF_CONTROL_PORT`, `MERF_REMOTE`, `MERF_LOCAL`
//! 3. **Config file** — path via `--config <path>`, or `merf.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! listen_host = "0.0.0.0"
//! http_port = 8000
//! control_port = 1337
//! domain = "example.com"
//! template = "status.html"        # optional, built-in page when omitted
//! tunnel_timeout_secs = 60
//! greeting_timeout_secs = 10
//! max_name_attempts = 16
//!
//! [agent]
//! remote = "merf.ais-ucla.org:1337"
//! local = "http://localhost:8000"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tunnel::registry::RegistrySettings;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay (public server) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Interface both listeners bind to (default `0.0.0.0`).
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Public HTTP port (default 8000).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Port agents dial to open a tunnel (default 1337).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Base domain; tunnels are served at `<label>.<domain>`. Override with `MERF_DOMAIN`.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Optional status page template containing a `{{tunnels}}` placeholder.
    #[serde(default)]
    pub template: Option<String>,
    /// Deadline in seconds for one request/response exchange on a tunnel (default 60).
    #[serde(default = "default_tunnel_timeout")]
    pub tunnel_timeout_secs: u64,
    /// Deadline in seconds for sending the subdomain greeting (default 10).
    #[serde(default = "default_greeting_timeout")]
    pub greeting_timeout_secs: u64,
    /// Labels tried before a registration is refused (default 16).
    #[serde(default = "default_max_name_attempts")]
    pub max_name_attempts: usize,
}

/// Agent (tunnel client) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Relay control address, `host:port`. Override with `MERF_REMOTE`.
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Local server to expose, `http://host[:port]`. Override with `MERF_LOCAL`.
    #[serde(default = "default_local")]
    pub local: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8000
}
fn default_control_port() -> u16 {
    1337
}
fn default_domain() -> String {
    "example.com".to_string()
}
fn default_tunnel_timeout() -> u64 {
    60
}
fn default_greeting_timeout() -> u64 {
    10
}
fn default_max_name_attempts() -> usize {
    16
}
fn default_remote() -> String {
    "merf.ais-ucla.org:1337".to_string()
}
fn default_local() -> String {
    "http://localhost:8000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            http_port: default_http_port(),
            control_port: default_control_port(),
            domain: default_domain(),
            template: None,
            tunnel_timeout_secs: default_tunnel_timeout(),
            greeting_timeout_secs: default_greeting_timeout(),
            max_name_attempts: default_max_name_attempts(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            local: default_local(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RelayConfig {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.http_port)
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.control_port)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            max_name_attempts: self.max_name_attempts,
            tunnel_timeout: Duration::from_secs(self.tunnel_timeout_secs),
            greeting_timeout: Duration::from_secs(self.greeting_timeout_secs),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `merf.toml` in the
    /// current directory is used when present, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new("merf.toml").exists() => Self::from_file(Path::new("merf.toml"))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `MERF_*` overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(domain) = lookup("MERF_DOMAIN") {
            self.relay.domain = domain;
        }
        if let Some(port) = lookup("MERF_HTTP_PORT") {
            self.relay.http_port = parse_port("MERF_HTTP_PORT", &port)?;
        }
        if let Some(port) = lookup("MERF_CONTROL_PORT") {
            self.relay.control_port = parse_port("MERF_CONTROL_PORT", &port)?;
        }
        if let Some(remote) = lookup("MERF_REMOTE") {
            self.agent.remote = remote;
        }
        if let Some(local) = lookup("MERF_LOCAL") {
            self.agent.local = local;
        }
        Ok(())
    }

    /// Check relay settings that would otherwise fail at first use.
    pub fn validate_relay(&self) -> Result<(), ConfigError> {
        let relay = &self.relay;
        if relay.domain.trim().is_empty() {
            return Err(invalid("relay.domain", "must not be empty"));
        }
        if relay.tunnel_timeout_secs == 0 {
            return Err(invalid("relay.tunnel_timeout_secs", "must be at least 1"));
        }
        if relay.greeting_timeout_secs == 0 {
            return Err(invalid("relay.greeting_timeout_secs", "must be at least 1"));
        }
        if relay.max_name_attempts == 0 {
            return Err(invalid("relay.max_name_attempts", "must be at least 1"));
        }
        if relay.http_port == relay.control_port {
            return Err(invalid(
                "relay.control_port",
                "must differ from relay.http_port",
            ));
        }
        Ok(())
    }

    /// Read the status template, if one is configured.
    pub fn load_template(&self) -> Result<Option<String>, ConfigError> {
        let Some(path) = self.relay.template.as_deref() else {
            return Ok(None);
        };
        std::fs::read_to_string(path)
            .map(Some)
            .map_err(|source| ConfigError::Template {
                path: PathBuf::from(path),
                source,
            })
    }
}

fn parse_port(field: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(field, &format!("'{value}' is not a port number")))
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.relay.http_port, 8000);
        assert_eq!(config.relay.control_port, 1337);
        assert_eq!(config.relay.domain, "example.com");
        assert_eq!(config.agent.local, "http://localhost:8000");
        assert_eq!(config.logging.level, "info");
        assert!(config.validate_relay().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [relay]
            domain = "tunnels.dev"
            tunnel_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.relay.domain, "tunnels.dev");
        assert_eq!(config.relay.tunnel_timeout_secs, 5);
        assert_eq!(config.relay.http_port, 8000);
        assert_eq!(config.agent.remote, "merf.ais-ucla.org:1337");
        assert_eq!(
            config.relay.registry_settings().tunnel_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MERF_DOMAIN", "relay.test"),
            ("MERF_HTTP_PORT", "9000"),
            ("MERF_LOCAL", "http://127.0.0.1:3000"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env(|k| vars.get(k).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.relay.domain, "relay.test");
        assert_eq!(config.relay.http_port, 9000);
        assert_eq!(config.relay.control_port, 1337);
        assert_eq!(config.agent.local, "http://127.0.0.1:3000");
    }

    #[test]
    fn test_bad_env_port_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(|k| (k == "MERF_CONTROL_PORT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MERF_CONTROL_PORT"));
    }

    #[test]
    fn test_validate_relay() {
        let mut config = Config::default();
        config.relay.tunnel_timeout_secs = 0;
        assert!(config.validate_relay().is_err());

        let mut config = Config::default();
        config.relay.control_port = config.relay.http_port;
        assert!(config.validate_relay().is_err());
    }

    #[test]
    fn test_missing_template_is_error() {
        let mut config = Config::default();
        assert!(config.load_template().unwrap().is_none());
        config.relay.template = Some("/nonexistent/merf-status.html".to_string());
        assert!(matches!(
            config.load_template(),
            Err(ConfigError::Template { .. })
        ));
    }
}
