//! Gateway configuration loading.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::{Error as FigmentError, Figment};
use serde::Deserialize;
use thiserror::Error;

use meshgate_core::ServiceUrl;

use crate::location::LocationRule;
use crate::server;

/// Errors that can occur when loading or parsing gateway configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(Box<FigmentError>),

    #[error("configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Proxy behaviour knobs.
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Location rewrite rules per upstream domain.
    #[serde(default)]
    pub locations: HashMap<String, Vec<LocationRule>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address and port to bind the proxy listener to.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_address(),
        }
    }
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9983)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    /// Per-request timeout for forwarded requests, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Strip `Connection` headers and keep upstream connections alive.
    #[serde(default = "default_keepalive")]
    pub keepalive: bool,

    /// Domain tried when the request host has no registered cluster.
    #[serde(default)]
    pub default_domain: String,

    /// Resolver configuration file; when set, upstream hosts resolve
    /// through it instead of the system resolver.
    #[serde(default)]
    pub resolve_conf: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            keepalive: default_keepalive(),
            default_domain: String::new(),
            resolve_conf: None,
        }
    }
}

const fn default_timeout_ms() -> u64 {
    5000
}

const fn default_keepalive() -> bool {
    true
}

impl GatewayConfig {
    /// Loads configuration from the default path (`meshgate.toml`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("meshgate.toml")
    }

    /// Loads configuration from the given file. Environment variables
    /// prefixed with `MESHGATE_` override file settings.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MESHGATE_").split("__").lowercase(false));
        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::string(content))
            .extract::<Self>()
            .map_err(ConfigError::from)
    }

    /// The proxy server URL carrying these settings as URL parameters.
    #[must_use]
    pub fn proxy_url(&self) -> ServiceUrl {
        let mut url = ServiceUrl::new(
            "http",
            &self.server.listen.ip().to_string(),
            self.server.listen.port(),
        );
        url.put_param(server::PROXY_TIMEOUT_KEY, &self.proxy.timeout_ms.to_string());
        url.put_param(server::KEEPALIVE_KEY, &self.proxy.keepalive.to_string());
        if !self.proxy.default_domain.is_empty() {
            url.put_param(server::DEFAULT_DOMAIN_KEY, &self.proxy.default_domain);
        }
        if let Some(resolve_conf) = &self.proxy.resolve_conf {
            url.put_param(server::RESOLVE_CONF_KEY, resolve_conf);
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = GatewayConfig::parse(
            r#"
            [server]
            listen = "127.0.0.1:9090"

            [proxy]
            timeout_ms = 2500
            keepalive = false
            default_domain = "fallback.test"

            [locations]
            "api.test" = [
                { pattern = "= /health", rewrite = "/internal/health" },
                { pattern = "/", rewrite = "/api" },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen.port(), 9090);
        assert_eq!(config.proxy.timeout_ms, 2500);
        assert!(!config.proxy.keepalive);
        assert_eq!(config.locations["api.test"].len(), 2);

        let url = config.proxy_url();
        assert_eq!(url.port, 9090);
        assert_eq!(url.get_param(server::PROXY_TIMEOUT_KEY, ""), "2500");
        assert_eq!(
            url.get_param(server::DEFAULT_DOMAIN_KEY, ""),
            "fallback.test"
        );
    }

    #[test]
    fn defaults_apply() {
        let config = GatewayConfig::parse("").unwrap();
        assert_eq!(config.server.listen.port(), 9983);
        assert_eq!(config.proxy.timeout_ms, 5000);
        assert!(config.proxy.keepalive);
        assert!(config.locations.is_empty());
    }
}
