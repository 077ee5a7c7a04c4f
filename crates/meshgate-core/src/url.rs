//! URL-like option carrier for endpoints, providers and servers.

use std::collections::HashMap;
use std::time::Duration;

/// Address plus a free-form parameter table.
///
/// Every component reads its options through `get_param` and the typed
/// helpers; unknown keys fall back to the given default.
#[derive(Debug, Clone, Default)]
pub struct ServiceUrl {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub params: HashMap<String, String>,
}

impl ServiceUrl {
    #[must_use]
    pub fn new(protocol: &str, host: &str, port: u16) -> Self {
        Self {
            protocol: protocol.to_owned(),
            host: host.to_owned(),
            port,
            path: String::new(),
            params: HashMap::new(),
        }
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn get_param(&self, key: &str, default: &str) -> String {
        match self.params.get(key) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => default.to_owned(),
        }
    }

    pub fn put_param(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_owned(), value.to_owned());
    }

    pub fn remove_param(&mut self, key: &str) {
        self.params.remove(key);
    }

    /// Parses the parameter as a millisecond count.
    #[must_use]
    pub fn get_duration_ms(&self, key: &str, default: Duration) -> Duration {
        self.params
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    /// Parses the parameter as a positive integer; zero and garbage fall
    /// back to the default.
    #[must_use]
    pub fn get_positive_int(&self, key: &str, default: u64) -> u64 {
        self.params
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(default)
    }

    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.params
            .get(key)
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Stable identity string used in log events.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_defaults() {
        let mut url = ServiceUrl::new("http", "localhost", 9090);
        assert_eq!(url.get_param("missing", "fallback"), "fallback");

        url.put_param("timeout", "250");
        assert_eq!(
            url.get_duration_ms("timeout", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
        assert_eq!(
            url.get_duration_ms("other", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn positive_int_rejects_zero() {
        let mut url = ServiceUrl::new("http", "localhost", 9090);
        url.put_param("maxConnections", "0");
        assert_eq!(url.get_positive_int("maxConnections", 50), 50);
        url.put_param("maxConnections", "10");
        assert_eq!(url.get_positive_int("maxConnections", 50), 10);
    }

    #[test]
    fn identity_includes_address() {
        let url = ServiceUrl::new("http", "example.com", 80);
        assert_eq!(url.identity(), "http://example.com:80");
        assert_eq!(url.host_port(), "example.com:80");
    }
}
