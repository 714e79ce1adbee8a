//! Proxy configuration
//!
//! Configuration is read from a YAML file named by `POXY_CONFIG`. Every
//! field has a default, so an empty file (or no file at all) yields a
//! working open proxy on `0.0.0.0:8000`.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// Environment variable naming the YAML configuration file
pub const CONFIG_ENV: &str = "POXY_CONFIG";

/// Environment variable overriding the listen address
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub timeouts: TimeoutConfig,
    pub auth: AuthConfig,
    pub forward_proxy: ForwardProxyConfig,

    /// Sleep applied after a backend status line is read, before anything
    /// is written to the client
    pub response_delay_ms: u64,

    /// One of trace, debug, info, warn, error
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener to (e.g., "0.0.0.0:8000")
    pub listen_addr: String,

    /// Maximum number of client connections served at once
    pub max_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            max_workers: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on establishing a backend connection
    pub connect_secs: u64,

    /// Idle read bound on client and backend sockets; 0 disables it
    pub read_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            read_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn read(&self) -> Option<Duration> {
        (self.read_secs > 0).then(|| Duration::from_secs(self.read_secs))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    #[default]
    Basic,
    Ntlm,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub required: bool,
    pub scheme: AuthScheme,

    /// User name to password
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForwardProxyConfig {
    /// Upstream proxy requests are chained through (e.g., "http://proxy:3128")
    pub url: Option<String>,

    /// Hosts or domain suffixes reached directly
    pub bypass: Vec<String>,

    /// Appended to dot-less host names before bypass matching
    pub default_domain: Option<String>,
}

impl ForwardProxyConfig {
    /// Parses `url` into a host and port, defaulting the port to 80.
    pub fn parsed_url(&self) -> Result<Option<Url>> {
        let Some(raw) = &self.url else {
            return Ok(None);
        };

        let url = Url::parse(raw).with_context(|| format!("Invalid forward proxy URL '{}'", raw))?;

        if url.scheme() != "http" {
            bail!("Forward proxy URL '{}' must use http", raw);
        }

        if url.host_str().is_none() {
            bail!("Forward proxy URL '{}' has no host", raw);
        }

        Ok(Some(url))
    }

    /// True when `host` should be reached without the forward proxy.
    pub fn is_bypassed(&self, host: &str) -> bool {
        let mut host = host.to_ascii_lowercase();

        if !host.contains('.') {
            if let Some(domain) = &self.default_domain {
                host.push('.');
                host.push_str(&domain.to_ascii_lowercase());
            }
        }

        self.bypass.iter().any(|entry| {
            let entry = entry.to_ascii_lowercase();
            host == entry || host.ends_with(&entry)
        })
    }
}

/// Maximum log level, parsed from its lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(pub tracing::Level);

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel(tracing::Level::INFO)
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        tracing::Level::from_str(&value)
            .map(LogLevel)
            .map_err(|_| format!("unknown log level '{}'", value))
    }
}

impl Config {
    /// Loads the file named by `POXY_CONFIG` (or defaults) and applies the
    /// `LISTEN` override.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            cfg.server.listen_addr = listen;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_yaml_str(&text)
            .with_context(|| format!("Failed to load config file {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        // An empty document deserializes as null
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let cfg: Config = serde_yaml::from_str(text).context("Failed to parse YAML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_workers == 0 {
            bail!("server.max_workers must be at least 1");
        }

        self.forward_proxy.parsed_url()?;

        if self.auth.required && self.auth.credentials.is_empty() {
            tracing::warn!("Authentication required but no credentials configured");
        }

        Ok(())
    }

    pub fn response_delay(&self) -> Option<Duration> {
        (self.response_delay_ms > 0).then(|| Duration::from_millis(self.response_delay_ms))
    }
}

/// Credential table shared by every connection.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl CredentialStore {
    pub fn new(credentials: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(credentials)),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, user: impl Into<String>, password: impl Into<String>) {
        self.table().insert(user.into(), password.into());
    }

    pub fn password_for(&self, user: &str) -> Option<String> {
        self.table().get(user).cloned()
    }

    pub fn matches(&self, user: &str, password: &str) -> bool {
        self.password_for(user).is_some_and(|p| p == password)
    }

    /// Case-insensitive lookup returning the stored user name and password.
    /// NTLM clients are free to change the case of the user name.
    pub fn find_ignore_case(&self, user: &str) -> Option<(String, String)> {
        let table = self.table();

        if let Some(password) = table.get(user) {
            return Some((user.to_string(), password.clone()));
        }

        table
            .iter()
            .find(|(name, _)| name.to_uppercase() == user.to_uppercase())
            .map(|(name, password)| (name.clone(), password.clone()))
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_appends_default_domain() {
        let fp = ForwardProxyConfig {
            url: Some("http://upstream:3128".into()),
            bypass: vec!["Example.COM".into(), "intranet.corp".into()],
            default_domain: Some("corp".into()),
        };

        assert!(fp.is_bypassed("example.com"));
        assert!(fp.is_bypassed("www.example.com"));
        assert!(fp.is_bypassed("INTRANET"));
        assert!(!fp.is_bypassed("example.org"));
        assert!(!fp.is_bypassed("wiki"));
    }

    #[test]
    fn bypass_without_default_domain_keeps_bare_host() {
        let fp = ForwardProxyConfig {
            bypass: vec!["localhost".into()],
            ..Default::default()
        };

        assert!(fp.is_bypassed("localhost"));
        assert!(!fp.is_bypassed("otherhost"));
    }

    #[test]
    fn credential_lookup() {
        let store = CredentialStore::default();
        store.insert("alice", "secret");

        assert!(store.matches("alice", "secret"));
        assert!(!store.matches("alice", "Secret"));
        assert!(!store.matches("bob", "secret"));
        assert_eq!(
            store.find_ignore_case("ALICE"),
            Some(("alice".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn forward_proxy_url_must_be_http() {
        let fp = ForwardProxyConfig {
            url: Some("https://upstream:3128".into()),
            ..Default::default()
        };
        assert!(fp.parsed_url().is_err());

        let fp = ForwardProxyConfig {
            url: Some("http://upstream:3128".into()),
            ..Default::default()
        };
        let url = fp.parsed_url().unwrap().unwrap();
        assert_eq!(url.host_str(), Some("upstream"));
        assert_eq!(url.port_or_known_default(), Some(3128));
    }
}
