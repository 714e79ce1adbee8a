//! Read-only state shared by every connection task.

use std::time::Duration;

use anyhow::Result;
use url::Url;

use crate::auth::ntlm::local_hostname;
use crate::config::{AuthScheme, Config, CredentialStore, ForwardProxyConfig};

/// Snapshot of the configuration in the form the connection engine needs
/// it, built once at startup and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    /// Uppercased first label of the local host name
    pub hostname: String,

    pub auth_required: bool,
    pub auth_scheme: AuthScheme,
    pub credentials: CredentialStore,

    pub forward_proxy: Option<Url>,
    pub bypass: ForwardProxyConfig,

    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub response_delay: Option<Duration>,
}

impl ProxyContext {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            hostname: local_hostname(),
            auth_required: cfg.auth.required,
            auth_scheme: cfg.auth.scheme,
            credentials: CredentialStore::new(cfg.auth.credentials.clone()),
            forward_proxy: cfg.forward_proxy.parsed_url()?,
            bypass: cfg.forward_proxy.clone(),
            connect_timeout: cfg.timeouts.connect(),
            read_timeout: cfg.timeouts.read(),
            response_delay: cfg.response_delay(),
        })
    }

    /// Forward proxy to use for `host`, if any.
    pub fn forward_proxy_for(&self, host: &str) -> Option<&Url> {
        self.forward_proxy
            .as_ref()
            .filter(|_| !self.bypass.is_bypassed(host))
    }
}
