//! Configuration management

use std::{env, path::Path};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `env:VAR` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Upstream identity provider configuration
    pub upstream: UpstreamConfig,
    /// Registered downstream clients
    pub clients: Vec<ClientConfig>,
    /// Transaction store configuration
    pub transactions: TransactionsConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (MCP_OAUTH_BROKER_ prefix)
        figment = figment.merge(Env::prefixed("MCP_OAUTH_BROKER_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env: resolution)
        config.load_env_files();

        config.validate()?;
        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Ok(home) = env::var("HOME") {
                    path_str.replacen('~', &home, 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.upstream.issuer_url.is_empty() {
            return Err(Error::Config(
                "upstream.issuer_url must be set".to_string(),
            ));
        }
        if self.upstream.client_id.is_empty() {
            return Err(Error::Config("upstream.client_id must be set".to_string()));
        }
        for client in &self.clients {
            if client.redirect_uris.is_empty() {
                return Err(Error::Config(format!(
                    "Client {} has no redirect_uris",
                    client.client_id
                )));
            }
        }
        Ok(())
    }

    /// Look up a registered downstream client by id.
    #[must_use]
    pub fn client(&self, client_id: &str) -> Option<&ClientConfig> {
        self.clients.iter().find(|c| c.client_id == client_id)
    }

    /// The broker's own upstream callback URL, registered with the provider.
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!(
            "{}/callback",
            self.server.public_url.trim_end_matches('/')
        )
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL of the broker itself
    pub public_url: String,
    /// Development mode: relaxes the session cookie's Secure/SameSite
    /// attributes for plain-HTTP localhost testing
    pub development: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8974,
            public_url: "http://127.0.0.1:8974".to_string(),
            development: true,
        }
    }
}

/// Upstream identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// OIDC issuer URL (discovery base)
    pub issuer_url: String,
    /// Client id the broker is registered under at the provider
    pub client_id: String,
    /// Client secret. Supports: literal value or `env:VAR_NAME`
    pub client_secret: String,
    /// Optional `audience` parameter for providers that require it
    #[serde(default)]
    pub audience: Option<String>,
    /// Scopes requested upstream (independent of downstream scopes)
    pub scopes: Vec<String>,
    /// Timeout for outbound provider requests
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            audience: None,
            scopes: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
                "offline_access".to_string(),
            ],
            request_timeout_secs: 10,
        }
    }
}

impl UpstreamConfig {
    /// Resolve the client secret (expand `env:VAR_NAME` references)
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        if let Some(var_name) = self.client_secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| {
                tracing::warn!("Environment variable {var_name} not set for client secret");
                String::new()
            })
        } else {
            self.client_secret.clone()
        }
    }
}

/// A registered downstream client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Downstream client identifier
    pub client_id: String,
    /// Display name shown on the consent page
    pub name: String,
    /// Optional logo shown on the consent page
    #[serde(default)]
    pub logo_uri: Option<String>,
    /// Optional homepage linked from the consent page
    #[serde(default)]
    pub client_uri: Option<String>,
    /// Exact-match redirect URI allowlist
    pub redirect_uris: Vec<String>,
}

impl ClientConfig {
    /// Exact string match against the registered redirect allowlist.
    #[must_use]
    pub fn allows_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == uri)
    }
}

/// Transaction store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionsConfig {
    /// Absolute lifetime of a pending transaction (seconds)
    pub ttl_secs: u64,
    /// Lifetime of an unredeemed downstream authorization code (seconds)
    pub grant_ttl_secs: u64,
    /// Background reaper interval (seconds)
    pub reap_interval_secs: u64,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            grant_ttl_secs: 600,
            reap_interval_secs: 60,
        }
    }
}
