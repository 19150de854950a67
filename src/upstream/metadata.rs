//! Upstream provider metadata discovery.
//!
//! Resolves the identity provider's endpoints from its
//! `/.well-known/openid-configuration` document. Discovery failure is fatal
//! for the flow instance that needed it; nothing here retries.

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// OIDC provider metadata (the subset the broker uses).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer URL; must match the `iss` claim of issued ID tokens.
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// JWKS document URI for ID-token signature validation
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Token revocation endpoint (optional)
    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    /// Userinfo endpoint (optional)
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Deserialize scopes that may be either a string or array.
/// Some providers incorrectly return `"openid profile"` instead of `["openid", "profile"]`.
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

impl ProviderMetadata {
    /// Discover provider metadata from the issuer URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the document is unreachable or malformed.
    pub async fn discover(client: &Client, issuer_url: &str) -> Result<Self> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer_url.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering upstream provider metadata");

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("Failed to fetch provider metadata: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Discovery(format!(
                "Provider metadata discovery failed: HTTP {}",
                response.status()
            )));
        }

        let metadata: Self = response
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("Failed to parse provider metadata: {e}")))?;

        debug!(issuer = %metadata.issuer, "Discovered upstream provider");
        Ok(metadata)
    }

    /// Check if PKCE is supported (S256 method)
    #[must_use]
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .contains(&"S256".to_string())
    }

    /// The JWKS URI, defaulting to the OIDC discovery convention.
    #[must_use]
    pub fn jwks_uri(&self) -> String {
        self.jwks_uri.clone().unwrap_or_else(|| {
            format!("{}/.well-known/jwks.json", self.issuer.trim_end_matches('/'))
        })
    }
}
