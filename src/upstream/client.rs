//! Upstream OIDC client — authorization URL construction, code exchange,
//! and refresh grants against the identity provider.
//!
//! All outbound calls share one `reqwest::Client` with a bounded timeout; a
//! timeout is a fatal error for that flow instance, never retried, since the
//! authorization code and nonce are single-use.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::id_token::{IdTokenVerifier, IdentityClaims};
use super::metadata::ProviderMetadata;
use super::UpstreamAuthority;
use crate::config::UpstreamConfig;
use crate::txn::PendingAuthorization;
use crate::{Error, Result};

/// Token set returned by the upstream token endpoint.
///
/// Owned by the broker only transiently: it is handed to the downstream
/// grant's property bag once the ID-token claims have been validated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamTokenSet {
    /// Opaque upstream access token.
    pub access_token: String,
    /// ID token (JWT); absent only on refresh responses from providers that
    /// do not re-issue one.
    #[serde(default)]
    pub id_token: Option<String>,
    /// Refresh token; rotation is provider-optional.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
}

/// Raw upstream token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Fallback lifetime when the provider omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

impl From<TokenResponse> for UpstreamTokenSet {
    fn from(r: TokenResponse) -> Self {
        Self {
            access_token: r.access_token,
            id_token: r.id_token,
            refresh_token: r.refresh_token,
            expires_in: r.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
        }
    }
}

/// Build the upstream authorization URL for an approved transaction.
///
/// The transaction id is sent as the upstream `state` parameter: it is the
/// correlation key the callback step uses to reload the pending bundle.
pub fn build_authorization_url(
    cfg: &UpstreamConfig,
    metadata: &ProviderMetadata,
    pending: &PendingAuthorization,
    txn_id: &str,
    redirect_uri: &str,
) -> Result<Url> {
    let mut url = Url::parse(&metadata.authorization_endpoint)
        .map_err(|e| Error::Discovery(format!("Invalid authorization endpoint: {e}")))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("response_type", "code");
        params.append_pair("client_id", &cfg.client_id);
        params.append_pair("redirect_uri", redirect_uri);
        params.append_pair("scope", &cfg.scopes.join(" "));
        params.append_pair("state", txn_id);
        params.append_pair("nonce", &pending.nonce);
        params.append_pair("code_challenge", &pending.code_challenge);
        params.append_pair("code_challenge_method", "S256");

        if let Some(ref audience) = cfg.audience {
            params.append_pair("audience", audience);
        }
    }

    Ok(url)
}

/// OIDC client for the configured upstream provider.
pub struct OidcClient {
    http: reqwest::Client,
    config: UpstreamConfig,
    /// Resolved client secret (after `env:` indirection).
    client_secret: String,
    /// The broker's own callback URL, registered with the provider.
    redirect_uri: String,
    verifier: IdTokenVerifier,
    metadata: tokio::sync::RwLock<Option<ProviderMetadata>>,
}

impl OidcClient {
    /// Create a client for the configured provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(config: UpstreamConfig, redirect_uri: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        let client_secret = config.resolve_client_secret();

        Ok(Self {
            verifier: IdTokenVerifier::new(http.clone()),
            http,
            client_secret,
            redirect_uri,
            config,
            metadata: tokio::sync::RwLock::new(None),
        })
    }

    async fn post_token_request(
        &self,
        metadata: &ProviderMetadata,
        params: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        self.http
            .post(&metadata.token_endpoint)
            .form(params)
            .send()
            .await
            .map_err(Error::Http)
    }
}

#[async_trait::async_trait]
impl UpstreamAuthority for OidcClient {
    /// Resolve provider metadata, caching it after the first success.
    async fn discover(&self) -> Result<ProviderMetadata> {
        if let Some(ref meta) = *self.metadata.read().await {
            return Ok(meta.clone());
        }

        let meta = ProviderMetadata::discover(&self.http, &self.config.issuer_url).await?;
        *self.metadata.write().await = Some(meta.clone());
        Ok(meta)
    }

    /// Exchange an authorization code for an upstream token set.
    async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        code: &str,
        verifier: &str,
    ) -> Result<UpstreamTokenSet> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code_verifier", verifier),
        ];

        let response = self
            .post_token_request(metadata, &params)
            .await
            .map_err(|e| Error::TokenExchange(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TokenExchange(format!("HTTP {status} - {body}")));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::TokenExchange(format!("Malformed token response: {e}")))?;

        debug!("Exchanged authorization code for upstream tokens");
        Ok(token_response.into())
    }

    /// Validate the ID token in a token set against the transaction nonce.
    async fn validate_id_token(
        &self,
        metadata: &ProviderMetadata,
        tokens: &UpstreamTokenSet,
        expected_nonce: Option<&str>,
    ) -> Result<IdentityClaims> {
        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| Error::InvalidIdToken("Response carried no ID token".to_string()))?;

        self.verifier
            .verify(
                id_token,
                &metadata.jwks_uri(),
                &metadata.issuer,
                &self.config.client_id,
                expected_nonce,
            )
            .await
    }

    /// Perform the refresh-token grant.
    async fn refresh(
        &self,
        metadata: &ProviderMetadata,
        refresh_token: &str,
    ) -> Result<UpstreamTokenSet> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .post_token_request(metadata, &params)
            .await
            .map_err(|e| Error::Refresh(format!("Refresh request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Refresh(format!("HTTP {status} - {body}")));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Refresh(format!("Malformed refresh response: {e}")))?;

        info!("Refreshed upstream tokens");
        Ok(token_response.into())
    }
}
