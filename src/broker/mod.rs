//! Flow orchestration — the authorize → consent → callback sequence.
//!
//! [`Broker`] owns the transaction store, the upstream authority, and the
//! downstream grant store, and exposes one method per flow step. The HTTP
//! layer in [`handlers`] is a thin adapter over these methods; tests drive
//! them directly with a fake authority.

pub mod handlers;
pub mod server;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use url::Url;

use crate::config::{ClientConfig, Config};
use crate::consent;
use crate::grant::{GrantStore, IssuedGrant};
use crate::pkce;
use crate::token_exchange::TokenExchangeCallback;
use crate::txn::{DownstreamRequest, PendingAuthorization, TransactionStore};
use crate::upstream::{OidcClient, UpstreamAuthority, build_authorization_url};
use crate::{Error, Result};

/// The data needed to render the consent page for a new transaction.
#[derive(Debug, Clone)]
pub struct ConsentPrompt {
    /// Transaction id; also the session cookie value.
    pub txn_id: String,
    /// Consent token embedded in the approval form.
    pub consent_token: String,
    /// The downstream client being authorized.
    pub client: ClientConfig,
    /// Scopes the user is asked to approve.
    pub scope: Vec<String>,
}

/// Result of the consent step.
#[derive(Debug, Clone)]
pub enum ConsentOutcome {
    /// User approved: redirect the browser to the upstream provider.
    RedirectUpstream(Url),
    /// User denied: redirect back to the downstream client with
    /// `error=access_denied`.
    Denied(Url),
}

/// The OAuth broker: orchestrates one authorization flow per transaction.
pub struct Broker {
    config: Arc<Config>,
    txns: Arc<dyn TransactionStore>,
    authority: Arc<dyn UpstreamAuthority>,
    grants: Arc<GrantStore>,
}

impl Broker {
    /// Create a broker wired to the real upstream provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the upstream HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let callback_url = config.callback_url();
        let authority = Arc::new(OidcClient::new(config.upstream.clone(), callback_url)?);
        Ok(Self::with_authority(
            config,
            Arc::new(crate::txn::InMemoryTransactionStore::new()),
            authority,
        ))
    }

    /// Create a broker with an injected store and authority.
    #[must_use]
    pub fn with_authority(
        config: Config,
        txns: Arc<dyn TransactionStore>,
        authority: Arc<dyn UpstreamAuthority>,
    ) -> Self {
        let grants = Arc::new(GrantStore::new(config.transactions.grant_ttl_secs));
        Self {
            config: Arc::new(config),
            txns,
            authority,
            grants,
        }
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Transaction store handle, for the background reaper.
    #[must_use]
    pub fn transactions(&self) -> Arc<dyn TransactionStore> {
        Arc::clone(&self.txns)
    }

    /// Downstream grant store, for the downstream token endpoint.
    #[must_use]
    pub fn grants(&self) -> Arc<GrantStore> {
        Arc::clone(&self.grants)
    }

    /// Token exchange callback bound to this broker's upstream authority.
    #[must_use]
    pub fn exchange_callback(&self) -> TokenExchangeCallback {
        TokenExchangeCallback::new(Arc::clone(&self.authority))
    }

    /// Step 1: validate a downstream authorization request and open a
    /// transaction for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownClient`] for an unregistered client id and
    /// [`Error::InvalidRequest`] for a redirect URI outside the client's
    /// registered allowlist.
    pub async fn begin_authorization(&self, request: DownstreamRequest) -> Result<ConsentPrompt> {
        let client = self
            .config
            .client(&request.client_id)
            .ok_or_else(|| Error::UnknownClient(request.client_id.clone()))?
            .clone();

        // Exact-match allowlist: no redirect is ever derived from the request
        if !client.allows_redirect(&request.redirect_uri) {
            warn!(
                client = %request.client_id,
                redirect_uri = %request.redirect_uri,
                "Rejected unregistered redirect URI"
            );
            return Err(Error::InvalidRequest(
                "redirect_uri is not registered for this client".to_string(),
            ));
        }

        let txn_id = pkce::transaction_id();
        let consent_token = pkce::consent_token();
        let code_verifier = pkce::code_verifier();
        let now = now_secs();

        let pending = PendingAuthorization {
            code_challenge: pkce::code_challenge(&code_verifier),
            code_verifier,
            nonce: pkce::nonce(),
            consent_token: consent_token.clone(),
            created_at: now,
            expires_at: now + self.config.transactions.ttl_secs,
            request,
        };
        let scope = pending.request.scope.clone();

        self.txns.create(&txn_id, pending).await;
        info!(client = %client.client_id, "Opened authorization transaction");

        Ok(ConsentPrompt {
            txn_id,
            consent_token,
            client,
            scope,
        })
    }

    /// Step 2: apply the user's consent decision.
    ///
    /// The transaction is consumed up front; it is restored only on the
    /// approval path, as part of handing the browser to the provider. Any
    /// failure in between leaves no live transaction behind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] for an unknown, expired, or already
    /// consumed transaction, [`Error::ConsentForgery`] for a consent-token
    /// mismatch, and [`Error::InvalidRequest`] for an unrecognized action.
    pub async fn submit_consent(
        &self,
        txn_id: &str,
        consent_token: &str,
        action: &str,
    ) -> Result<ConsentOutcome> {
        let pending = self
            .txns
            .take(txn_id)
            .await
            .ok_or_else(|| Error::Transaction("unknown, expired, or already consumed".to_string()))?;

        if !consent::consent_token_matches(consent_token, &pending.consent_token) {
            warn!(client = %pending.request.client_id, "Consent token mismatch");
            return Err(Error::ConsentForgery);
        }

        match action {
            "approve" => {
                let metadata = self.authority.discover().await?;
                if !metadata.supports_pkce() {
                    // The challenge is sent regardless; compliant providers
                    // ignore parameters they do not support
                    warn!(issuer = %metadata.issuer, "Provider does not advertise S256 support");
                }
                let url = build_authorization_url(
                    &self.config.upstream,
                    &metadata,
                    &pending,
                    txn_id,
                    &self.config.callback_url(),
                )?;

                // Restored only now: the callback correlates on the same id
                info!(client = %pending.request.client_id, "Consent approved, redirecting upstream");
                self.txns.restore(txn_id, pending).await;
                Ok(ConsentOutcome::RedirectUpstream(url))
            }
            "deny" => {
                info!(client = %pending.request.client_id, "Consent denied");
                let url = downstream_redirect(
                    &pending.request.redirect_uri,
                    &[
                        ("error", "access_denied"),
                        ("error_description", "The user denied the request"),
                    ],
                    pending.request.state.as_deref(),
                )?;
                Ok(ConsentOutcome::Denied(url))
            }
            other => {
                // Fail closed; the transaction stays consumed
                warn!(action = %other, "Unrecognized consent action");
                Err(Error::InvalidRequest(
                    "Unrecognized consent action".to_string(),
                ))
            }
        }
    }

    /// Step 3: handle the provider's redirect back to the broker.
    ///
    /// Consumes the transaction, exchanges the code, validates the ID token
    /// against the transaction nonce, mints a downstream authorization code,
    /// and returns the redirect back to the downstream client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] for an unknown or replayed `state`,
    /// [`Error::InvalidRequest`] if the provider sent neither code nor error,
    /// and the upstream error variants for exchange or validation failures.
    /// All error paths leave the transaction consumed.
    pub async fn complete_callback(
        &self,
        state: &str,
        code: Option<&str>,
        upstream_error: Option<&str>,
    ) -> Result<Url> {
        let pending = self
            .txns
            .take(state)
            .await
            .ok_or_else(|| Error::Transaction("unknown, expired, or already consumed".to_string()))?;
        let request = &pending.request;

        // Provider-reported failure: propagate to the downstream client
        if let Some(error_code) = upstream_error {
            warn!(client = %request.client_id, error = %error_code, "Upstream reported an error");
            return downstream_redirect(
                &request.redirect_uri,
                &[
                    ("error", sanitize_error_code(error_code)),
                    ("error_description", "The identity provider rejected the request"),
                ],
                request.state.as_deref(),
            );
        }

        let code = code.ok_or_else(|| {
            Error::InvalidRequest("Callback carried neither code nor error".to_string())
        })?;

        let metadata = self.authority.discover().await?;
        let tokens = self
            .authority
            .exchange_code(&metadata, code, &pending.code_verifier)
            .await?;
        let claims = self
            .authority
            .validate_id_token(&metadata, &tokens, Some(&pending.nonce))
            .await?;

        info!(
            client = %request.client_id,
            user = %claims.subject,
            "Authorization flow complete"
        );

        let grant = IssuedGrant::new(
            request.client_id.clone(),
            request.scope.clone(),
            claims,
            tokens,
            request.code_challenge.clone(),
            request.code_challenge_method.clone(),
        );
        let downstream_code = self.grants.issue(grant);

        downstream_redirect(
            &request.redirect_uri,
            &[("code", &downstream_code)],
            request.state.as_deref(),
        )
    }
}

/// Build a redirect back to the downstream client, echoing its opaque state.
fn downstream_redirect(
    redirect_uri: &str,
    params: &[(&str, &str)],
    state: Option<&str>,
) -> Result<Url> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| Error::InvalidRequest(format!("Invalid redirect URI: {e}")))?;

    {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in params {
            pairs.append_pair(k, v);
        }
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }

    Ok(url)
}

/// Restrict a provider-supplied error code to the RFC 6749 token alphabet
/// before echoing it into a redirect.
fn sanitize_error_code(code: &str) -> &str {
    let clean = code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if clean && !code.is_empty() {
        code
    } else {
        "server_error"
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_redirect_appends_params_and_state() {
        let url = downstream_redirect(
            "https://client.example/cb",
            &[("code", "mcpob_x")],
            Some("opaque"),
        )
        .unwrap();

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["code"], "mcpob_x");
        assert_eq!(pairs["state"], "opaque");
    }

    #[test]
    fn downstream_redirect_omits_state_when_absent() {
        let url = downstream_redirect(
            "https://client.example/cb",
            &[("error", "access_denied")],
            None,
        )
        .unwrap();

        assert!(!url.query_pairs().any(|(k, _)| k == "state"));
    }

    #[test]
    fn downstream_redirect_preserves_existing_query() {
        let url = downstream_redirect(
            "https://client.example/cb?keep=1",
            &[("code", "c")],
            None,
        )
        .unwrap();

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["keep"], "1");
        assert_eq!(pairs["code"], "c");
    }

    #[test]
    fn malformed_redirect_uri_is_rejected() {
        assert!(downstream_redirect("not a url", &[], None).is_err());
    }

    #[test]
    fn error_codes_outside_the_token_alphabet_are_replaced() {
        assert_eq!(sanitize_error_code("access_denied"), "access_denied");
        assert_eq!(sanitize_error_code("temporarily_unavailable"), "temporarily_unavailable");
        assert_eq!(sanitize_error_code("oops<script>"), "server_error");
        assert_eq!(sanitize_error_code(""), "server_error");
    }
}
