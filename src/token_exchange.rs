//! Token exchange callback — in-process contract for the downstream
//! authorization layer's own grants.
//!
//! Invoked at two points:
//!
//! 1. **Authorization-code grant**: the existing upstream access-token
//!    lifetime is passed through as the downstream token's lifetime, so the
//!    broker's token never outlives the upstream one it wraps. No network
//!    call is made.
//! 2. **Refresh-token grant**: requires a stored upstream refresh token;
//!    performs the upstream refresh, revalidates the refreshed ID token, and
//!    replaces claims and token set together. A partial update (fresh tokens,
//!    stale claims) is never returned. If the provider does not rotate the
//!    refresh token, the prior one is carried forward.
//!
//! A refresh failure is a signal that re-authentication is required; this
//! layer never retries.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::grant::GrantProps;
use crate::upstream::UpstreamAuthority;
use crate::{Error, Result};

/// The downstream grant type being exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// Downstream authorization-code grant.
    AuthorizationCode,
    /// Downstream refresh-token grant.
    RefreshToken,
}

/// Updated property bag and token lifetime returned to the downstream layer.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    /// Replacement property bag (claims + token set, replaced atomically).
    pub props: GrantProps,
    /// Lifetime for the downstream token, aligned with the upstream one.
    pub expires_in: u64,
}

/// Token exchange callback bound to the upstream authority.
pub struct TokenExchangeCallback {
    authority: Arc<dyn UpstreamAuthority>,
}

impl TokenExchangeCallback {
    /// Create the callback.
    #[must_use]
    pub fn new(authority: Arc<dyn UpstreamAuthority>) -> Self {
        Self { authority }
    }

    /// Handle a downstream grant, returning the updated property bag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRefreshToken`] for a refresh grant with no stored
    /// upstream refresh token (before any network call), [`Error::Refresh`]
    /// on provider rejection, and [`Error::InvalidIdToken`] if the refreshed
    /// claims cannot be validated.
    pub async fn on_grant(
        &self,
        grant_type: GrantType,
        props: GrantProps,
    ) -> Result<ExchangeOutcome> {
        match grant_type {
            GrantType::AuthorizationCode => {
                // Lifetime pass-through keeps the two tokens synchronized
                debug!(user = %props.claims.subject, "Aligning downstream token lifetime");
                let expires_in = props.tokens.expires_in;
                Ok(ExchangeOutcome { props, expires_in })
            }
            GrantType::RefreshToken => self.refresh(props).await,
        }
    }

    async fn refresh(&self, props: GrantProps) -> Result<ExchangeOutcome> {
        let Some(prior_refresh_token) = props.tokens.refresh_token.clone() else {
            return Err(Error::NoRefreshToken);
        };

        let metadata = self.authority.discover().await?;
        let mut tokens = self
            .authority
            .refresh(&metadata, &prior_refresh_token)
            .await?;

        // No nonce expectation on refresh; issuer/audience/signature still apply
        let claims = self
            .authority
            .validate_id_token(&metadata, &tokens, None)
            .await?;

        // Rotation is provider-optional: keep the prior token if none issued
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(prior_refresh_token);
        }

        info!(user = %claims.subject, "Refreshed upstream grant");
        let expires_in = tokens.expires_in;
        Ok(ExchangeOutcome {
            props: GrantProps { claims, tokens },
            expires_in,
        })
    }
}
