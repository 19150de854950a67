//! ID-token validation — JWT signature checks, JWKS caching, nonce binding.
//!
//! # Validation flow
//!
//! 1. Decode the JWT header to extract `kid` and `alg`.
//! 2. Fetch the provider's JWKS (cached for 1 hour; refreshed once on an
//!    unknown `kid`).
//! 3. Verify the signature and `exp` via `jsonwebtoken`.
//! 4. Check `iss` against the discovered issuer and `aud` against the
//!    broker's upstream client id (string or array form).
//! 5. Check the `nonce` claim against the nonce persisted for the
//!    transaction. This is what prevents token substitution and replay across
//!    transactions; no claim is trusted before it passes.
//!
//! A 60-second clock leeway tolerates skew between the provider and the
//! broker host.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Validated claim set extracted from an upstream ID token.
///
/// The source of truth for the user's delegated identity; the opaque access
/// and refresh tokens are only carried alongside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityClaims {
    /// OIDC `sub` claim (opaque user id).
    pub subject: String,
    /// Email address, when the provider supplies one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name, when the provider supplies one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Issuer URL the token was validated against.
    pub issuer: String,
}

impl IdentityClaims {
    /// Human-readable label for the grant: name, else email, else subject.
    #[must_use]
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.subject.clone())
    }
}

/// Raw ID-token claims. The nonce is checked and then discarded.
#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: String,
    sub: String,
    #[serde(default)]
    aud: serde_json::Value,
    /// Validated by jsonwebtoken internally
    #[allow(dead_code)]
    exp: u64,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// JWKS cache — one entry per JWKS URI.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksCache {
    /// Create with the given HTTP client and a 1-hour TTL.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            inner: DashMap::new(),
            http,
            ttl: Duration::from_secs(3600),
        }
    }

    /// Return the cached JWKS for `jwks_uri`, fetching if absent or stale.
    async fn get_or_fetch(&self, jwks_uri: &str, force_refresh: bool) -> Result<JwkSet> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(jwks_uri) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(uri = %jwks_uri, "Fetching JWKS");
        let jwks: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| Error::InvalidIdToken(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::InvalidIdToken(format!("Malformed JWKS: {e}")))?;

        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
                ttl: self.ttl,
            },
        );

        Ok(jwks)
    }
}

/// ID-token verifier bound to one upstream provider.
pub struct IdTokenVerifier {
    jwks_cache: JwksCache,
}

impl IdTokenVerifier {
    /// Create a verifier sharing the broker's upstream HTTP client.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            jwks_cache: JwksCache::new(http),
        }
    }

    /// Validate an ID token and return its claims.
    ///
    /// `expected_nonce` is the nonce persisted for the transaction; pass
    /// `None` only for refresh responses, which carry no nonce.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdToken`] on any signature, issuer, audience,
    /// or nonce failure.
    pub async fn verify(
        &self,
        id_token: &str,
        jwks_uri: &str,
        expected_issuer: &str,
        expected_audience: &str,
        expected_nonce: Option<&str>,
    ) -> Result<IdentityClaims> {
        let header = jsonwebtoken::decode_header(id_token)
            .map_err(|e| Error::InvalidIdToken(format!("Malformed JWT header: {e}")))?;

        let kid = header
            .kid
            .clone()
            .ok_or_else(|| Error::InvalidIdToken("JWT missing 'kid' header".to_string()))?;

        let decoding_key = self.find_decoding_key(&kid, jwks_uri).await?;

        // Audience is handled manually below to support both the single-string
        // and array forms and to give a clear error.
        let mut validation = build_validation(&header);
        validation.validate_aud = false;

        let token_data: TokenData<RawClaims> =
            jsonwebtoken::decode(id_token, &decoding_key, &validation)
                .map_err(|e| Error::InvalidIdToken(format!("Signature validation failed: {e}")))?;
        let claims = token_data.claims;

        if claims.iss != expected_issuer {
            return Err(Error::InvalidIdToken(format!(
                "Issuer mismatch: expected {expected_issuer}, got {}",
                claims.iss
            )));
        }

        check_audience(&claims.aud, expected_audience)?;
        check_nonce(claims.nonce.as_deref(), expected_nonce)?;

        Ok(IdentityClaims {
            subject: claims.sub,
            email: claims.email,
            name: claims.name,
            issuer: claims.iss,
        })
    }

    /// Find a decoding key by `kid`, refreshing the JWKS cache once if absent.
    async fn find_decoding_key(&self, kid: &str, jwks_uri: &str) -> Result<DecodingKey> {
        let jwks = self.jwks_cache.get_or_fetch(jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        // Unknown kid: refresh once and retry
        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks_cache.get_or_fetch(jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid)
            .ok_or_else(|| Error::InvalidIdToken(format!("Unknown key id: {kid}")))
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Build a [`Validation`] from the JWT header algorithm.
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60; // clock skew tolerance
    v
}

/// Validate that the token's `aud` claim contains the expected audience.
fn check_audience(aud_claim: &serde_json::Value, expected: &str) -> Result<()> {
    let matches = match aud_claim {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Array(arr) => {
            arr.iter().any(|v| v.as_str().is_some_and(|s| s == expected))
        }
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(Error::InvalidIdToken(format!(
            "Audience mismatch: expected {expected}"
        )))
    }
}

/// Validate the `nonce` claim against the value stored for the transaction.
fn check_nonce(claim: Option<&str>, expected: Option<&str>) -> Result<()> {
    match (claim, expected) {
        (_, None) => Ok(()),
        (Some(c), Some(e)) if c == e => Ok(()),
        (Some(_), Some(_)) => Err(Error::InvalidIdToken(
            "Nonce does not match this transaction".to_string(),
        )),
        (None, Some(_)) => Err(Error::InvalidIdToken(
            "Missing nonce claim".to_string(),
        )),
    }
}
