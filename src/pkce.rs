//! PKCE and protocol nonce generation
//!
//! Every value here comes from the process CSPRNG (`rand::rng`) and is
//! generated fresh per transaction; nothing is ever reused across flows.
//!
//! - Code verifiers follow RFC 7636: 32 random bytes base64url-encoded give a
//!   43-character ASCII verifier, inside the 43..=128 length window.
//! - Challenges use the S256 method only (`BASE64URL(SHA256(verifier))`).
//! - Transaction ids carry 256 bits of entropy with a greppable `txn_` prefix.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Generate a PKCE code verifier (43 base64url characters, 256 bits)
#[must_use]
pub fn code_verifier() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Derive the S256 code challenge for a verifier
#[must_use]
pub fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a random OIDC nonce
#[must_use]
pub fn nonce() -> String {
    random_b64::<16>()
}

/// Generate a transaction identifier (`txn_` + 256 bits base64url)
///
/// The transaction id doubles as the upstream `state` correlation value, so
/// it must be unguessable on its own.
#[must_use]
pub fn transaction_id() -> String {
    format!("txn_{}", random_b64::<32>())
}

/// Generate a consent token embedded in the approval form
#[must_use]
pub fn consent_token() -> String {
    random_b64::<32>()
}

/// Generate a downstream authorization code (`mcpob_` + 256 bits base64url)
///
/// The prefix makes issued codes greppable and detectable by secret scanners.
#[must_use]
pub fn authorization_code() -> String {
    format!("mcpob_{}", random_b64::<32>())
}

fn random_b64<const N: usize>() -> String {
    let bytes: [u8; N] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}
