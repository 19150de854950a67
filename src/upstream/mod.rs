//! Upstream OIDC client for the identity provider.
//!
//! Implements the relying-party side of the broker: provider metadata
//! discovery, authorization URL construction, authorization-code exchange,
//! ID-token validation against the transaction nonce, and refresh grants.
//!
//! The [`UpstreamAuthority`] trait is the seam between the flow orchestrator
//! and the network; tests substitute an in-memory fake.

mod client;
mod id_token;
mod metadata;

pub use client::{OidcClient, UpstreamTokenSet, build_authorization_url};
pub use id_token::{IdTokenVerifier, IdentityClaims, JwksCache};
pub use metadata::ProviderMetadata;

use crate::Result;

/// The four upstream operations the flow orchestrator depends on.
#[async_trait::async_trait]
pub trait UpstreamAuthority: Send + Sync + 'static {
    /// Resolve the provider's endpoints. Fatal for the flow on failure.
    async fn discover(&self) -> Result<ProviderMetadata>;

    /// Exchange an authorization code (with its PKCE verifier) for tokens.
    async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        code: &str,
        verifier: &str,
    ) -> Result<UpstreamTokenSet>;

    /// Validate the ID token in a token set; claims are only trusted after
    /// this passes. `expected_nonce` is `None` only for refresh responses.
    async fn validate_id_token(
        &self,
        metadata: &ProviderMetadata,
        tokens: &UpstreamTokenSet,
        expected_nonce: Option<&str>,
    ) -> Result<IdentityClaims>;

    /// Perform the refresh-token grant. Failure signals that a fresh full
    /// flow is required; callers must not retry.
    async fn refresh(
        &self,
        metadata: &ProviderMetadata,
        refresh_token: &str,
    ) -> Result<UpstreamTokenSet>;
}
