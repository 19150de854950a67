//! Issued grants — the broker's downstream-facing authorization artifacts.
//!
//! A completed flow mints one [`IssuedGrant`] and stores it under a fresh,
//! single-use downstream authorization code with a short TTL. The downstream
//! authorization layer redeems the code via [`GrantStore::redeem`]; a second
//! redemption of the same code observes `None`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pkce;
use crate::upstream::{IdentityClaims, UpstreamTokenSet};

/// The grant's property bag: exactly the validated claims and the wrapped
/// upstream token set, replaced together or not at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrantProps {
    /// Validated identity claims — the source of truth for the user.
    pub claims: IdentityClaims,
    /// Upstream token set wrapped by the downstream grant.
    pub tokens: UpstreamTokenSet,
}

/// The broker's issued authorization artifact, constructed once per
/// completed flow and owned by the downstream authorization layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedGrant {
    /// User id (the ID token's `sub` claim).
    pub user_id: String,
    /// Display label (name, email, or subject).
    pub label: String,
    /// Downstream client the grant was issued to.
    pub client_id: String,
    /// Scope granted by the user's approval.
    pub scope: Vec<String>,
    /// Grant identifier, for audit correlation.
    pub grant_id: String,
    /// Claims + token set.
    pub props: GrantProps,
    /// Downstream PKCE challenge carried opaquely for the downstream token
    /// endpoint to verify; the broker never checks it.
    #[serde(default)]
    pub code_challenge: Option<String>,
    /// Downstream PKCE challenge method.
    #[serde(default)]
    pub code_challenge_method: Option<String>,
}

struct StoredGrant {
    grant: IssuedGrant,
    expires_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Single-use store for downstream authorization codes.
pub struct GrantStore {
    by_code: DashMap<String, StoredGrant>,
    ttl_secs: u64,
}

impl GrantStore {
    /// Create a store whose codes expire after `ttl_secs`.
    #[must_use]
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            by_code: DashMap::new(),
            ttl_secs,
        }
    }

    /// Store a grant under a fresh downstream authorization code.
    #[must_use]
    pub fn issue(&self, grant: IssuedGrant) -> String {
        let code = pkce::authorization_code();
        debug!(grant = %grant.grant_id, client = %grant.client_id, "Issued downstream code");
        self.by_code.insert(
            code.clone(),
            StoredGrant {
                grant,
                expires_at: now_secs() + self.ttl_secs,
            },
        );
        code
    }

    /// Redeem a downstream code, consuming it.
    ///
    /// Returns `None` for unknown, expired, or already-redeemed codes.
    #[must_use]
    pub fn redeem(&self, code: &str) -> Option<IssuedGrant> {
        let (_, stored) = self.by_code.remove(code)?;
        if now_secs() >= stored.expires_at {
            debug!(grant = %stored.grant.grant_id, "Dropped expired downstream code");
            return None;
        }
        Some(stored.grant)
    }

    /// Remove expired codes. Called by the background reaper.
    pub fn reap_expired(&self) -> usize {
        let now = now_secs();
        let expired: Vec<String> = self
            .by_code
            .iter()
            .filter(|e| now >= e.value().expires_at)
            .map(|e| e.key().clone())
            .collect();

        let count = expired.len();
        for code in expired {
            self.by_code.remove(&code);
        }
        count
    }
}

impl IssuedGrant {
    /// Construct a grant from a completed flow's outputs.
    #[must_use]
    pub fn new(
        client_id: String,
        scope: Vec<String>,
        claims: IdentityClaims,
        tokens: UpstreamTokenSet,
        code_challenge: Option<String>,
        code_challenge_method: Option<String>,
    ) -> Self {
        Self {
            user_id: claims.subject.clone(),
            label: claims.label(),
            client_id,
            scope,
            grant_id: uuid::Uuid::new_v4().to_string(),
            props: GrantProps { claims, tokens },
            code_challenge,
            code_challenge_method,
        }
    }
}
