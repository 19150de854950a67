//! Transaction state store — persistence for in-flight authorization flows.
//!
//! A transaction is one complete attempt at the authorize → consent →
//! callback sequence. The [`TransactionStore`] trait abstracts over storage
//! backends; the only current implementation is [`InMemoryTransactionStore`],
//! backed by a `DashMap` with a background reaper that evicts expired entries.
//!
//! # Single-use semantics
//!
//! `take` removes the entry atomically (`DashMap::remove`), so when two
//! requests race on the same transaction id — a duplicated callback, say —
//! only the first observes a live bundle and every later caller gets `None`.
//! Once consumed or invalidated, an id never resolves again.
//!
//! Entries are stored under a SHA-256-derived key of the transaction id, so a
//! caller who cannot predict the id cannot read or overwrite another flow's
//! state even with direct access to the map.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// The downstream authorization request, carried opaquely through the flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamRequest {
    /// Downstream client identifier.
    pub client_id: String,
    /// Redirect target registered by the downstream client.
    pub redirect_uri: String,
    /// Requested scopes.
    pub scope: Vec<String>,
    /// Opaque state supplied by the downstream client; echoed back unchanged.
    #[serde(default)]
    pub state: Option<String>,
    /// Downstream PKCE challenge (verified later by the downstream token
    /// endpoint, not by the broker).
    #[serde(default)]
    pub code_challenge: Option<String>,
    /// Downstream PKCE challenge method.
    #[serde(default)]
    pub code_challenge_method: Option<String>,
}

/// Pending-authorization bundle persisted between flow steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    /// The originating downstream request.
    pub request: DownstreamRequest,
    /// PKCE verifier sent to the upstream token endpoint at code exchange.
    pub code_verifier: String,
    /// Derived S256 challenge sent in the upstream authorization URL.
    pub code_challenge: String,
    /// OIDC nonce bound to this transaction's ID token.
    pub nonce: String,
    /// Consent token embedded in the approval form (CSRF check).
    pub consent_token: String,
    /// Creation time (Unix epoch seconds).
    pub created_at: u64,
    /// Absolute expiry (Unix epoch seconds).
    pub expires_at: u64,
}

impl PendingAuthorization {
    /// Returns `true` if the transaction has passed its absolute expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Trait abstracting the transaction storage backend.
#[async_trait::async_trait]
pub trait TransactionStore: Send + Sync + 'static {
    /// Persist a new bundle under the given transaction id.
    async fn create(&self, txn_id: &str, pending: PendingAuthorization);

    /// Consume the bundle for a transaction id.
    ///
    /// Returns `None` if the id is unknown, expired, or already consumed.
    /// Consumption is atomic: concurrent callers for the same id observe at
    /// most one live bundle between them.
    async fn take(&self, txn_id: &str) -> Option<PendingAuthorization>;

    /// Re-persist a bundle under its existing transaction id.
    ///
    /// Used at the consent step, which consumes the bundle, approves it, and
    /// re-creates it as part of the upstream redirect so the callback can
    /// correlate on the same id.
    async fn restore(&self, txn_id: &str, pending: PendingAuthorization);

    /// Drop a transaction without reading it. Returns `true` if it existed.
    async fn invalidate(&self, txn_id: &str) -> bool;

    /// Remove all expired entries. Called by the background reaper.
    async fn reap_expired(&self) -> usize;
}

/// Derive the storage key for a transaction id.
///
/// Also used for the session cookie name, so the cookie never exposes more of
/// the id than is needed for lookup.
#[must_use]
pub fn storage_key(txn_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(txn_id.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// In-memory transaction store backed by a `DashMap`.
pub struct InMemoryTransactionStore {
    entries: DashMap<String, PendingAuthorization>,
}

impl InMemoryTransactionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for InMemoryTransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create(&self, txn_id: &str, pending: PendingAuthorization) {
        self.entries.insert(storage_key(txn_id), pending);
    }

    async fn take(&self, txn_id: &str) -> Option<PendingAuthorization> {
        let (_, pending) = self.entries.remove(&storage_key(txn_id))?;

        if pending.is_expired() {
            // Server-side expiry holds even if the client resubmits
            debug!(key = %storage_key(txn_id), "Dropped expired transaction on take");
            return None;
        }

        Some(pending)
    }

    async fn restore(&self, txn_id: &str, pending: PendingAuthorization) {
        self.entries.insert(storage_key(txn_id), pending);
    }

    async fn invalidate(&self, txn_id: &str) -> bool {
        self.entries.remove(&storage_key(txn_id)).is_some()
    }

    async fn reap_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();

        let count = expired.len();
        for key in expired {
            self.entries.remove(&key);
        }
        count
    }
}

/// Spawn a background task that reaps expired transactions every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn TransactionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired transactions");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Transaction reaper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkce;

    pub(crate) fn make_pending(consent_token: &str, ttl_offset_secs: i64) -> PendingAuthorization {
        let now = now_secs();
        let expires_at = if ttl_offset_secs >= 0 {
            now + u64::try_from(ttl_offset_secs).unwrap()
        } else {
            now.saturating_sub(u64::try_from(-ttl_offset_secs).unwrap())
        };

        let verifier = pkce::code_verifier();
        PendingAuthorization {
            request: DownstreamRequest {
                client_id: "c1".to_string(),
                redirect_uri: "https://client.example/cb".to_string(),
                scope: vec!["openid".to_string(), "profile".to_string()],
                state: Some("downstream-opaque".to_string()),
                code_challenge: None,
                code_challenge_method: None,
            },
            code_challenge: pkce::code_challenge(&verifier),
            code_verifier: verifier,
            nonce: pkce::nonce(),
            consent_token: consent_token.to_string(),
            created_at: now,
            expires_at,
        }
    }

    #[tokio::test]
    async fn create_and_take_round_trips() {
        // GIVEN: a store with one live transaction
        let store = InMemoryTransactionStore::new();
        let txn = pkce::transaction_id();
        store.create(&txn, make_pending("ct", 3600)).await;

        // WHEN: we take it
        let found = store.take(&txn).await;

        // THEN: the bundle is returned intact
        assert!(found.is_some());
        assert_eq!(found.unwrap().request.client_id, "c1");
    }

    #[tokio::test]
    async fn take_is_single_use() {
        // GIVEN: one transaction, taken once
        let store = InMemoryTransactionStore::new();
        let txn = pkce::transaction_id();
        store.create(&txn, make_pending("ct", 3600)).await;
        assert!(store.take(&txn).await.is_some());

        // WHEN: the same id is taken again (replayed callback)
        let second = store.take(&txn).await;

        // THEN: the id never resolves again
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn take_drops_expired_transaction() {
        // GIVEN: a transaction that expired one second ago
        let store = InMemoryTransactionStore::new();
        let txn = pkce::transaction_id();
        store.create(&txn, make_pending("ct", -1)).await;

        // WHEN: we take it
        let found = store.take(&txn).await;

        // THEN: expiry is enforced server-side and the entry is gone
        assert!(found.is_none());
        assert_eq!(store.entries.len(), 0);
    }

    #[tokio::test]
    async fn restore_allows_callback_correlation() {
        // Consent step pattern: take, then restore under the same id
        let store = InMemoryTransactionStore::new();
        let txn = pkce::transaction_id();
        store.create(&txn, make_pending("ct", 3600)).await;

        let pending = store.take(&txn).await.unwrap();
        store.restore(&txn, pending).await;

        assert!(store.take(&txn).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_prevents_later_take() {
        let store = InMemoryTransactionStore::new();
        let txn = pkce::transaction_id();
        store.create(&txn, make_pending("ct", 3600)).await;

        assert!(store.invalidate(&txn).await);
        assert!(store.take(&txn).await.is_none());
        assert!(!store.invalidate(&txn).await);
    }

    #[tokio::test]
    async fn unknown_id_resolves_to_none() {
        let store = InMemoryTransactionStore::new();
        assert!(store.take("txn_does-not-exist").await.is_none());
    }

    #[tokio::test]
    async fn reap_removes_only_expired() {
        // GIVEN: one live and two expired transactions
        let store = InMemoryTransactionStore::new();
        store
            .create(&pkce::transaction_id(), make_pending("a", 3600))
            .await;
        store
            .create(&pkce::transaction_id(), make_pending("b", -1))
            .await;
        store
            .create(&pkce::transaction_id(), make_pending("c", -10))
            .await;

        // WHEN: the reaper runs
        let reaped = store.reap_expired().await;

        // THEN: only the expired entries are gone
        assert_eq!(reaped, 2);
        assert_eq!(store.entries.len(), 1);
    }

    #[test]
    fn storage_key_is_stable_and_opaque() {
        let key = storage_key("txn_abc");
        assert_eq!(key, storage_key("txn_abc"));
        assert_ne!(key, storage_key("txn_abd"));
        assert_eq!(key.len(), 16);
        assert!(!key.contains("txn"));
    }
}
