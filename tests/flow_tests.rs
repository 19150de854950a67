//! End-to-end flow tests driven through the broker with a fake upstream
//! authority: authorize → consent → callback, plus the consent and replay
//! failure paths and the downstream token exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use mcp_oauth_broker::{
    Error,
    broker::{Broker, ConsentOutcome},
    config::{ClientConfig, Config},
    grant::GrantProps,
    pkce,
    token_exchange::GrantType,
    txn::{DownstreamRequest, InMemoryTransactionStore},
    upstream::{IdentityClaims, ProviderMetadata, UpstreamAuthority, UpstreamTokenSet},
};
use url::Url;

/// Fake provider: records what the broker sends and returns canned tokens.
#[derive(Default)]
struct FakeAuthority {
    /// `(code, verifier)` pairs seen at the token endpoint.
    exchanges: Mutex<Vec<(String, String)>>,
    /// Expected nonce passed to each ID-token validation.
    validated_nonces: Mutex<Vec<Option<String>>>,
    refresh_calls: AtomicUsize,
    /// When set, every ID-token validation fails as a nonce mismatch.
    reject_id_token: bool,
}

impl FakeAuthority {
    fn rejecting_id_tokens() -> Self {
        Self {
            reject_id_token: true,
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl UpstreamAuthority for FakeAuthority {
    async fn discover(&self) -> mcp_oauth_broker::Result<ProviderMetadata> {
        Ok(serde_json::from_str(
            r#"{
                "issuer": "https://idp.example.com",
                "authorization_endpoint": "https://idp.example.com/authorize",
                "token_endpoint": "https://idp.example.com/oauth/token",
                "jwks_uri": "https://idp.example.com/.well-known/jwks.json",
                "code_challenge_methods_supported": ["S256"]
            }"#,
        )
        .expect("static metadata parses"))
    }

    async fn exchange_code(
        &self,
        _metadata: &ProviderMetadata,
        code: &str,
        verifier: &str,
    ) -> mcp_oauth_broker::Result<UpstreamTokenSet> {
        self.exchanges
            .lock()
            .unwrap()
            .push((code.to_string(), verifier.to_string()));
        Ok(UpstreamTokenSet {
            access_token: "upstream-at".to_string(),
            id_token: Some("upstream-idt".to_string()),
            refresh_token: Some("upstream-rt".to_string()),
            expires_in: 1234,
        })
    }

    async fn validate_id_token(
        &self,
        _metadata: &ProviderMetadata,
        _tokens: &UpstreamTokenSet,
        expected_nonce: Option<&str>,
    ) -> mcp_oauth_broker::Result<IdentityClaims> {
        if self.reject_id_token {
            return Err(Error::InvalidIdToken(
                "Nonce does not match this transaction".to_string(),
            ));
        }
        self.validated_nonces
            .lock()
            .unwrap()
            .push(expected_nonce.map(str::to_string));
        Ok(IdentityClaims {
            subject: "user-1".to_string(),
            email: Some("alice@example.com".to_string()),
            name: Some("Alice".to_string()),
            issuer: "https://idp.example.com".to_string(),
        })
    }

    async fn refresh(
        &self,
        _metadata: &ProviderMetadata,
        _refresh_token: &str,
    ) -> mcp_oauth_broker::Result<UpstreamTokenSet> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(UpstreamTokenSet {
            access_token: "refreshed-at".to_string(),
            id_token: Some("refreshed-idt".to_string()),
            refresh_token: None,
            expires_in: 900,
        })
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.public_url = "https://broker.example".to_string();
    config.upstream.issuer_url = "https://idp.example.com".to_string();
    config.upstream.client_id = "broker-client".to_string();
    config.upstream.client_secret = "s3cret".to_string();
    config.upstream.scopes = vec!["openid".to_string(), "profile".to_string()];
    config.clients = vec![ClientConfig {
        client_id: "c1".to_string(),
        name: "Example Tool".to_string(),
        logo_uri: None,
        client_uri: None,
        redirect_uris: vec!["https://client.example/cb".to_string()],
    }];
    config
}

fn make_broker(authority: Arc<FakeAuthority>) -> Broker {
    Broker::with_authority(
        test_config(),
        Arc::new(InMemoryTransactionStore::new()),
        authority,
    )
}

fn downstream_request() -> DownstreamRequest {
    DownstreamRequest {
        client_id: "c1".to_string(),
        redirect_uri: "https://client.example/cb".to_string(),
        scope: vec!["openid".to_string(), "profile".to_string()],
        state: Some("downstream-opaque".to_string()),
        code_challenge: None,
        code_challenge_method: None,
    }
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}

#[tokio::test]
async fn full_flow_issues_a_downstream_code() {
    let authority = Arc::new(FakeAuthority::default());
    let broker = make_broker(Arc::clone(&authority));

    // Step 1: downstream request opens a transaction
    let prompt = broker.begin_authorization(downstream_request()).await.unwrap();
    assert!(prompt.txn_id.starts_with("txn_"));
    assert!(!prompt.consent_token.is_empty());
    assert_eq!(prompt.client.name, "Example Tool");
    assert_eq!(prompt.scope, vec!["openid", "profile"]);

    // Step 2: approval redirects the browser upstream
    let outcome = broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "approve")
        .await
        .unwrap();
    let ConsentOutcome::RedirectUpstream(upstream_url) = outcome else {
        panic!("approval must redirect upstream");
    };

    let params = query_map(&upstream_url);
    assert!(upstream_url.as_str().starts_with("https://idp.example.com/authorize"));
    assert_eq!(params["response_type"], "code");
    assert_eq!(params["client_id"], "broker-client");
    assert_eq!(params["redirect_uri"], "https://broker.example/callback");
    assert_eq!(params["state"], prompt.txn_id);
    assert_eq!(params["code_challenge_method"], "S256");
    assert_eq!(params["scope"], "openid profile");
    let upstream_nonce = params["nonce"].clone();
    let upstream_challenge = params["code_challenge"].clone();

    // Step 3: provider redirects back with a code
    let redirect = broker
        .complete_callback(&prompt.txn_id, Some("ABC"), None)
        .await
        .unwrap();

    let params = query_map(&redirect);
    assert!(redirect.as_str().starts_with("https://client.example/cb"));
    assert!(params["code"].starts_with("mcpob_"));
    assert_eq!(params["state"], "downstream-opaque");

    // The code exchange carried the verifier matching the challenge sent
    // upstream, and validation was bound to the transaction nonce
    let exchanges = authority.exchanges.lock().unwrap();
    assert_eq!(exchanges.len(), 1);
    assert_eq!(exchanges[0].0, "ABC");
    assert_eq!(pkce::code_challenge(&exchanges[0].1), upstream_challenge);

    let nonces = authority.validated_nonces.lock().unwrap();
    assert_eq!(nonces.as_slice(), &[Some(upstream_nonce)]);

    // The downstream code redeems to the issued grant, exactly once
    let grant = broker.grants().redeem(&params["code"]).unwrap();
    assert_eq!(grant.user_id, "user-1");
    assert_eq!(grant.label, "Alice");
    assert_eq!(grant.client_id, "c1");
    assert_eq!(grant.scope, vec!["openid", "profile"]);
    assert_eq!(grant.props.tokens.access_token, "upstream-at");
    assert!(broker.grants().redeem(&params["code"]).is_none());
}

#[tokio::test]
async fn replayed_callback_is_rejected() {
    let broker = make_broker(Arc::new(FakeAuthority::default()));

    let prompt = broker.begin_authorization(downstream_request()).await.unwrap();
    broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "approve")
        .await
        .unwrap();

    assert!(broker.complete_callback(&prompt.txn_id, Some("ABC"), None).await.is_ok());

    // Same state again: the transaction was consumed by the first callback
    let replay = broker.complete_callback(&prompt.txn_id, Some("ABC"), None).await;
    assert!(matches!(replay, Err(Error::Transaction(_))));
}

#[tokio::test]
async fn unknown_state_is_rejected() {
    let broker = make_broker(Arc::new(FakeAuthority::default()));
    let result = broker.complete_callback("txn_never-issued", Some("ABC"), None).await;
    assert!(matches!(result, Err(Error::Transaction(_))));
}

#[tokio::test]
async fn denial_redirects_downstream_with_state_preserved() {
    let broker = make_broker(Arc::new(FakeAuthority::default()));

    let prompt = broker.begin_authorization(downstream_request()).await.unwrap();
    let outcome = broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "deny")
        .await
        .unwrap();

    let ConsentOutcome::Denied(url) = outcome else {
        panic!("denial must redirect downstream");
    };
    let params = query_map(&url);
    assert!(url.as_str().starts_with("https://client.example/cb"));
    assert_eq!(params["error"], "access_denied");
    assert_eq!(params["state"], "downstream-opaque");

    // Denial consumed the transaction
    let late = broker.complete_callback(&prompt.txn_id, Some("ABC"), None).await;
    assert!(matches!(late, Err(Error::Transaction(_))));
}

#[tokio::test]
async fn forged_consent_token_fails_closed() {
    let broker = make_broker(Arc::new(FakeAuthority::default()));

    let prompt = broker.begin_authorization(downstream_request()).await.unwrap();
    let forged = broker
        .submit_consent(&prompt.txn_id, "attacker-supplied", "approve")
        .await;
    assert!(matches!(forged, Err(Error::ConsentForgery)));

    // The forgery attempt consumed the transaction; the real token is now
    // useless too
    let retry = broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "approve")
        .await;
    assert!(matches!(retry, Err(Error::Transaction(_))));
}

#[tokio::test]
async fn forged_consent_token_on_deny_fails_closed() {
    let broker = make_broker(Arc::new(FakeAuthority::default()));

    // A forged token is rejected before the action is even looked at, so a
    // "deny" submission gets no special treatment
    let prompt = broker.begin_authorization(downstream_request()).await.unwrap();
    let forged = broker
        .submit_consent(&prompt.txn_id, "attacker-supplied", "deny")
        .await;
    assert!(matches!(forged, Err(Error::ConsentForgery)));

    let retry = broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "deny")
        .await;
    assert!(matches!(retry, Err(Error::Transaction(_))));
}

#[tokio::test]
async fn unrecognized_consent_action_fails_closed() {
    let broker = make_broker(Arc::new(FakeAuthority::default()));

    let prompt = broker.begin_authorization(downstream_request()).await.unwrap();
    let result = broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "maybe")
        .await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));

    let retry = broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "approve")
        .await;
    assert!(matches!(retry, Err(Error::Transaction(_))));
}

#[tokio::test]
async fn unknown_client_is_rejected() {
    let broker = make_broker(Arc::new(FakeAuthority::default()));

    let mut request = downstream_request();
    request.client_id = "not-registered".to_string();

    let result = broker.begin_authorization(request).await;
    assert!(matches!(result, Err(Error::UnknownClient(_))));
}

#[tokio::test]
async fn unregistered_redirect_uri_is_rejected() {
    let broker = make_broker(Arc::new(FakeAuthority::default()));

    let mut request = downstream_request();
    request.redirect_uri = "https://evil.example/cb".to_string();

    let result = broker.begin_authorization(request).await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}

#[tokio::test]
async fn upstream_error_propagates_to_the_client() {
    let broker = make_broker(Arc::new(FakeAuthority::default()));

    let prompt = broker.begin_authorization(downstream_request()).await.unwrap();
    broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "approve")
        .await
        .unwrap();

    let redirect = broker
        .complete_callback(&prompt.txn_id, None, Some("access_denied"))
        .await
        .unwrap();

    let params = query_map(&redirect);
    assert!(redirect.as_str().starts_with("https://client.example/cb"));
    assert_eq!(params["error"], "access_denied");
    assert_eq!(params["state"], "downstream-opaque");
}

#[tokio::test]
async fn invalid_id_token_aborts_the_flow() {
    let authority = Arc::new(FakeAuthority::rejecting_id_tokens());
    let broker = make_broker(authority);

    let prompt = broker.begin_authorization(downstream_request()).await.unwrap();
    broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "approve")
        .await
        .unwrap();

    let result = broker.complete_callback(&prompt.txn_id, Some("ABC"), None).await;
    assert!(matches!(result, Err(Error::InvalidIdToken(_))));

    // No live transaction remains after the failure
    let retry = broker.complete_callback(&prompt.txn_id, Some("ABC"), None).await;
    assert!(matches!(retry, Err(Error::Transaction(_))));
}

#[tokio::test]
async fn token_exchange_passes_the_upstream_lifetime_through() {
    let authority = Arc::new(FakeAuthority::default());
    let broker = make_broker(Arc::clone(&authority));

    let prompt = broker.begin_authorization(downstream_request()).await.unwrap();
    broker
        .submit_consent(&prompt.txn_id, &prompt.consent_token, "approve")
        .await
        .unwrap();
    let redirect = broker
        .complete_callback(&prompt.txn_id, Some("ABC"), None)
        .await
        .unwrap();
    let code = query_map(&redirect)["code"].clone();
    let grant = broker.grants().redeem(&code).unwrap();

    let outcome = broker
        .exchange_callback()
        .on_grant(GrantType::AuthorizationCode, grant.props)
        .await
        .unwrap();

    // Downstream lifetime equals the upstream token's, with no refresh call
    assert_eq!(outcome.expires_in, 1234);
    assert_eq!(authority.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refresh_grant_without_upstream_refresh_token_fails_fast() {
    let authority = Arc::new(FakeAuthority::default());
    let broker = make_broker(Arc::clone(&authority));

    let props = GrantProps {
        claims: IdentityClaims {
            subject: "user-1".to_string(),
            email: None,
            name: None,
            issuer: "https://idp.example.com".to_string(),
        },
        tokens: UpstreamTokenSet {
            access_token: "at".to_string(),
            id_token: Some("idt".to_string()),
            refresh_token: None,
            expires_in: 900,
        },
    };

    let result = broker
        .exchange_callback()
        .on_grant(GrantType::RefreshToken, props)
        .await;

    assert!(matches!(result, Err(Error::NoRefreshToken)));
    assert_eq!(authority.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refresh_grant_replaces_the_token_set() {
    let authority = Arc::new(FakeAuthority::default());
    let broker = make_broker(Arc::clone(&authority));

    let props = GrantProps {
        claims: IdentityClaims {
            subject: "user-1".to_string(),
            email: None,
            name: None,
            issuer: "https://idp.example.com".to_string(),
        },
        tokens: UpstreamTokenSet {
            access_token: "at".to_string(),
            id_token: Some("idt".to_string()),
            refresh_token: Some("rt".to_string()),
            expires_in: 900,
        },
    };

    let outcome = broker
        .exchange_callback()
        .on_grant(GrantType::RefreshToken, props)
        .await
        .unwrap();

    assert_eq!(outcome.props.tokens.access_token, "refreshed-at");
    // Provider did not rotate: the prior refresh token is carried forward
    assert_eq!(outcome.props.tokens.refresh_token.as_deref(), Some("rt"));
    assert_eq!(outcome.expires_in, 900);
    assert_eq!(authority.refresh_calls.load(Ordering::SeqCst), 1);
}
