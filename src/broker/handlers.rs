//! HTTP handlers for the authorization flow endpoints.
//!
//! Four routes: `GET /authorize` opens a transaction and shows the consent
//! page, `POST /consent` applies the decision, `GET /callback` receives the
//! provider redirect, `GET /health` reports liveness.
//!
//! The session cookie pins the consent submission to the browser that opened
//! the transaction: its name is the transaction's storage key and its value
//! the transaction id, so one browser can hold several flows in parallel
//! without collisions. The cookie is cleared whenever its transaction is
//! consumed.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Form, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::warn;

use super::{Broker, ConsentOutcome};
use crate::consent::render_error_page;
use crate::txn::{DownstreamRequest, storage_key};
use crate::{Error, Result};

/// Build the broker's router.
pub fn create_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/authorize", get(authorize))
        .route("/consent", post(submit_consent))
        .route("/callback", get(callback))
        .route("/health", get(health))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Downstream authorization request query parameters.
#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    client_id: String,
    redirect_uri: String,
    /// Space-separated scope string, per RFC 6749.
    #[serde(default)]
    scope: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code_challenge: Option<String>,
    #[serde(default)]
    code_challenge_method: Option<String>,
}

impl From<AuthorizeParams> for DownstreamRequest {
    fn from(p: AuthorizeParams) -> Self {
        Self {
            client_id: p.client_id,
            redirect_uri: p.redirect_uri,
            scope: split_scope(&p.scope),
            state: p.state,
            code_challenge: p.code_challenge,
            code_challenge_method: p.code_challenge_method,
        }
    }
}

/// Consent form fields, posted by the approval page.
#[derive(Debug, Deserialize)]
struct ConsentForm {
    transaction_state: String,
    consent_token: String,
    consent_action: String,
}

/// Provider callback query parameters.
#[derive(Debug, Deserialize)]
struct CallbackParams {
    state: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// `GET /authorize` — open a transaction and render the consent page.
async fn authorize(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    let request: DownstreamRequest = params.into();

    match broker.begin_authorization(request).await {
        Ok(prompt) => {
            let page = crate::consent::render_consent_page(
                &prompt.client,
                &prompt.scope,
                &prompt.txn_id,
                &prompt.consent_token,
            );
            let cookie = session_cookie(&prompt.txn_id, broker.config());
            with_cookie(Html(page).into_response(), &cookie)
        }
        Err(e) => error_response(&e),
    }
}

/// `POST /consent` — apply the user's decision.
async fn submit_consent(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    Form(form): Form<ConsentForm>,
) -> Response {
    let development = broker.config().server.development;

    // The cookie set at /authorize must accompany the submission. A missing
    // or mismatched cookie is a forgery signal and fails closed: the
    // transaction is invalidated so the legitimate form cannot be replayed
    // after the attempt.
    if let Err(e) = check_session_cookie(&headers, &form.transaction_state) {
        broker.transactions().invalidate(&form.transaction_state).await;
        let cookie = expired_cookie(&form.transaction_state, development);
        return with_cookie(error_response(&e), &cookie);
    }

    match broker
        .submit_consent(&form.transaction_state, &form.consent_token, &form.consent_action)
        .await
    {
        Ok(ConsentOutcome::RedirectUpstream(url)) => {
            // Kept for the callback leg
            let cookie = session_cookie(&form.transaction_state, broker.config());
            with_cookie(Redirect::to(url.as_str()).into_response(), &cookie)
        }
        Ok(ConsentOutcome::Denied(url)) => {
            let cookie = expired_cookie(&form.transaction_state, development);
            with_cookie(Redirect::to(url.as_str()).into_response(), &cookie)
        }
        Err(e) => {
            let cookie = expired_cookie(&form.transaction_state, development);
            with_cookie(error_response(&e), &cookie)
        }
    }
}

/// `GET /callback` — complete the flow on the provider's redirect.
async fn callback(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let development = broker.config().server.development;

    match broker
        .complete_callback(&params.state, params.code.as_deref(), params.error.as_deref())
        .await
    {
        Ok(url) => {
            let cookie = expired_cookie(&params.state, development);
            with_cookie(Redirect::to(url.as_str()).into_response(), &cookie)
        }
        Err(e) => {
            let cookie = expired_cookie(&params.state, development);
            with_cookie(error_response(&e), &cookie)
        }
    }
}

/// `GET /health` — liveness probe.
async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Surface an error with the variant's status code.
///
/// Request-side failures (bad client, consumed transaction, forged consent)
/// come back as plain text; upstream failures get the generic failure page,
/// since the user saw the provider and deserves more than a one-liner.
fn error_response(error: &Error) -> Response {
    let status = error.status_code();
    if status.is_client_error() {
        return (status, error.to_string()).into_response();
    }

    let code = match status {
        StatusCode::BAD_GATEWAY => "upstream_failure",
        _ => "server_error",
    };
    (status, Html(render_error_page(code, &error.to_string()))).into_response()
}

/// Split an RFC 6749 scope string into individual scopes.
fn split_scope(scope: &str) -> Vec<String> {
    scope
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Build the session cookie for a transaction.
///
/// The max-age tracks the configured transaction TTL so the cookie and the
/// server-side state expire together.
fn session_cookie(txn_id: &str, config: &crate::config::Config) -> String {
    let base = format!(
        "{}={txn_id}; Path=/; HttpOnly; Max-Age={}",
        storage_key(txn_id),
        config.transactions.ttl_secs
    );
    if config.server.development {
        base
    } else {
        // Cross-site navigation back from the provider must carry the cookie
        format!("{base}; Secure; SameSite=None")
    }
}

/// Build an already-expired cookie to clear the session.
fn expired_cookie(txn_id: &str, development: bool) -> String {
    let base = format!("{}=; Path=/; HttpOnly; Max-Age=0", storage_key(txn_id));
    if development {
        base
    } else {
        format!("{base}; Secure; SameSite=None")
    }
}

/// Attach a `Set-Cookie` header to a response.
fn with_cookie(mut response: Response, cookie: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

/// Verify that the submission carries the session cookie for its transaction.
fn check_session_cookie(headers: &HeaderMap, txn_id: &str) -> Result<()> {
    let expected_name = storage_key(txn_id);

    let cookies = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    for pair in cookies.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if name == expected_name && value == txn_id {
                return Ok(());
            }
        }
    }

    warn!("Consent submission without a matching session cookie");
    Err(Error::ConsentForgery)
}
