//! Error types for the OAuth broker

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the broker
pub type Result<T> = std::result::Result<T, Error>;

/// Broker errors
///
/// The flow never retries automatically: authorization codes and nonces are
/// single-use, so every variant below is terminal for its flow instance. The
/// only recovery path is the user re-initiating `/authorize`.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed downstream authorization request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Downstream client id is not registered
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// Transaction expired, unknown, or already consumed (replay)
    #[error("Invalid or expired transaction: {0}")]
    Transaction(String),

    /// Consent token mismatch (CSRF signal)
    #[error("Consent token mismatch")]
    ConsentForgery,

    /// Upstream provider metadata discovery failed
    #[error("Upstream discovery failed: {0}")]
    Discovery(String),

    /// Authorization-code grant against the upstream provider failed
    #[error("Upstream token exchange failed: {0}")]
    TokenExchange(String),

    /// ID-token signature, claim, or nonce validation failed
    #[error("Invalid ID token: {0}")]
    InvalidIdToken(String),

    /// Refresh requested but no upstream refresh token was stored
    #[error("No upstream refresh token available")]
    NoRefreshToken,

    /// Upstream refresh-token grant failed; re-authentication is required
    #[error("Upstream refresh failed: {0}")]
    Refresh(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status the error surfaces as
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::UnknownClient(_) | Self::Transaction(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::ConsentForgery => StatusCode::FORBIDDEN,
            Self::Discovery(_)
            | Self::TokenExchange(_)
            | Self::InvalidIdToken(_)
            | Self::Refresh(_)
            | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::NoRefreshToken => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
