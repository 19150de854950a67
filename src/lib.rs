//! MCP OAuth Broker Library
//!
//! OAuth 2.0 Authorization Code + PKCE broker between MCP tool clients and an
//! upstream OIDC identity provider.
//!
//! # Flow
//!
//! - **`/authorize`**: validates the downstream request against the client
//!   registry and opens a single-use transaction with its own PKCE pair,
//!   nonce, and consent token
//! - **Consent**: the user approves or denies on a rendered page; approval
//!   hands the browser to the provider with the broker's PKCE challenge
//! - **`/callback`**: exchanges the provider's code, validates the ID token
//!   against the transaction nonce, and redirects back to the client with a
//!   freshly minted downstream authorization code
//! - **Token exchange**: downstream grants pass through the upstream token
//!   lifetime; refresh grants re-validate identity before replacing anything

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod cli;
pub mod config;
pub mod consent;
pub mod error;
pub mod grant;
pub mod pkce;
pub mod token_exchange;
pub mod txn;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
