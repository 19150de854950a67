//! MCP OAuth Broker - OAuth 2.0 Authorization Code + PKCE broker
//!
//! Sits between MCP tool clients and an upstream OIDC identity provider.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcp_oauth_broker::{
    broker::{Broker, server},
    cli::{Cli, Command},
    config::Config,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Load the configuration with CLI overrides applied.
fn load_config(cli: &Cli) -> Result<Config, ExitCode> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Ok(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            Err(ExitCode::FAILURE)
        }
    }
}

/// Validate the configuration and exit
fn run_check_config(cli: &Cli) -> ExitCode {
    match load_config(cli) {
        Ok(config) => {
            println!(
                "Configuration OK: issuer={}, clients={}",
                config.upstream.issuer_url,
                config.clients.len()
            );
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}

/// Run the broker server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(code) => return code,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        issuer = %config.upstream.issuer_url,
        clients = config.clients.len(),
        "Starting MCP OAuth Broker"
    );

    let broker = match Broker::new(config) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to create broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = server::run(broker).await {
        error!("Broker error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
