//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OAuth 2.0 broker for MCP tool clients
#[derive(Parser, Debug)]
#[command(name = "mcp-oauth-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_OAUTH_BROKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_OAUTH_BROKER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_OAUTH_BROKER_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MCP_OAUTH_BROKER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_OAUTH_BROKER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broker server (default)
    Serve,

    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::parse_from(["mcp-oauth-broker"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::parse_from([
            "mcp-oauth-broker",
            "--config",
            "broker.yaml",
            "--port",
            "9000",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config.unwrap(), PathBuf::from("broker.yaml"));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn parses_check_config_subcommand() {
        let cli = Cli::parse_from(["mcp-oauth-broker", "check-config"]);
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
    }
}
