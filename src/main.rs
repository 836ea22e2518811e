//! # courier
//!
//! Runs a message-stream supervisor over the line-delimited JSON transport
//! with a built-in ping/echo handler.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use courier_core::messages::ProcessedMessage;
use courier_core::security::env_vars;
use courier_settings::CourierSettings;
use courier_supervisor::{
    handler_fn, HandlerResult, MessageHandler, StreamSupervisor, SupervisorConfig,
};
use courier_telemetry::{init_telemetry, spawn_reporter, TelemetryConfig};
use courier_transport::StdioTransport;

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Message-stream supervisor.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Message-stream supervisor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise stdin as a message stream, replying on stdout.
    Run(RunArgs),
    /// Print the effective settings.
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Settings file (defaults to ~/.courier/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Emit JSON logs regardless of settings.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Settings file (defaults to ~/.courier/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn load(path: Option<&PathBuf>) -> Result<CourierSettings> {
    let path = path.cloned().unwrap_or_else(courier_settings::settings_path);
    courier_settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))
}

/// "ping" → "pong", anything else is echoed back.
fn reply_for(content: &str) -> String {
    if content.trim().eq_ignore_ascii_case("ping") {
        "pong".to_string()
    } else {
        format!("echo: {content}")
    }
}

fn builtin_handler() -> Arc<dyn MessageHandler> {
    Arc::new(handler_fn(|m: ProcessedMessage| async move {
        tracing::debug!(sender = %m.sender_address, "handling message");
        HandlerResult::Ok(Some(reply_for(&m.content)))
    }))
}

async fn run(args: RunArgs) -> Result<()> {
    let settings = load(args.settings.as_ref())?;

    let logging = &settings.logging;
    let telemetry = init_telemetry(&TelemetryConfig::from_levels(
        &logging.level,
        logging
            .module_levels
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        logging.json || args.json_logs,
    ));
    let metrics = telemetry.metrics();

    let mut config = SupervisorConfig::from_settings(&settings);
    // the stdio transport never looks at the keys
    if config.transport.identity_key.is_none() {
        tracing::warn!(var = env_vars::IDENTITY_KEY, "not set, using a local placeholder");
        config.transport.identity_key = Some(SecretString::from("stdio-local"));
    }
    if config.transport.encryption_key.is_none() {
        tracing::warn!(var = env_vars::ENCRYPTION_KEY, "not set, using a local placeholder");
        config.transport.encryption_key = Some(SecretString::from("stdio-local"));
    }

    let transport = StdioTransport::new();
    let supervisor = StreamSupervisor::new(config, builtin_handler())
        .with_metrics(Arc::clone(&metrics))
        .on_failure(|e| tracing::warn!(kind = e.error_kind(), "stream supervisor restarting"));
    let handle = supervisor
        .start(&transport)
        .await
        .context("failed to start supervisor")?;

    let reporter_cancel = CancellationToken::new();
    let reporter = spawn_reporter(metrics, METRICS_REPORT_INTERVAL, reporter_cancel.clone());

    tracing::info!(supervisor_id = %handle.id(), "courier ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    let clean = handle.stop().await;
    reporter_cancel.cancel();
    let _ = reporter.await;

    tracing::info!(clean, status = ?handle.status(), "shutdown complete");
    Ok(())
}

fn print_config(args: ConfigArgs) -> Result<()> {
    let settings = load(args.settings.as_ref())?;
    let secret_state = |var: &str| match std::env::var(var) {
        Ok(v) if !v.is_empty() => "set",
        _ => "unset",
    };
    let report = serde_json::json!({
        "settings": settings,
        "secrets": {
            (env_vars::IDENTITY_KEY): secret_state(env_vars::IDENTITY_KEY),
            (env_vars::ENCRYPTION_KEY): secret_state(env_vars::ENCRYPTION_KEY),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Config(args) => print_config(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_run_defaults() {
        let cli = Cli::parse_from(["courier", "run"]);
        match cli.command {
            Command::Run(args) => {
                assert!(args.settings.is_none());
                assert!(!args.json_logs);
            }
            Command::Config(_) => panic!("expected run"),
        }
    }

    #[test]
    fn cli_run_flags() {
        let cli = Cli::parse_from(["courier", "run", "--settings", "/tmp/s.json", "--json-logs"]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.settings, Some(PathBuf::from("/tmp/s.json")));
                assert!(args.json_logs);
            }
            Command::Config(_) => panic!("expected run"),
        }
    }

    #[test]
    fn cli_config_subcommand() {
        let cli = Cli::parse_from(["courier", "config"]);
        assert!(matches!(cli.command, Command::Config(_)));
    }

    #[test]
    fn builtin_replies() {
        assert_eq!(reply_for("ping"), "pong");
        assert_eq!(reply_for(" PING\n"), "pong");
        assert_eq!(reply_for("hello"), "echo: hello");
    }
}
