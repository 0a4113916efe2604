//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the OPC-DA connector daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use r_ems_common::config::AppConfig;
use r_ems_common::logging::{init_tracing, LogFormat};
use r_ems_common::time::duration_to_millis;
use r_ems_opcda::session;
use r_ems_opcda::{new_registry, ConnectorBuilder, ConnectorMetrics, TracingSink};
use tokio::signal;
use tracing::{info, warn};

mod exporter;

use exporter::spawn_http_server;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("R-EMS OPC-DA connector ", env!("CARGO_PKG_VERSION")),
    about = "R-EMS OPC-DA connector daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured log format")]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the connector until interrupted")]
    Run,
    #[command(about = "Validate the configuration and print the device summary")]
    CheckConfig,
}

fn config_candidates(cli: &Cli) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/opcda.toml"));
    candidates.push(PathBuf::from("configs/opcda.example.toml"));
    candidates
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = AppConfig::load_with_source(&config_candidates(&cli))?;
    let mut config = loaded.config;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("r-ems-opcdad", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config).await?
        }
        Commands::CheckConfig => check_config(&config, &loaded.source)?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let metrics = ConnectorMetrics::new(registry.clone())?;
    let session = session::from_kind(config.connector.server.session);
    let connector = ConnectorBuilder::new(config.connector.clone(), session, Arc::new(TracingSink))
        .with_metrics(metrics)
        .build()?;
    let handle = connector.start();

    let exporter = if config.metrics.enabled {
        Some(spawn_http_server(
            registry,
            handle.status_probe(),
            config.metrics.listen,
        )?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    info!(
        connector = %config.connector.name,
        session = ?config.connector.server.session,
        "daemon running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    if !handle.shutdown().await {
        warn!("connector did not stop cleanly");
    }

    if let Some(server) = exporter {
        server.shutdown().await?;
    }
    Ok(())
}

fn check_config(config: &AppConfig, source: &std::path::Path) -> Result<()> {
    let connector = ConnectorBuilder::new(
        config.connector.clone(),
        session::from_kind(config.connector.server.session),
        Arc::new(TracingSink),
    )
    .build()?;

    let devices: Vec<_> = connector
        .devices()
        .map(|device| {
            serde_json::json!({
                "name": device.name(),
                "profile": device.profile(),
                "tags": device.tag_paths(),
            })
        })
        .collect();
    let summary = serde_json::json!({
        "source": source.display().to_string(),
        "connector": connector.name(),
        "server": config.connector.server.name,
        "host": config.connector.server.host,
        "poll_period_ms": duration_to_millis(config.connector.server.poll_period),
        "devices": devices,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run_without_subcommand() {
        let cli = Cli::try_parse_from(["r-ems-opcdad"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(config_candidates(&cli).len(), 2);
    }

    #[test]
    fn parses_config_and_log_format() {
        let cli = Cli::try_parse_from([
            "r-ems-opcdad",
            "--config",
            "site.toml",
            "--log-format",
            "pretty",
            "check-config",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert!(matches!(cli.log_format, Some(CliLogFormat::Pretty)));
        assert_eq!(config_candidates(&cli)[0], PathBuf::from("site.toml"));
    }
}
