//! Trade-guard risk service
//!
//! Loads configuration, initializes tracing, starts the alert notifier and
//! runs the [`RiskEngine`](tg_service::RiskEngine).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tg_core::alert::{ChannelAlertSink, LogAlertSink};
use tg_core::config::AppConfig;
use tg_core::logging::{init_tracing, LogFormat};
use tg_core::types::SystemClock;
use tg_service::{forward_alerts, RiskEngine};

/// Trade-guard risk service
#[derive(Parser, Debug)]
#[command(name = "tg-service", about = "Trading risk controls and operator API")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit JSON logs instead of pretty output.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(LogFormat::from_flag(args.json_logs), "info")?;

    let config = AppConfig::load(args.config)?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        auto_reset_interval_ms = config.sweeps.auto_reset_interval_ms,
        "starting tg-service"
    );

    let cancel = CancellationToken::new();

    // Alerts are queued by the controls and written out by one notifier task.
    let (sink, alert_rx) = ChannelAlertSink::new(config.alerts.channel_capacity);
    let notifier = tokio::spawn(forward_alerts(alert_rx, &LogAlertSink, cancel.clone()));

    let engine = Arc::new(RiskEngine::build(config, Arc::new(SystemClock), Arc::new(sink))?);
    engine.run(cancel).await?;

    if let Err(e) = notifier.await {
        tracing::warn!(error = %e, "alert notifier task panicked");
    }
    Ok(())
}
