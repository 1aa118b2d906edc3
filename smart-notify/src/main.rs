use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use smart_notify::config::AppConfig;
use smart_notify::intelligence::{IntelligenceEngine, SysinfoProbe};
use smart_notify::logging::init_logging;
use smart_notify::notification::{
    AlertType, ChannelConfig, Context, EscalationManager, MultiChannelNotifier,
    NotificationTransport, SmartNotificationManager,
};

const DEFAULT_CONFIG_PATH: &str = "smart-notify.json";

/// One line of input: `{"alert_type": "thermal", "data": {"temperature": 91}}`.
#[derive(Debug, Deserialize)]
struct AlertRequest {
    alert_type: AlertType,
    #[serde(default)]
    data: Context,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var("SMART_NOTIFY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = AppConfig::load(Some(&config_path))?;

    let (logging, _guard) = init_logging(&config.log_dir, config.log_format)?;
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.child_token());

    let transport = Arc::new(MultiChannelNotifier::new(
        config.channels.iter().map(ChannelConfig::build).collect(),
        config.circuit_breaker.clone(),
    ));
    if transport.enabled_channels().is_empty() {
        warn!("No notification channels enabled, deliveries will fail");
    }

    let manager = Arc::new(SmartNotificationManager::new(
        config.manager.clone(),
        transport.clone(),
    )?);
    let escalation = Arc::new(EscalationManager::new(
        config.effective_escalation(),
        transport.clone(),
    ));
    let engine = Arc::new(
        IntelligenceEngine::new(
            config.intelligence.clone(),
            Arc::clone(&manager),
            Some(Arc::clone(&escalation)),
        )?
        .with_probe(Arc::new(SysinfoProbe::new())),
    );

    manager.start();
    escalation.start();
    engine.start();
    info!(
        config = %config_path.display(),
        channels = transport.enabled_channels().len(),
        "smart-notify started, reading alerts from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&engine, &line).await,
                Ok(None) => {
                    info!("Input closed, shutting down");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read input, shutting down");
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    engine.stop();
    escalation.stop();
    manager.stop();

    let stats = manager.stats();
    info!(
        sent = stats.total_sent,
        failed = stats.total_failed,
        "smart-notify stopped"
    );
    Ok(())
}

async fn handle_line(engine: &Arc<IntelligenceEngine>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let request: AlertRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed alert request");
            return;
        }
    };

    match engine.process(request.alert_type, request.data).await {
        Ok(outcome) => info!(?outcome, "Alert processed"),
        Err(e) => warn!(error = %e, "Alert processing failed"),
    }
}
