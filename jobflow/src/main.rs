use anyhow::Context;
use serde_json::{Map, Value};
use tracing::{info, warn};

use jobflow::logging::{self, LoggingConfig};
use jobflow::{AutomationSystem, EngineConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env().context("invalid configuration")?;

    // Keep the guard alive until exit so buffered file output is flushed
    let (logging_config, _guard): (Arc<LoggingConfig>, _) =
        logging::init_logging(&config.log_dir).context("failed to initialize logging")?;
    logging::install_panic_hook(logging_config.log_dir());

    let log_cleanup_token = CancellationToken::new();
    logging_config.start_retention_cleanup(log_cleanup_token.clone());

    info!("jobflow v{} starting", env!("CARGO_PKG_VERSION"));

    let system = AutomationSystem::builder(config)
        .register_function("echo", |params: Map<String, Value>| async move {
            Ok::<_, anyhow::Error>(Value::Object(params))
        })
        .start()
        .await
        .context("failed to start automation system")?;

    shutdown_signal().await;
    info!("Shutdown signal received");

    log_cleanup_token.cancel();
    if let Err(e) = system.shutdown().await {
        warn!("Shutdown finished with error: {}", e);
    }

    info!("jobflow stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
