mod http;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use camgate_core::{logging, Config};
use camgate_record::{
    FinalizeRunner, LiveStreamHub, RecordingRegistry, RecordingSupervisor, RetentionSweep,
};

#[derive(Parser)]
#[command(name = "camgate", about = "Live media gateway with continuous segmented recording")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "CAMGATE_CONFIG", default_value = "camgate.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(Some(&args.config))?;

    // 2. Validate recording settings (fail fast, there are no sensible defaults)
    let settings = config.validate_record()?;

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(config_path = %args.config, "camgate starting");
    info!(
        base_path = %settings.base_path.display(),
        segment_duration = ?settings.segment_duration,
        num_segments = settings.num_segments,
        "recording configuration validated"
    );

    // 4. Build the stream hub, registry and supervisor
    let hub = Arc::new(LiveStreamHub::new());
    let registry = Arc::new(RecordingRegistry::new());
    let shutdown = CancellationToken::new();

    let supervisor = RecordingSupervisor::new(
        settings.clone(),
        Arc::clone(&hub),
        Arc::clone(&registry),
        shutdown.clone(),
    );
    let started = supervisor.start(&config.streams).await;
    info!(sessions = started, "recording sessions started");

    // 5. Background jobs: finalize runner and retention sweep
    if let Some(command) = settings.finalize_command.clone() {
        FinalizeRunner::new(command, settings.base_path.clone(), settings.segment_duration)
            .spawn(shutdown.clone());
    } else {
        info!("no finalize command configured, segments stay in raw form");
    }
    RetentionSweep::new(
        settings.base_path.clone(),
        settings.retention_window(),
        settings.sweep_interval,
    )
    .spawn(shutdown.clone());

    // 6. HTTP status endpoint
    let app = http::router(Arc::clone(&registry), args.config.clone());
    let http_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!(addr = %http_addr, "HTTP endpoint listening");
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("HTTP server failed: {e}");
        }
    });

    // 7. Run until interrupted, then tear the sessions down cleanly
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();
    registry.shutdown_all().await;
    info!("camgate stopped");

    Ok(())
}
