//! # Dispatcher
//!
//! Consumes channel messages from the bus queue group and fans each one out
//! to the connectors holding its recipients' live connections.
//!
//! Startup connects the key-value store, the registry, the routing tables
//! and the bus, then registers the process. Ctrl-C or SIGTERM triggers the
//! drain sequence in `DispatchRuntime::drain`.

use anyhow::{Context, Result};
use lib_fanout::configs::load_config;
use lib_fanout::core::shutdown_signal;
use lib_fanout::loggers::setup_logging;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod dispatch_logic;
mod health;

use dispatch_logic::state::DispatchRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = load_config("Dispatcher").context("failed to load configuration")?;
    let _log_guard = setup_logging("dispatcher", &config.log_dir, &config.log_level, config.log_json)
        .context("failed to set up logging")?;
    info!(service_id = %config.service_id, bus = %config.bus_url, "starting dispatcher");

    let runtime = DispatchRuntime::connect(config).await?;
    let mut subscription = runtime.subscribe().await?;

    let listener = health::bind(runtime.config().port).await?;
    let http_stop = CancellationToken::new();
    let mut http = tokio::spawn(health::serve(listener, health::router(), http_stop.clone()));

    let lifecycle = runtime.register().await?;

    let stop_consuming = CancellationToken::new();
    let consumer = {
        let dispatcher = runtime.dispatcher.clone();
        let stop = stop_consuming.clone();
        tokio::spawn(async move { dispatcher.run(&mut subscription, stop).await })
    };

    let http_exited = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        exited = &mut http => {
            warn!("http server exited before shutdown");
            Some(exited)
        }
    };

    runtime.drain(consumer, stop_consuming, lifecycle).await;

    http_stop.cancel();
    let exited = match http_exited {
        Some(exited) => exited,
        None => http.await,
    };
    health::report_exit(exited);

    info!("shutdown complete");
    Ok(())
}
