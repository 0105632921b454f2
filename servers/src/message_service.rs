//! # Message Service
//!
//! HTTP front of the chat write path. New messages are published on the
//! bus for the dispatcher, pushed into the recent-history cache and stored
//! in PostgreSQL; history reads are served cache-aside.

use anyhow::{Context, Result};
use lib_fanout::configs::load_config;
use lib_fanout::core::shutdown_signal;
use lib_fanout::loggers::setup_logging;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod health;
mod message_logic;

use message_logic::{handlers, state::MessageRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = load_config("MessageService").context("failed to load configuration")?;
    let _log_guard = setup_logging("message_service", &config.log_dir, &config.log_level, config.log_json)
        .context("failed to set up logging")?;
    info!(service_id = %config.service_id, port = config.port, "starting message service");

    let runtime = MessageRuntime::connect(config).await?;

    let listener = health::bind(runtime.config().port).await?;
    let http_stop = CancellationToken::new();
    let mut http = tokio::spawn(health::serve(
        listener,
        handlers::router(runtime.state.clone()),
        http_stop.clone(),
    ));

    let lifecycle = runtime.register().await?;

    let exited = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            http_stop.cancel();
            http.await
        }
        exited = &mut http => {
            warn!("http server exited before shutdown");
            exited
        }
    };
    health::report_exit(exited);

    runtime.drain(lifecycle).await;
    info!("shutdown complete");
    Ok(())
}
