use std::sync::Arc;

use anyhow::Result;
use beach_pier_server::{telemetry::Telemetry, Cli, LoggingApplicationManager, ServerConfig};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        pool_size = config.pier.pool_size,
        buffer_capacity = config.pier.buffer_capacity,
        heartbeat_secs = config.pier.heartbeat_interval.as_secs(),
        "starting beach-pier server"
    );

    beach_pier_server::run(
        config,
        Arc::new(LoggingApplicationManager),
        telemetry.metrics_handle(),
    )
    .await
}
