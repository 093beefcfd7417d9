use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

/// Process-wide channel settings. Built once at startup and shared with every
/// connection; nothing here is renegotiated per socket.
#[derive(Debug, Clone)]
pub struct PierConfig {
    /// Sockets with no inbound traffic for this long are closed, and detached
    /// contexts idle for this long are destroyed.
    pub idle_timeout: Duration,
    pub pool_size: usize,
    pub buffer_capacity: usize,
    pub acquire_timeout: Duration,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_inbound_frame_bytes: usize,
    pub recycle_interval: Duration,
}

impl Default for PierConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(1_000_000),
            pool_size: 50,
            buffer_capacity: 512_000,
            acquire_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(25),
            heartbeat_interval: Duration::from_secs(20),
            max_inbound_frame_bytes: 64 * 1024,
            recycle_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub pier: PierConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier-server",
    author,
    version,
    about = "Beach Pier binary terminal channel server"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "127.0.0.1:9550")]
    pub listen_addr: String,

    /// Idle timeout applied to sockets and detached contexts, in milliseconds.
    #[arg(long, env = "BEACH_PIER_IDLE_TIMEOUT_MS", default_value_t = 1_000_000)]
    pub idle_timeout_ms: u64,

    /// Number of outbound buffers allocated at startup.
    #[arg(long, env = "BEACH_PIER_POOL_SIZE", default_value_t = 50)]
    pub pool_size: usize,

    /// Capacity of every outbound buffer, in bytes.
    #[arg(long, env = "BEACH_PIER_BUFFER_CAPACITY", default_value_t = 512_000)]
    pub buffer_capacity: usize,

    /// Longest wait for a free buffer before a flush is skipped.
    #[arg(long, env = "BEACH_PIER_ACQUIRE_TIMEOUT_SECS", default_value_t = 5)]
    pub acquire_timeout_secs: u64,

    /// Deadline for a single socket write.
    #[arg(long, env = "BEACH_PIER_WRITE_TIMEOUT_SECS", default_value_t = 25)]
    pub write_timeout_secs: u64,

    /// Interval between server heartbeats.
    #[arg(long, env = "BEACH_PIER_HEARTBEAT_INTERVAL_SECS", default_value_t = 20)]
    pub heartbeat_interval_secs: u64,

    /// Inbound binary frames above this size are dropped.
    #[arg(long, env = "BEACH_PIER_MAX_INBOUND_FRAME_BYTES", default_value_t = 65_536)]
    pub max_inbound_frame_bytes: usize,

    /// How often detached contexts are checked for idleness.
    #[arg(long, env = "BEACH_PIER_RECYCLE_INTERVAL_SECS", default_value_t = 30)]
    pub recycle_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.pool_size == 0 {
            anyhow::bail!("pool size must be at least one buffer");
        }
        if cli.buffer_capacity < beach_pier_core::HEARTBEAT_FRAME.len() {
            anyhow::bail!("buffer capacity {} is too small", cli.buffer_capacity);
        }
        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            pier: PierConfig {
                idle_timeout: Duration::from_millis(cli.idle_timeout_ms),
                pool_size: cli.pool_size,
                buffer_capacity: cli.buffer_capacity,
                acquire_timeout: Duration::from_secs(cli.acquire_timeout_secs),
                write_timeout: Duration::from_secs(cli.write_timeout_secs),
                heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
                max_inbound_frame_bytes: cli.max_inbound_frame_bytes,
                recycle_interval: Duration::from_secs(cli.recycle_interval_secs),
            },
        })
    }
}
