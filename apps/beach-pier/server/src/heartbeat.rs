use std::sync::Arc;
use std::time::Duration;

use beach_pier_core::{ClientToServerModel, ModelKey, CLIENT_HEARTBEAT_TEXT};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::connection::{Connection, FlushOutcome, FrameSink};

/// True for the terminal's text keepalive.
pub fn is_heartbeat_text(text: &str) -> bool {
    text == CLIENT_HEARTBEAT_TEXT
}

/// True for a binary frame holding only the client heartbeat key.
pub fn is_heartbeat_frame(bytes: &[u8]) -> bool {
    bytes == &ClientToServerModel::Heartbeat.code().to_be_bytes()[..]
}

/// Sends a heartbeat every `interval` until the socket closes or its context
/// is destroyed. The first beat goes out one interval after the call.
pub fn spawn_heartbeat<S: FrameSink>(
    connection: Arc<Connection<S>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !connection.is_open() {
                break;
            }
            match connection.send_heartbeat().await {
                Ok(FlushOutcome::SocketClosed) => break,
                Ok(outcome) => {
                    debug!(
                        session_id = %connection.context().session_id(),
                        connection_id = %connection.id(),
                        ?outcome,
                        "heartbeat sent"
                    );
                }
                Err(err) => {
                    info!(
                        session_id = %connection.context().session_id(),
                        connection_id = %connection.id(),
                        error = %err,
                        "heartbeat stopped"
                    );
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn text_sentinel_is_exact() {
        assert!(is_heartbeat_text("0"));
        assert!(!is_heartbeat_text(" 0"));
        assert!(!is_heartbeat_text("0\n"));
        assert!(!is_heartbeat_text(""));
    }

    #[test_timeout::timeout]
    fn binary_heartbeat_is_bare_key() {
        assert!(is_heartbeat_frame(&[0, 0]));
        assert!(!is_heartbeat_frame(&[0, 0, 0]));
        assert!(!is_heartbeat_frame(&[0, 1]));
    }
}
