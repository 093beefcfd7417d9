//! One socket bound to an application context.
//!
//! Inbound messages are dispatched synchronously on the read task. Outbound
//! updates queued on the context are written by [`Connection::flush`], which
//! borrows one pool buffer, packs as many whole frames into it as fit, and
//! writes it with a deadline. Writes are serialized by the writer lock, so a
//! connection never holds more than one buffer.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use beach_pier_core::{encode_frame, BufferPool, Frame, WireError, HEARTBEAT_FRAME};
use bytes::Bytes;
use futures_util::{stream::SplitSink, SinkExt};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{error::ProtocolError, Error as WsError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PierConfig;
use crate::context::ApplicationContext;
use crate::dispatch::{self, DispatchError};
use crate::heartbeat;
use crate::manager::ApplicationManager;

/// Bytes of an inbound payload included in log lines.
const LOG_PAYLOAD_BYTES: usize = 64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote connection is closed")]
    Closed,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Write half of a socket.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.inner
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(classify_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.inner.send(Message::Close(None)).await;
        self.inner.close().await.map_err(classify_ws_error)
    }
}

fn classify_ws_error(err: axum::Error) -> TransportError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(ws) = cause.downcast_ref::<WsError>() {
            if matches!(
                ws,
                WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
            ) {
                return TransportError::Closed;
            }
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ) {
                return TransportError::Closed;
            }
        }
        source = cause.source();
    }
    TransportError::Failed(err.to_string())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlushError {
    #[error("application context {session_id} is destroyed")]
    ContextDestroyed { session_id: Uuid },
}

/// What a flush did. Only a destroyed context is reported as an error; every
/// other failure is logged and the connection stays usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Sent { bytes: usize, frames: usize },
    Empty,
    SocketClosed,
    PoolExhausted { dropped: usize },
    TimedOut,
    TransportFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Open,
    Closed,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Connecting,
            1 => Phase::Open,
            _ => Phase::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Heartbeat,
    Dispatched,
    /// Ignored because the context is destroyed.
    Dropped,
    /// Oversized, malformed or refused by the application.
    Rejected,
}

pub trait ConnectionListener: Send + Sync {
    fn on_close(&self, connection_id: Uuid);
}

pub struct Connection<S> {
    id: Uuid,
    context: Arc<ApplicationContext>,
    manager: Arc<dyn ApplicationManager>,
    pool: BufferPool,
    config: Arc<PierConfig>,
    phase: AtomicU8,
    closing: AtomicBool,
    listener: parking_lot::Mutex<Option<Arc<dyn ConnectionListener>>>,
    sink: Mutex<S>,
}

impl<S: FrameSink> Connection<S> {
    pub fn new(
        id: Uuid,
        context: Arc<ApplicationContext>,
        manager: Arc<dyn ApplicationManager>,
        pool: BufferPool,
        config: Arc<PierConfig>,
        sink: S,
    ) -> Self {
        Self {
            id,
            context,
            manager,
            pool,
            config,
            phase: AtomicU8::new(Phase::Connecting as u8),
            closing: AtomicBool::new(false),
            listener: parking_lot::Mutex::new(None),
            sink: Mutex::new(sink),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &Arc<ApplicationContext> {
        &self.context
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Moves a connecting socket to open. Returns `false` if it was already
    /// open or closed.
    pub fn open(&self) -> bool {
        let opened = self
            .phase
            .compare_exchange(
                Phase::Connecting as u8,
                Phase::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if opened {
            counter!("beach_pier_connections_opened_total", 1);
            debug!(
                session_id = %self.context.session_id(),
                connection_id = %self.id,
                "connection open"
            );
        }
        opened
    }

    pub fn on_text(&self, text: &str) -> InboundOutcome {
        if let Some(outcome) = self.admit() {
            return outcome;
        }
        if heartbeat::is_heartbeat_text(text) {
            counter!("beach_pier_heartbeats_received_total", 1);
            debug!(
                session_id = %self.context.session_id(),
                connection_id = %self.id,
                "heartbeat received"
            );
            return InboundOutcome::Heartbeat;
        }

        debug!(
            session_id = %self.context.session_id(),
            connection_id = %self.id,
            payload = %text,
            "text message received"
        );
        let result = dispatch::dispatch_text(&self.context, self.manager.as_ref(), text);
        self.finish_dispatch(result.map(|_| ()), || text.to_string())
    }

    pub fn on_binary(&self, bytes: &[u8]) -> InboundOutcome {
        if let Some(outcome) = self.admit() {
            return outcome;
        }
        if heartbeat::is_heartbeat_frame(bytes) {
            counter!("beach_pier_heartbeats_received_total", 1);
            return InboundOutcome::Heartbeat;
        }
        if bytes.len() > self.config.max_inbound_frame_bytes {
            counter!("beach_pier_inbound_rejected_total", 1, "reason" => "oversized");
            warn!(
                session_id = %self.context.session_id(),
                connection_id = %self.id,
                bytes = bytes.len(),
                limit = self.config.max_inbound_frame_bytes,
                "inbound frame exceeds size limit; dropped"
            );
            return InboundOutcome::Rejected;
        }

        histogram!("beach_pier_inbound_frame_bytes", bytes.len() as f64);
        let result = dispatch::dispatch_binary(&self.context, self.manager.as_ref(), bytes);
        self.finish_dispatch(result.map(|_| ()), || {
            hex::encode(&bytes[..bytes.len().min(LOG_PAYLOAD_BYTES)])
        })
    }

    fn admit(&self) -> Option<InboundOutcome> {
        if self.context.is_destroyed() {
            info!(
                session_id = %self.context.session_id(),
                connection_id = %self.id,
                "message dropped; application context is destroyed"
            );
            return Some(InboundOutcome::Dropped);
        }
        self.context.notify_message_received();
        None
    }

    fn finish_dispatch(
        &self,
        result: Result<(), DispatchError>,
        payload: impl FnOnce() -> String,
    ) -> InboundOutcome {
        match result {
            Ok(()) => InboundOutcome::Dispatched,
            Err(err) => {
                counter!(
                    "beach_pier_inbound_rejected_total",
                    1,
                    "reason" => err.metric_label()
                );
                error!(
                    session_id = %self.context.session_id(),
                    connection_id = %self.id,
                    error = %err,
                    payload = %payload(),
                    "cannot process message from the terminal"
                );
                InboundOutcome::Rejected
            }
        }
    }

    /// Writes every queued update to the socket.
    pub async fn flush(&self) -> Result<FlushOutcome, FlushError> {
        self.ensure_live()?;
        let mut sink = self.sink.lock().await;
        if !self.is_open() {
            debug!(
                session_id = %self.context.session_id(),
                connection_id = %self.id,
                pending = self.context.pending_len(),
                "socket not open; flush deferred"
            );
            return Ok(FlushOutcome::SocketClosed);
        }

        let frames = self.context.take_pending();
        if frames.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let mut buffer = match self.pool.acquire().await {
            Ok(buffer) => buffer,
            Err(err) => {
                counter!(
                    "beach_pier_flush_dropped_total",
                    1,
                    "reason" => err.metric_label()
                );
                warn!(
                    session_id = %self.context.session_id(),
                    connection_id = %self.id,
                    error = %err,
                    dropped = frames.len(),
                    "no outbound buffer available; updates dropped"
                );
                return Ok(FlushOutcome::PoolExhausted {
                    dropped: frames.len(),
                });
            }
        };

        let mut sent_bytes = 0usize;
        let mut sent_frames = 0usize;
        let mut batched = 0usize;
        let mut batch_start = 0usize;
        for (index, frame) in frames.iter().enumerate() {
            match encode_frame(&mut buffer, frame) {
                Ok(_) => batched += 1,
                Err(WireError::BufferFull { .. }) if !buffer.is_empty() => {
                    let bytes = Bytes::copy_from_slice(buffer.as_slice());
                    buffer.clear();
                    match self.write(&mut *sink, bytes).await {
                        Ok(written) => {
                            sent_bytes += written;
                            sent_frames += batched;
                            batched = 0;
                            batch_start = index;
                        }
                        Err(outcome) => return Ok(self.unsent(outcome, &frames[batch_start..])),
                    }
                    match encode_frame(&mut buffer, frame) {
                        Ok(_) => batched = 1,
                        Err(err) => self.drop_frame(&err),
                    }
                }
                Err(err) => self.drop_frame(&err),
            }
        }

        if !buffer.is_empty() {
            let bytes = Bytes::copy_from_slice(buffer.as_slice());
            buffer.clear();
            match self.write(&mut *sink, bytes).await {
                Ok(written) => {
                    sent_bytes += written;
                    sent_frames += batched;
                }
                Err(outcome) => return Ok(self.unsent(outcome, &frames[batch_start..])),
            }
        }

        if sent_frames == 0 {
            return Ok(FlushOutcome::Empty);
        }
        Ok(FlushOutcome::Sent {
            bytes: sent_bytes,
            frames: sent_frames,
        })
    }

    /// Writes the two-byte heartbeat frame.
    pub async fn send_heartbeat(&self) -> Result<FlushOutcome, FlushError> {
        self.ensure_live()?;
        let mut sink = self.sink.lock().await;
        if !self.is_open() {
            return Ok(FlushOutcome::SocketClosed);
        }
        match self
            .write(&mut *sink, Bytes::from_static(&HEARTBEAT_FRAME))
            .await
        {
            Ok(bytes) => {
                counter!("beach_pier_heartbeats_sent_total", 1);
                Ok(FlushOutcome::Sent { bytes, frames: 1 })
            }
            Err(outcome) => Ok(outcome),
        }
    }

    /// Closes the socket once. Queued updates stay on the context for the
    /// next socket bound to it.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.phase.store(Phase::Closed as u8, Ordering::Release);
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.on_close(self.id);
        }

        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.config.write_timeout, sink.close()).await {
            Ok(Ok(())) | Ok(Err(TransportError::Closed)) => {}
            Ok(Err(err)) => debug!(
                session_id = %self.context.session_id(),
                connection_id = %self.id,
                error = %err,
                "socket close failed"
            ),
            Err(_) => debug!(
                session_id = %self.context.session_id(),
                connection_id = %self.id,
                "socket close timed out"
            ),
        }
        counter!("beach_pier_connections_closed_total", 1);
        info!(
            session_id = %self.context.session_id(),
            connection_id = %self.id,
            pending = self.context.pending_len(),
            "connection closed"
        );
    }

    fn ensure_live(&self) -> Result<(), FlushError> {
        if self.context.is_destroyed() {
            return Err(FlushError::ContextDestroyed {
                session_id: self.context.session_id(),
            });
        }
        Ok(())
    }

    /// Frames a closed remote never received go back to the front of the
    /// context queue for the next socket.
    fn unsent(&self, outcome: FlushOutcome, frames: &[Frame]) -> FlushOutcome {
        if outcome == FlushOutcome::SocketClosed {
            self.context.requeue_front(frames.to_vec());
        }
        outcome
    }

    fn drop_frame(&self, err: &WireError) {
        counter!(
            "beach_pier_frames_dropped_total",
            1,
            "reason" => err.metric_label()
        );
        warn!(
            session_id = %self.context.session_id(),
            connection_id = %self.id,
            error = %err,
            "frame cannot be encoded; dropped"
        );
    }

    async fn write(&self, sink: &mut S, bytes: Bytes) -> Result<usize, FlushOutcome> {
        let len = bytes.len();
        let started = Instant::now();
        match tokio::time::timeout(self.config.write_timeout, sink.send(bytes)).await {
            Ok(Ok(())) => {
                histogram!("beach_pier_write_bytes", len as f64);
                histogram!(
                    "beach_pier_write_duration_ms",
                    started.elapsed().as_secs_f64() * 1000.0
                );
                Ok(len)
            }
            Ok(Err(TransportError::Closed)) => {
                self.phase.store(Phase::Closed as u8, Ordering::Release);
                counter!("beach_pier_write_failures_total", 1, "reason" => "closed");
                info!(
                    session_id = %self.context.session_id(),
                    connection_id = %self.id,
                    "remote connection is closed; updates kept for the next socket"
                );
                Err(FlushOutcome::SocketClosed)
            }
            Ok(Err(err)) => {
                counter!("beach_pier_write_failures_total", 1, "reason" => "transport");
                error!(
                    session_id = %self.context.session_id(),
                    connection_id = %self.id,
                    error = %err,
                    "cannot stream data"
                );
                Err(FlushOutcome::TransportFault)
            }
            Err(_) => {
                counter!("beach_pier_write_failures_total", 1, "reason" => "timeout");
                error!(
                    session_id = %self.context.session_id(),
                    connection_id = %self.id,
                    timeout_ms = self.config.write_timeout.as_millis() as u64,
                    "write deadline exceeded; data dropped"
                );
                Err(FlushOutcome::TimedOut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StartKind;
    use crate::manager::Instruction;
    use beach_pier_core::{decode_records, Frame, ServerToClientModel, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelSink {
        tx: mpsc::UnboundedSender<Bytes>,
        stall: Option<Duration>,
        fail_closed: bool,
    }

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if self.fail_closed {
                return Err(TransportError::Closed);
            }
            self.tx.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingManager {
        texts: AtomicUsize,
    }

    impl ApplicationManager for CountingManager {
        fn start_application(
            &self,
            _context: &Arc<ApplicationContext>,
            _kind: StartKind,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn process_instruction(
            &self,
            _context: &Arc<ApplicationContext>,
            instruction: Instruction<'_, '_>,
        ) -> anyhow::Result<()> {
            if let Instruction::Text(_) = instruction {
                self.texts.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct Harness {
        connection: Connection<ChannelSink>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        pool: BufferPool,
        manager: Arc<CountingManager>,
    }

    fn harness(config: PierConfig, stall: Option<Duration>, fail_closed: bool) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = BufferPool::new(config.pool_size, config.buffer_capacity, config.acquire_timeout);
        let manager = Arc::new(CountingManager::default());
        let context = Arc::new(ApplicationContext::new(Uuid::new_v4()));
        let connection = Connection::new(
            Uuid::new_v4(),
            context,
            manager.clone(),
            pool.clone(),
            Arc::new(config),
            ChannelSink {
                tx,
                stall,
                fail_closed,
            },
        );
        connection.open();
        Harness {
            connection,
            rx,
            pool,
            manager,
        }
    }

    fn small_config() -> PierConfig {
        PierConfig {
            pool_size: 2,
            buffer_capacity: 64,
            acquire_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(200),
            ..PierConfig::default()
        }
    }

    fn index_frame(value: i32) -> Frame {
        Frame::new().with(ServerToClientModel::Index, value)
    }

    #[test_timeout::tokio_timeout_test]
    async fn flush_packs_queued_frames_into_one_write() {
        let mut h = harness(small_config(), None, false);
        h.connection.context().save_update(index_frame(1));
        h.connection.context().save_update(index_frame(2));

        let outcome = h.connection.flush().await.expect("flush");

        assert_eq!(outcome, FlushOutcome::Sent { bytes: 12, frames: 2 });
        let bytes = h.rx.recv().await.expect("write");
        let records = decode_records::<ServerToClientModel>(&bytes).expect("decode");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, Value::Integer(2));
        assert_eq!(h.pool.available(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn overflowing_frames_spill_into_a_second_write() {
        let mut h = harness(small_config(), None, false);
        for value in 0..11 {
            h.connection.context().save_update(index_frame(value));
        }

        let outcome = h.connection.flush().await.expect("flush");

        assert_eq!(outcome, FlushOutcome::Sent { bytes: 66, frames: 11 });
        let first = h.rx.recv().await.expect("first write");
        let second = h.rx.recv().await.expect("second write");
        assert_eq!(first.len(), 60);
        assert_eq!(second.len(), 6);
        assert_eq!(h.pool.available(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn frame_larger_than_a_buffer_is_dropped() {
        let mut h = harness(small_config(), None, false);
        let huge = "x".repeat(128);
        h.connection
            .context()
            .save_update(Frame::new().with(ServerToClientModel::Text, huge.as_str()));
        h.connection.context().save_update(index_frame(7));

        let outcome = h.connection.flush().await.expect("flush");

        assert_eq!(outcome, FlushOutcome::Sent { bytes: 6, frames: 1 });
        let bytes = h.rx.recv().await.expect("write");
        assert_eq!(bytes.len(), 6);
    }

    #[test_timeout::tokio_timeout_test]
    async fn flush_with_nothing_queued_writes_nothing() {
        let mut h = harness(small_config(), None, false);
        assert_eq!(h.connection.flush().await.expect("flush"), FlushOutcome::Empty);
        assert!(h.rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn destroyed_context_refuses_flush_without_borrowing() {
        let mut h = harness(small_config(), None, false);
        h.connection.context().save_update(index_frame(1));
        h.connection.context().destroy();

        let err = h.connection.flush().await.expect_err("destroyed");

        assert!(matches!(err, FlushError::ContextDestroyed { .. }));
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.pool.available(), 2);
        assert!(h.connection.send_heartbeat().await.is_err());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn write_timeout_returns_buffer_and_keeps_connection_open() {
        let config = PierConfig {
            write_timeout: Duration::from_millis(50),
            ..small_config()
        };
        let h = harness(config, Some(Duration::from_millis(500)), false);
        h.connection.context().save_update(index_frame(1));

        let outcome = h.connection.flush().await.expect("timeout is not an error");

        assert_eq!(outcome, FlushOutcome::TimedOut);
        assert_eq!(h.pool.available(), 2);
        assert!(h.connection.is_open());
        let buffer = h.pool.try_acquire().expect("buffer back in pool");
        assert_eq!(buffer.position(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_remote_closes_and_keeps_updates_queued() {
        struct Flag(AtomicUsize);
        impl ConnectionListener for Flag {
            fn on_close(&self, _connection_id: Uuid) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let h = harness(small_config(), None, true);
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        h.connection.set_listener(flag.clone());
        h.connection.context().save_update(index_frame(1));
        h.connection.context().save_update(index_frame(2));

        let outcome = h.connection.flush().await.expect("closed remote");

        assert_eq!(outcome, FlushOutcome::SocketClosed);
        assert_eq!(h.connection.phase(), Phase::Closed);
        assert_eq!(h.pool.available(), 2);
        assert_eq!(h.connection.context().pending_len(), 2);

        h.connection.context().save_update(index_frame(3));
        assert_eq!(
            h.connection.flush().await.expect("flush"),
            FlushOutcome::SocketClosed
        );
        assert_eq!(
            h.connection.send_heartbeat().await.expect("heartbeat"),
            FlushOutcome::SocketClosed
        );
        let queued: Vec<Frame> = h.connection.context().take_pending();
        assert_eq!(queued, vec![index_frame(1), index_frame(2), index_frame(3)]);

        h.connection.close().await;
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::timeout]
    fn closed_socket_errors_are_recognised_by_variant() {
        for err in [
            WsError::ConnectionClosed,
            WsError::AlreadyClosed,
            WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
            WsError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
        ] {
            let label = err.to_string();
            assert!(
                matches!(classify_ws_error(axum::Error::new(err)), TransportError::Closed),
                "{label}"
            );
        }

        let other = WsError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(matches!(
            classify_ws_error(axum::Error::new(other)),
            TransportError::Failed(_)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn exhausted_pool_drops_the_flush() {
        let h = harness(small_config(), None, false);
        let _a = h.pool.acquire().await.expect("a");
        let _b = h.pool.acquire().await.expect("b");
        h.connection.context().save_update(index_frame(1));

        let outcome = h.connection.flush().await.expect("exhausted is not an error");

        assert_eq!(outcome, FlushOutcome::PoolExhausted { dropped: 1 });
        assert!(h.connection.is_open());
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_socket_keeps_updates_queued() {
        let h = harness(small_config(), None, false);
        h.connection.close().await;
        h.connection.context().save_update(index_frame(1));

        assert_eq!(
            h.connection.flush().await.expect("flush"),
            FlushOutcome::SocketClosed
        );
        assert_eq!(h.connection.context().pending_len(), 1);
        assert_eq!(h.connection.phase(), Phase::Closed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn heartbeat_writes_two_bytes() {
        let mut h = harness(small_config(), None, false);
        let outcome = h.connection.send_heartbeat().await.expect("heartbeat");
        assert_eq!(outcome, FlushOutcome::Sent { bytes: 2, frames: 1 });
        assert_eq!(h.rx.recv().await.expect("write").as_ref(), &HEARTBEAT_FRAME);
    }

    #[test_timeout::tokio_timeout_test]
    async fn heartbeat_text_is_never_dispatched() {
        let h = harness(small_config(), None, false);
        assert_eq!(h.connection.on_text("0"), InboundOutcome::Heartbeat);
        assert_eq!(h.connection.on_text("00"), InboundOutcome::Dispatched);
        assert_eq!(h.manager.texts.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn oversized_binary_is_rejected() {
        let config = PierConfig {
            max_inbound_frame_bytes: 4,
            ..small_config()
        };
        let h = harness(config, None, false);
        assert_eq!(h.connection.on_binary(&[0u8; 16]), InboundOutcome::Rejected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn destroyed_context_drops_inbound() {
        let h = harness(small_config(), None, false);
        h.connection.context().destroy();
        assert_eq!(h.connection.on_text("hello"), InboundOutcome::Dropped);
        assert_eq!(h.manager.texts.load(Ordering::SeqCst), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_notifies_listener_once() {
        struct Flag(AtomicUsize);
        impl ConnectionListener for Flag {
            fn on_close(&self, _connection_id: Uuid) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let h = harness(small_config(), None, false);
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        h.connection.set_listener(flag.clone());
        h.connection.close().await;
        h.connection.close().await;
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);
    }
}
