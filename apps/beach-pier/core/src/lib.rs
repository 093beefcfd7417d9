//! Shared primitives for the Beach Pier channel: the direction-specific
//! model keys, the binary record codec and the process-wide buffer pool.
//!
//! Both the server and the terminal-side helpers depend on this crate so the
//! wire layout lives in exactly one place.

pub mod codec;
pub mod model;
pub mod pool;

pub use codec::{
    decode_records, encode_frame, encode_record, encode_to_vec, encoded_len, Reader, WireError,
    HEARTBEAT_FRAME,
};
pub use model::{
    ClientToServerModel, Frame, ModelKey, Record, ServerToClientModel, Value, ValueType,
    CLIENT_HEARTBEAT_TEXT,
};
pub use pool::{Buffer, BufferPool, PoolError, PooledBuffer};
