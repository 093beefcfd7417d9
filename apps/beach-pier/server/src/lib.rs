//! Persistent binary channel between a terminal and its application context.
//!
//! The router in [`server`] upgrades `/ws` requests, resolves the terminal's
//! [`context::ApplicationContext`] and drives a [`connection::Connection`]
//! for the socket's lifetime.

pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod heartbeat;
pub mod manager;
pub mod scheduler;
pub mod server;
pub mod telemetry;

pub use config::{Cli, PierConfig, ServerConfig};
pub use connection::{
    Connection, ConnectionListener, FlushError, FlushOutcome, FrameSink, InboundOutcome, Phase,
    TransportError, WsSink,
};
pub use context::{ApplicationContext, ContextRegistry, ContextSnapshot, SchedulerKey, StartKind};
pub use dispatch::{dispatch_binary, dispatch_text, DispatchError, DispatchSummary};
pub use manager::{ApplicationManager, Instruction, LoggingApplicationManager};
pub use scheduler::{
    CommandHandle, CommandId, RepeatingCommand, ScheduleMode, Scheduler, SchedulerHandle,
    SchedulerHost, Tick, TickOutcome, WindowId,
};
pub use server::{router, run, AppState};
