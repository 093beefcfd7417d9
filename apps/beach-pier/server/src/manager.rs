use std::sync::Arc;

use beach_pier_core::{ClientToServerModel, Reader};
use tracing::info;

use crate::context::{ApplicationContext, StartKind};

/// Inbound payload handed to the application.
#[derive(Debug)]
pub enum Instruction<'a, 'b> {
    /// A text frame other than the heartbeat sentinel.
    Text(&'a str),
    /// A binary frame, positioned at the first record the channel did not
    /// consume itself.
    Binary(&'a mut Reader<'b, ClientToServerModel>),
}

/// The application living behind the channel. Both hooks run on the socket's
/// read task; errors and panics are logged and never close the socket.
pub trait ApplicationManager: Send + Sync + 'static {
    /// Called once per socket, after the context is resolved and before any
    /// inbound message is dispatched.
    fn start_application(
        &self,
        context: &Arc<ApplicationContext>,
        kind: StartKind,
    ) -> anyhow::Result<()>;

    fn process_instruction(
        &self,
        context: &Arc<ApplicationContext>,
        instruction: Instruction<'_, '_>,
    ) -> anyhow::Result<()>;
}

/// Application used by the standalone binary: logs what it receives.
#[derive(Debug, Default)]
pub struct LoggingApplicationManager;

impl ApplicationManager for LoggingApplicationManager {
    fn start_application(
        &self,
        context: &Arc<ApplicationContext>,
        kind: StartKind,
    ) -> anyhow::Result<()> {
        info!(
            session_id = %context.session_id(),
            reload = kind.is_reload(),
            "application started"
        );
        Ok(())
    }

    fn process_instruction(
        &self,
        context: &Arc<ApplicationContext>,
        instruction: Instruction<'_, '_>,
    ) -> anyhow::Result<()> {
        match instruction {
            Instruction::Text(text) => {
                info!(session_id = %context.session_id(), payload = %text, "text instruction");
            }
            Instruction::Binary(reader) => {
                let mut keys = Vec::new();
                while let Some(record) = reader.next_field()? {
                    keys.push(record.key);
                }
                info!(session_id = %context.session_id(), ?keys, "binary instruction");
            }
        }
        Ok(())
    }
}
