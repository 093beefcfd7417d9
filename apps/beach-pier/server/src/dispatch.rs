//! Routing of inbound messages to the scheduler or the application.
//!
//! A binary frame that opens with `HandlerKeyScheduler` carries a tick for a
//! repeating command and is consumed here; any other record hands the rest
//! of the frame to the application. Every failure, including a panic in
//! application code, is turned into a [`DispatchError`] for the caller to log.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use beach_pier_core::{ClientToServerModel, Reader, WireError};
use thiserror::Error;

use crate::context::ApplicationContext;
use crate::manager::{ApplicationManager, Instruction};
use crate::scheduler::{Tick, TickOutcome, WindowId};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),
    #[error("scheduler tick without a command id")]
    MissingCommandId,
    #[error("negative fix delay {0}")]
    InvalidDelay(i32),
    #[error("application failed: {0:#}")]
    Application(anyhow::Error),
    #[error("application panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DispatchError::Wire(err) => err.metric_label(),
            DispatchError::MissingCommandId => "missing_command_id",
            DispatchError::InvalidDelay(_) => "invalid_delay",
            DispatchError::Application(_) => "application_error",
            DispatchError::Panicked(_) => "application_panic",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub ticks: Vec<TickOutcome>,
    pub forwarded: bool,
}

pub fn dispatch_text(
    context: &Arc<ApplicationContext>,
    manager: &dyn ApplicationManager,
    text: &str,
) -> Result<(), DispatchError> {
    guarded(|| {
        manager
            .process_instruction(context, Instruction::Text(text))
            .map_err(DispatchError::Application)
    })
}

pub fn dispatch_binary(
    context: &Arc<ApplicationContext>,
    manager: &dyn ApplicationManager,
    bytes: &[u8],
) -> Result<DispatchSummary, DispatchError> {
    guarded(|| {
        let mut reader = Reader::<ClientToServerModel>::new(bytes);
        let mut summary = DispatchSummary::default();
        while let Some(record) = reader.next_field()? {
            if record.key == ClientToServerModel::HandlerKeyScheduler {
                let (window, tick) = read_tick(&mut reader)?;
                summary.ticks.push(context.scheduler(window).on_tick(tick));
                continue;
            }
            reader.rewind();
            manager
                .process_instruction(context, Instruction::Binary(&mut reader))
                .map_err(DispatchError::Application)?;
            summary.forwarded = true;
            break;
        }
        Ok(summary)
    })
}

/// Reads the fields that follow a scheduler marker: an optional `WindowId`,
/// the `CommandId` and an optional `FixDelay`, each at most once. The first
/// record outside that set is left unread.
fn read_tick(
    reader: &mut Reader<'_, ClientToServerModel>,
) -> Result<(Option<WindowId>, Tick), DispatchError> {
    let mut window = None;
    let mut command_id = None;
    let mut fix_delay = None;

    while let Some(record) = reader.next_field()? {
        let value = record.value.as_i64();
        match (record.key, value) {
            (ClientToServerModel::WindowId, Some(v)) if window.is_none() => {
                window = Some(v as WindowId);
            }
            (ClientToServerModel::CommandId, Some(v)) if command_id.is_none() => {
                command_id = Some(v as u64);
            }
            (ClientToServerModel::FixDelay, Some(v)) if fix_delay.is_none() => {
                let delay = v as i32;
                let delay =
                    u32::try_from(delay).map_err(|_| DispatchError::InvalidDelay(delay))?;
                fix_delay = Some(delay);
            }
            _ => {
                reader.rewind();
                break;
            }
        }
    }

    let command_id = command_id.ok_or(DispatchError::MissingCommandId)?;
    Ok((
        window,
        Tick {
            command_id,
            fix_delay,
        },
    ))
}

fn guarded<T>(f: impl FnOnce() -> Result<T, DispatchError>) -> Result<T, DispatchError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(DispatchError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StartKind;
    use crate::scheduler::CommandHandle;
    use beach_pier_core::{encode_to_vec, Record, ServerToClientModel, Value};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder {
        texts: Mutex<Vec<String>>,
        binary_keys: Mutex<Vec<ClientToServerModel>>,
        panic_on_text: bool,
    }

    impl ApplicationManager for Recorder {
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
            match instruction {
                Instruction::Text(text) => {
                    if self.panic_on_text {
                        panic!("boom: {text}");
                    }
                    if text == "fail" {
                        anyhow::bail!("refused");
                    }
                    self.texts.lock().push(text.to_string());
                }
                Instruction::Binary(reader) => {
                    while let Some(record) = reader.next_field()? {
                        self.binary_keys.lock().push(record.key);
                    }
                }
            }
            Ok(())
        }
    }

    fn context() -> Arc<ApplicationContext> {
        Arc::new(ApplicationContext::new(Uuid::new_v4()))
    }

    fn tick_bytes(window: Option<i32>, command_id: i64, delay: Option<i32>) -> Vec<u8> {
        let mut records = vec![Record::marker(ClientToServerModel::HandlerKeyScheduler)];
        if let Some(window) = window {
            records.push(Record::new(ClientToServerModel::WindowId, window));
        }
        records.push(Record::new(ClientToServerModel::CommandId, command_id));
        if let Some(delay) = delay {
            records.push(Record::new(ClientToServerModel::FixDelay, delay));
        }
        encode_to_vec(&records).expect("encode")
    }

    #[test_timeout::timeout]
    fn scheduler_tick_reaches_command() {
        let context = context();
        let manager = Recorder::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let command: CommandHandle = Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        });
        let id = context.scheduler(None).schedule_fixed_rate(&command, 1000);
        context.take_pending();

        let summary = dispatch_binary(&context, &manager, &tick_bytes(None, id as i64, None))
            .expect("dispatch");

        assert_eq!(summary.ticks, vec![TickOutcome::Continued]);
        assert!(!summary.forwarded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.binary_keys.lock().is_empty());
    }

    #[test_timeout::timeout]
    fn windowed_tick_routes_to_window_scheduler() {
        let context = context();
        let manager = Recorder::default();
        let command: CommandHandle = Arc::new(|| false);
        let id = context.scheduler(Some(9)).schedule_fixed_rate(&command, 100);
        context.take_pending();

        let summary = dispatch_binary(&context, &manager, &tick_bytes(Some(9), id as i64, None))
            .expect("dispatch");

        assert_eq!(summary.ticks, vec![TickOutcome::Cancelled]);
        let stop = context.take_pending();
        assert_eq!(stop.len(), 1);
        assert_eq!(stop[0].records()[0].key, ServerToClientModel::WindowId);
        assert_eq!(
            stop[0].records().last().map(|r| r.value.clone()),
            Some(Value::None)
        );
    }

    #[test_timeout::timeout]
    fn tick_with_delay_rearms() {
        let context = context();
        let manager = Recorder::default();
        let command: CommandHandle = Arc::new(|| true);
        let id = context.scheduler(None).schedule_fixed_rate(&command, 1000);

        let summary = dispatch_binary(&context, &manager, &tick_bytes(None, id as i64, Some(250)))
            .expect("dispatch");

        assert_eq!(summary.ticks, vec![TickOutcome::Rearmed { delay_ms: 250 }]);
    }

    #[test_timeout::timeout]
    fn non_scheduler_records_are_forwarded_from_their_start() {
        let context = context();
        let manager = Recorder::default();
        let bytes = encode_to_vec(&[
            Record::new(ClientToServerModel::HandlerKey, 3i16),
            Record::new(ClientToServerModel::Text, "ls"),
        ])
        .expect("encode");

        let summary = dispatch_binary(&context, &manager, &bytes).expect("dispatch");

        assert!(summary.forwarded);
        assert_eq!(
            *manager.binary_keys.lock(),
            vec![ClientToServerModel::HandlerKey, ClientToServerModel::Text]
        );
    }

    #[test_timeout::timeout]
    fn tick_followed_by_application_records() {
        let context = context();
        let manager = Recorder::default();
        let bytes = encode_to_vec(&[
            Record::marker(ClientToServerModel::HandlerKeyScheduler),
            Record::new(ClientToServerModel::CommandId, 77i64),
            Record::new(ClientToServerModel::ObjectId, 5),
        ])
        .expect("encode");

        let summary = dispatch_binary(&context, &manager, &bytes).expect("dispatch");

        assert_eq!(summary.ticks, vec![TickOutcome::Unknown]);
        assert!(summary.forwarded);
        assert_eq!(*manager.binary_keys.lock(), vec![ClientToServerModel::ObjectId]);
    }

    #[test_timeout::timeout]
    fn tick_without_command_id_is_rejected() {
        let context = context();
        let manager = Recorder::default();
        let bytes = encode_to_vec(&[Record::marker(ClientToServerModel::HandlerKeyScheduler)])
            .expect("encode");

        let err = dispatch_binary(&context, &manager, &bytes).expect_err("missing id");
        assert!(matches!(err, DispatchError::MissingCommandId));
    }

    #[test_timeout::timeout]
    fn truncated_frame_is_a_wire_error() {
        let context = context();
        let manager = Recorder::default();
        let err = dispatch_binary(&context, &manager, &[0, 2, 0, 0]).expect_err("truncated");
        assert!(matches!(err, DispatchError::Wire(WireError::UnexpectedEof { .. })));
        assert_eq!(err.metric_label(), WireError::UnexpectedEof { offset: 0 }.metric_label());
    }

    #[test_timeout::timeout]
    fn application_errors_and_panics_are_contained() {
        let context = context();
        let failing = Recorder::default();
        let err = dispatch_text(&context, &failing, "fail").expect_err("refused");
        assert!(matches!(err, DispatchError::Application(_)));

        let panicking = Recorder {
            panic_on_text: true,
            ..Recorder::default()
        };
        let err = dispatch_text(&context, &panicking, "hello").expect_err("panic");
        match err {
            DispatchError::Panicked(message) => assert!(message.contains("boom: hello")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn text_is_forwarded_verbatim() {
        let context = context();
        let manager = Recorder::default();
        dispatch_text(&context, &manager, "resize 80 24").expect("dispatch");
        assert_eq!(*manager.texts.lock(), vec!["resize 80 24".to_string()]);
    }
}
