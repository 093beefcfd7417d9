//! Repeating commands driven by the terminal's clock.
//!
//! The server never runs a timer for these commands. Registering one emits a
//! directive frame (`CommandId` plus `FixRate`, `FixDelay` or `Stop`); the
//! terminal then sends a tick back each time the period elapses and the server
//! invokes the command once per tick. A command that answers `false` is
//! cancelled and the terminal is told to stop ticking.

use std::collections::HashMap;
use std::sync::Arc;

use beach_pier_core::{Frame, ServerToClientModel};
use metrics::counter;
use slab::Slab;
use tracing::{debug, info};

use crate::context::{ApplicationContext, SchedulerKey};

/// Server-minted command id, unique within one context.
pub type CommandId = u64;
/// Window scope carried by directives and ticks.
pub type WindowId = i32;

pub trait RepeatingCommand: Send + Sync {
    /// Runs one iteration. Returning `false` cancels the command.
    fn execute(&self) -> bool;
}

impl<F> RepeatingCommand for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn execute(&self) -> bool {
        (self)()
    }
}

/// Shared handle to a registered command. Registration identity is the
/// allocation behind the `Arc`, so clones of one handle are the same command.
pub type CommandHandle = Arc<dyn RepeatingCommand>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CommandIdentity(usize);

impl CommandIdentity {
    fn of(command: &CommandHandle) -> Self {
        Self(Arc::as_ptr(command) as *const () as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    FixedRate { period_ms: u32 },
    FixedDelay { delay_ms: u32 },
}

/// Context services a scheduler needs: id minting and the outbound queue.
pub trait SchedulerHost {
    fn next_id(&self) -> CommandId;
    fn save_update(&self, frame: Frame);
}

/// Inbound tick for one registration. `fix_delay` re-arms the command as
/// fixed-delay when it asks to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub command_id: CommandId,
    pub fix_delay: Option<u32>,
}

impl Tick {
    pub fn new(command_id: CommandId) -> Self {
        Self {
            command_id,
            fix_delay: None,
        }
    }

    pub fn with_delay(mut self, delay_ms: u32) -> Self {
        self.fix_delay = Some(delay_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No registration carries the ticked id.
    Unknown,
    Continued,
    Rearmed { delay_ms: u32 },
    Cancelled,
}

struct Registration {
    id: CommandId,
    command: CommandHandle,
    mode: ScheduleMode,
}

/// Registrations for one window scope of a context.
pub struct Scheduler {
    window: Option<WindowId>,
    slab: Slab<Registration>,
    by_id: HashMap<CommandId, usize>,
    by_command: HashMap<CommandIdentity, usize>,
}

impl Scheduler {
    pub fn new(window: Option<WindowId>) -> Self {
        Self {
            window,
            slab: Slab::new(),
            by_id: HashMap::new(),
            by_command: HashMap::new(),
        }
    }

    pub fn window(&self) -> Option<WindowId> {
        self.window
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn id_of(&self, command: &CommandHandle) -> Option<CommandId> {
        self.by_command
            .get(&CommandIdentity::of(command))
            .map(|index| self.slab[*index].id)
    }

    pub fn mode_of(&self, id: CommandId) -> Option<ScheduleMode> {
        self.by_id.get(&id).map(|index| self.slab[*index].mode)
    }

    /// Registers `command` to run every `period_ms`. Registering a command
    /// that is already known keeps its id and re-sends the directive with the
    /// new period.
    pub fn schedule_fixed_rate(
        &mut self,
        host: &dyn SchedulerHost,
        command: CommandHandle,
        period_ms: u32,
    ) -> CommandId {
        self.register(host, command, ScheduleMode::FixedRate { period_ms })
    }

    /// Registers `command` to run `delay_ms` after each completed run.
    pub fn schedule_fixed_delay(
        &mut self,
        host: &dyn SchedulerHost,
        command: CommandHandle,
        delay_ms: u32,
    ) -> CommandId {
        self.register(host, command, ScheduleMode::FixedDelay { delay_ms })
    }

    /// Removes `command` and tells the terminal to stop ticking it.
    pub fn cancel(&mut self, host: &dyn SchedulerHost, command: &CommandHandle) -> Option<CommandId> {
        let index = *self.by_command.get(&CommandIdentity::of(command))?;
        let id = self.slab[index].id;
        self.remove(host, id);
        Some(id)
    }

    /// Removes the registration carrying `id`, emitting its stop directive.
    pub fn cancel_id(&mut self, host: &dyn SchedulerHost, id: CommandId) -> bool {
        self.remove(host, id)
    }

    /// Runs one tick in place: lookup, execute, then apply the command's answer.
    pub fn on_tick(&mut self, host: &dyn SchedulerHost, tick: Tick) -> TickOutcome {
        let Some(command) = self.command_for(tick.command_id) else {
            debug!(
                command_id = tick.command_id,
                window = ?self.window,
                "tick for unknown command ignored"
            );
            return TickOutcome::Unknown;
        };
        let invoke_again = command.execute();
        self.complete_tick(host, tick, invoke_again)
    }

    pub(crate) fn command_for(&self, id: CommandId) -> Option<CommandHandle> {
        self.by_id
            .get(&id)
            .map(|index| Arc::clone(&self.slab[*index].command))
    }

    /// Applies the result of a command run. A registration that disappeared
    /// while the command ran was cancelled from inside it and is left alone.
    pub(crate) fn complete_tick(
        &mut self,
        host: &dyn SchedulerHost,
        tick: Tick,
        invoke_again: bool,
    ) -> TickOutcome {
        let Some(index) = self.by_id.get(&tick.command_id).copied() else {
            return TickOutcome::Cancelled;
        };

        if !invoke_again {
            self.remove(host, tick.command_id);
            return TickOutcome::Cancelled;
        }

        match tick.fix_delay {
            Some(delay_ms) => {
                self.slab[index].mode = ScheduleMode::FixedDelay { delay_ms };
                host.save_update(self.directive(
                    tick.command_id,
                    ServerToClientModel::FixDelay,
                    delay_ms,
                ));
                TickOutcome::Rearmed { delay_ms }
            }
            None => TickOutcome::Continued,
        }
    }

    fn register(
        &mut self,
        host: &dyn SchedulerHost,
        command: CommandHandle,
        mode: ScheduleMode,
    ) -> CommandId {
        let identity = CommandIdentity::of(&command);
        let id = match self.by_command.get(&identity).copied() {
            Some(index) => {
                let registration = &mut self.slab[index];
                registration.mode = mode;
                debug!(
                    command_id = registration.id,
                    window = ?self.window,
                    ?mode,
                    "repeating command re-registered"
                );
                registration.id
            }
            None => {
                let id = host.next_id();
                let index = self.slab.insert(Registration { id, command, mode });
                self.by_id.insert(id, index);
                self.by_command.insert(identity, index);
                counter!("beach_pier_commands_registered_total", 1);
                debug!(command_id = id, window = ?self.window, ?mode, "repeating command registered");
                id
            }
        };

        let frame = match mode {
            ScheduleMode::FixedRate { period_ms } => {
                self.directive(id, ServerToClientModel::FixRate, period_ms)
            }
            ScheduleMode::FixedDelay { delay_ms } => {
                self.directive(id, ServerToClientModel::FixDelay, delay_ms)
            }
        };
        host.save_update(frame);
        id
    }

    fn remove(&mut self, host: &dyn SchedulerHost, id: CommandId) -> bool {
        let Some(index) = self.by_id.remove(&id) else {
            return false;
        };
        let registration = self.slab.remove(index);
        self.by_command
            .remove(&CommandIdentity::of(&registration.command));
        host.save_update(self.frame_head(id).with_marker(ServerToClientModel::Stop));
        counter!("beach_pier_commands_cancelled_total", 1);
        info!(command_id = id, window = ?self.window, "repeating command cancelled");
        true
    }

    fn directive(&self, id: CommandId, key: ServerToClientModel, period_ms: u32) -> Frame {
        // Periods above i32::MAX are clamped to the wire's signed field.
        let period = i32::try_from(period_ms).unwrap_or(i32::MAX);
        self.frame_head(id).with(key, period)
    }

    fn frame_head(&self, id: CommandId) -> Frame {
        let frame = match self.window {
            Some(window) => Frame::new().with(ServerToClientModel::WindowId, window),
            None => Frame::new(),
        };
        frame.with(ServerToClientModel::CommandId, id as i64)
    }
}

/// Scheduler of one window scope, bound to its context. Commands run with the
/// context's scheduler lock released, so a command may register or cancel
/// other commands.
#[derive(Clone)]
pub struct SchedulerHandle {
    context: Arc<ApplicationContext>,
    key: SchedulerKey,
}

impl SchedulerHandle {
    pub(crate) fn new(context: Arc<ApplicationContext>, key: SchedulerKey) -> Self {
        Self { context, key }
    }

    pub fn window(&self) -> Option<WindowId> {
        self.key.window
    }

    pub fn schedule_fixed_rate(&self, command: &CommandHandle, period_ms: u32) -> CommandId {
        let host = self.context.as_ref();
        self.context.with_scheduler(self.key, |scheduler| {
            scheduler.schedule_fixed_rate(host, Arc::clone(command), period_ms)
        })
    }

    pub fn schedule_fixed_delay(&self, command: &CommandHandle, delay_ms: u32) -> CommandId {
        let host = self.context.as_ref();
        self.context.with_scheduler(self.key, |scheduler| {
            scheduler.schedule_fixed_delay(host, Arc::clone(command), delay_ms)
        })
    }

    pub fn cancel(&self, command: &CommandHandle) -> Option<CommandId> {
        let host = self.context.as_ref();
        self.context
            .with_scheduler(self.key, |scheduler| scheduler.cancel(host, command))
    }

    pub fn len(&self) -> usize {
        self.context.with_scheduler(self.key, |scheduler| scheduler.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn id_of(&self, command: &CommandHandle) -> Option<CommandId> {
        self.context
            .with_scheduler(self.key, |scheduler| scheduler.id_of(command))
    }

    pub fn mode_of(&self, id: CommandId) -> Option<ScheduleMode> {
        self.context
            .with_scheduler(self.key, |scheduler| scheduler.mode_of(id))
    }

    pub fn on_tick(&self, tick: Tick) -> TickOutcome {
        let session_id = self.context.session_id();
        let Some(command) = self
            .context
            .with_scheduler(self.key, |scheduler| scheduler.command_for(tick.command_id))
        else {
            debug!(
                session_id = %session_id,
                command_id = tick.command_id,
                window = ?self.key.window,
                "tick for unknown command ignored"
            );
            return TickOutcome::Unknown;
        };

        let invoke_again = command.execute();
        counter!("beach_pier_command_ticks_total", 1);

        let host = self.context.as_ref();
        let outcome = self.context.with_scheduler(self.key, |scheduler| {
            scheduler.complete_tick(host, tick, invoke_again)
        });
        debug!(
            session_id = %session_id,
            command_id = tick.command_id,
            ?outcome,
            "tick processed"
        );
        outcome
    }
}
