//! Per-terminal application state that outlives individual sockets.
//!
//! A terminal reconnecting with its `session_id` gets its existing context
//! back (a reload); anything else gets a fresh one. Contexts left without a
//! socket for longer than the idle timeout are destroyed by the recycler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use beach_pier_core::Frame;
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{oneshot, Notify},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::scheduler::{CommandId, Scheduler, SchedulerHandle, SchedulerHost, WindowId};

/// How a context came to be bound to the current socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    New,
    /// The terminal reattached to an existing context. Terminals do not
    /// report which view they were showing, so `view_id` is always `None`.
    Reload { view_id: Option<u64> },
}

impl StartKind {
    pub fn is_reload(&self) -> bool {
        matches!(self, StartKind::Reload { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedulerKey {
    pub window: Option<WindowId>,
}

pub struct ApplicationContext {
    session_id: Uuid,
    destroyed: AtomicBool,
    last_activity: AtomicU64,
    next_id: AtomicU64,
    pending: Mutex<Vec<Frame>>,
    updates: Notify,
    schedulers: Mutex<HashMap<SchedulerKey, Scheduler>>,
    binding: Mutex<Option<Binding>>,
}

struct Binding {
    connection_id: Uuid,
    superseded: oneshot::Sender<()>,
}

impl ApplicationContext {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            destroyed: AtomicBool::new(false),
            last_activity: AtomicU64::new(now_millis()),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            updates: Notify::new(),
            schedulers: Mutex::new(HashMap::new()),
            binding: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Marks the context destroyed and drops everything it still holds. Once
    /// destroyed, inbound messages are ignored and flushes are refused.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = std::mem::take(&mut *self.pending.lock()).len();
        self.schedulers.lock().clear();
        if let Some(binding) = self.binding.lock().take() {
            let _ = binding.superseded.send(());
        }
        counter!("beach_pier_contexts_destroyed_total", 1);
        info!(
            session_id = %self.session_id,
            dropped_frames = dropped,
            "application context destroyed"
        );
    }

    /// Records inbound activity for idle tracking.
    pub fn notify_message_received(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_millis(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Queues a frame for the next flush and wakes the bound socket. Frames
    /// queued after destruction are discarded.
    pub fn save_update(&self, frame: Frame) {
        if frame.is_empty() {
            return;
        }
        if self.is_destroyed() {
            debug!(session_id = %self.session_id, "update discarded; context is destroyed");
            return;
        }
        self.pending.lock().push(frame);
        self.updates.notify_one();
    }

    /// Resolves once an update has been queued since the last wake-up. A wake
    /// that arrives while nobody is waiting is kept for the next caller.
    pub async fn updates_queued(&self) {
        self.updates.notified().await;
    }

    /// Drains the outbound queue in submission order.
    pub fn take_pending(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Puts frames that were taken but never written back ahead of anything
    /// queued since.
    pub(crate) fn requeue_front(&self, frames: Vec<Frame>) {
        if frames.is_empty() || self.is_destroyed() {
            return;
        }
        let mut pending = self.pending.lock();
        pending.splice(0..0, frames);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Scheduler for `window`, created on first use. `None` is the
    /// context-wide scheduler.
    pub fn scheduler(self: &Arc<Self>, window: Option<WindowId>) -> SchedulerHandle {
        SchedulerHandle::new(Arc::clone(self), SchedulerKey { window })
    }

    pub(crate) fn with_scheduler<R>(
        &self,
        key: SchedulerKey,
        f: impl FnOnce(&mut Scheduler) -> R,
    ) -> R {
        let mut schedulers = self.schedulers.lock();
        let scheduler = schedulers
            .entry(key)
            .or_insert_with(|| Scheduler::new(key.window));
        f(scheduler)
    }

    pub fn registered_commands(&self) -> usize {
        self.schedulers.lock().values().map(Scheduler::len).sum()
    }

    /// Binds a socket to this context. A previously bound socket is told to
    /// stop through its receiver, which also resolves if this context is
    /// destroyed.
    pub fn bind_connection(&self, connection_id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let previous = self.binding.lock().replace(Binding {
            connection_id,
            superseded: tx,
        });
        if let Some(previous) = previous {
            info!(
                session_id = %self.session_id,
                connection_id = %previous.connection_id,
                replacement = %connection_id,
                "socket superseded by a newer connection"
            );
            let _ = previous.superseded.send(());
        }
        self.notify_message_received();
        rx
    }

    /// Detaches `connection_id` if it is still the bound socket.
    pub fn release_connection(&self, connection_id: Uuid) -> bool {
        let mut binding = self.binding.lock();
        if binding
            .as_ref()
            .is_some_and(|current| current.connection_id == connection_id)
        {
            *binding = None;
            drop(binding);
            self.notify_message_received();
            return true;
        }
        false
    }

    pub fn bound_connection(&self) -> Option<Uuid> {
        self.binding
            .lock()
            .as_ref()
            .map(|binding| binding.connection_id)
    }
}

impl SchedulerHost for ApplicationContext {
    fn next_id(&self) -> CommandId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn save_update(&self, frame: Frame) {
        ApplicationContext::save_update(self, frame);
    }
}

impl std::fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("session_id", &self.session_id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[derive(Clone)]
pub struct ContextRegistry {
    inner: Arc<ContextRegistryInner>,
}

struct ContextRegistryInner {
    contexts: DashMap<Uuid, Arc<ApplicationContext>>,
    idle_timeout: Duration,
    recycle_interval: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub session_id: Uuid,
    pub bound: bool,
    pub pending_frames: usize,
    pub registered_commands: usize,
}

impl ContextRegistry {
    pub fn new(idle_timeout: Duration, recycle_interval: Duration) -> Self {
        Self {
            inner: Arc::new(ContextRegistryInner {
                contexts: DashMap::new(),
                idle_timeout,
                recycle_interval,
            }),
        }
    }

    /// Returns the live context for `requested`, or creates one. A requested
    /// id with no live context gets a fresh context under that id.
    pub fn resolve(&self, requested: Option<Uuid>) -> (Arc<ApplicationContext>, StartKind) {
        let session_id = requested.unwrap_or_else(Uuid::new_v4);
        let resolved = match self.inner.contexts.entry(session_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_destroyed() {
                    let context = Arc::new(ApplicationContext::new(session_id));
                    entry.insert(Arc::clone(&context));
                    (context, StartKind::New)
                } else {
                    (Arc::clone(entry.get()), StartKind::Reload { view_id: None })
                }
            }
            Entry::Vacant(entry) => {
                let context = Arc::new(ApplicationContext::new(session_id));
                entry.insert(Arc::clone(&context));
                (context, StartKind::New)
            }
        };

        let kind_label = if resolved.1.is_reload() { "reload" } else { "new" };
        counter!("beach_pier_contexts_resolved_total", 1, "kind" => kind_label);
        gauge!("beach_pier_contexts_active", self.len() as f64);
        resolved
    }

    pub fn get(&self, session_id: &Uuid) -> Option<Arc<ApplicationContext>> {
        self.inner
            .contexts
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.contexts.is_empty()
    }

    /// Destroys and removes the context, if present.
    pub fn destroy(&self, session_id: &Uuid) -> bool {
        match self.inner.contexts.remove(session_id) {
            Some((_, context)) => {
                context.destroy();
                gauge!("beach_pier_contexts_active", self.len() as f64);
                true
            }
            None => false,
        }
    }

    /// Destroys detached contexts idle for longer than the idle timeout, and
    /// drops entries that were destroyed elsewhere.
    pub fn remove_idle(&self, now: u64) -> usize {
        let timeout = self.inner.idle_timeout.as_millis() as u64;
        let session_ids: Vec<Uuid> = self
            .inner
            .contexts
            .iter()
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0usize;
        for session_id in session_ids {
            let evicted = self.inner.contexts.remove_if(&session_id, |_, context| {
                context.is_destroyed()
                    || (context.bound_connection().is_none()
                        && now.saturating_sub(context.last_activity_millis()) > timeout)
            });
            if let Some((_, context)) = evicted {
                context.destroy();
                counter!("beach_pier_contexts_recycled_total", 1);
                removed += 1;
            }
        }

        if removed > 0 {
            gauge!("beach_pier_contexts_active", self.len() as f64);
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<ContextSnapshot> {
        let contexts: Vec<Arc<ApplicationContext>> = self
            .inner
            .contexts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        contexts
            .into_iter()
            .map(|context| ContextSnapshot {
                session_id: context.session_id(),
                bound: context.bound_connection().is_some(),
                pending_frames: context.pending_len(),
                registered_commands: context.registered_commands(),
            })
            .collect()
    }

    pub fn spawn_recycler(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.recycle_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let removed = registry.remove_idle(now_millis());
                if removed > 0 {
                    debug!(removed, "recycled idle application contexts");
                }
            }
        })
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
