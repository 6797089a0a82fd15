//! Cluster-wide, at-most-once task scheduling keyed by task name.
//!
//! Task names act as idempotency keys: among concurrent registrations of the
//! same name, exactly one wins and the others receive
//! [`ScheduleOutcome::AlreadyScheduled`]. That is the expected outcome when
//! several identical nodes boot at once, never an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Name of the single recurring reconciliation tick task shared by the cluster.
pub const RECONCILIATION_TASK_NAME: &str = "quiz-reconciliation-tick";

/// Deduplication name of the one-shot start task for an exercise.
pub fn start_task_name(exercise_id: i64) -> String {
    format!("{exercise_id}-start")
}

/// Serializable reference to one scheduled execution.
///
/// Small enough to store inside the distributed session record so any node
/// can later look up, cancel, and dispose the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Deduplication name the task was registered under.
    pub name: String,
    /// Unique id of this particular registration.
    pub id: Uuid,
}

/// Result of a schedule request.
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    /// This caller won the registration and owns the handle.
    Scheduled(TaskHandle),
    /// An identically named task is already registered somewhere in the cluster.
    AlreadyScheduled,
}

/// Future produced by a task closure at each fire time.
pub type TaskFuture = BoxFuture<'static, ()>;
/// Factory invoked at each fire time of a scheduled task.
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Scheduling facility consumed by the session layers.
pub trait TaskScheduler: Send + Sync {
    /// Register a one-shot task firing once after `delay`.
    fn schedule_once(&self, name: &str, delay: Duration, task: TaskFn) -> ScheduleOutcome;
    /// Register a recurring task firing immediately and then every `period`.
    fn schedule_fixed_rate(&self, name: &str, period: Duration, task: TaskFn) -> ScheduleOutcome;
    /// Resolve a handle to its live scheduled future.
    ///
    /// `None` is the stale-task condition: the registration has already been
    /// disposed (typically by another node). Callers log and move on.
    fn future(&self, handle: &TaskHandle) -> Option<ScheduledFuture>;
    /// Look up the currently registered handle for a task name.
    fn find(&self, name: &str) -> Option<TaskHandle>;
}

/// Live view of a scheduled task supporting the is-done/cancel/dispose contract.
pub struct ScheduledFuture {
    handle: TaskHandle,
    done: Arc<AtomicBool>,
    abort: AbortHandle,
    registry: Weak<DashMap<String, TaskEntry>>,
}

impl ScheduledFuture {
    /// Whether the task has already fired or been cancelled.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Cancel the task; returns whether this call prevented it from firing.
    pub fn cancel(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.abort.abort();
        true
    }

    /// Release the server-side bookkeeping for this registration.
    ///
    /// Safe on tasks that already fired or were disposed elsewhere.
    pub fn dispose(&self) {
        if let Some(tasks) = self.registry.upgrade() {
            tasks.remove_if(&self.handle.name, |_, entry| entry.id == self.handle.id);
        }
    }
}

struct TaskEntry {
    id: Uuid,
    done: Arc<AtomicBool>,
    abort: AbortHandle,
}

/// In-process [`TaskScheduler`] backed by tokio timers.
///
/// One instance plays the role of the cluster scheduler: sharing it between
/// several registries yields the cluster-wide at-most-once property, exactly
/// like sharing a topology yields shared cache state.
#[derive(Default)]
pub struct LocalTaskScheduler {
    tasks: Arc<DashMap<String, TaskEntry>>,
}

impl LocalTaskScheduler {
    /// Create a scheduler with no registered tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and drop every registered task, e.g. on shutdown.
    pub fn abort_all(&self) {
        for entry in self.tasks.iter() {
            entry.value().done.store(true, Ordering::SeqCst);
            entry.value().abort.abort();
        }
        self.tasks.clear();
    }
}

impl TaskScheduler for LocalTaskScheduler {
    fn schedule_once(&self, name: &str, delay: Duration, task: TaskFn) -> ScheduleOutcome {
        match self.tasks.entry(name.to_string()) {
            Entry::Occupied(_) => ScheduleOutcome::AlreadyScheduled,
            Entry::Vacant(slot) => {
                let id = Uuid::new_v4();
                let done = Arc::new(AtomicBool::new(false));
                let join = tokio::spawn({
                    let done = done.clone();
                    let tasks = Arc::downgrade(&self.tasks);
                    let name = name.to_string();
                    async move {
                        tokio::time::sleep(delay).await;
                        // A cancel that won the race marks the task done; the
                        // abort may not have landed yet, so re-check here.
                        if done.swap(true, Ordering::SeqCst) {
                            return;
                        }
                        task().await;
                        // One-shot tasks release their own bookkeeping so the
                        // name can be reused without an explicit dispose.
                        if let Some(tasks) = tasks.upgrade() {
                            tasks.remove_if(&name, |_, entry| entry.id == id);
                        }
                    }
                });
                slot.insert(TaskEntry {
                    id,
                    done,
                    abort: join.abort_handle(),
                });
                ScheduleOutcome::Scheduled(TaskHandle {
                    name: name.to_string(),
                    id,
                })
            }
        }
    }

    fn schedule_fixed_rate(&self, name: &str, period: Duration, task: TaskFn) -> ScheduleOutcome {
        match self.tasks.entry(name.to_string()) {
            Entry::Occupied(_) => ScheduleOutcome::AlreadyScheduled,
            Entry::Vacant(slot) => {
                let id = Uuid::new_v4();
                let done = Arc::new(AtomicBool::new(false));
                let join = tokio::spawn({
                    let done = done.clone();
                    async move {
                        let mut ticker = tokio::time::interval(period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        loop {
                            ticker.tick().await;
                            if done.load(Ordering::SeqCst) {
                                break;
                            }
                            task().await;
                        }
                    }
                });
                slot.insert(TaskEntry {
                    id,
                    done,
                    abort: join.abort_handle(),
                });
                ScheduleOutcome::Scheduled(TaskHandle {
                    name: name.to_string(),
                    id,
                })
            }
        }
    }

    fn future(&self, handle: &TaskHandle) -> Option<ScheduledFuture> {
        let entry = self.tasks.get(&handle.name)?;
        if entry.id != handle.id {
            return None;
        }
        Some(ScheduledFuture {
            handle: handle.clone(),
            done: entry.done.clone(),
            abort: entry.abort.clone(),
            registry: Arc::downgrade(&self.tasks),
        })
    }

    fn find(&self, name: &str) -> Option<TaskHandle> {
        self.tasks.get(name).map(|entry| TaskHandle {
            name: name.to_string(),
            id: entry.id,
        })
    }
}
