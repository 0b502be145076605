// src/orchestrator/mod.rs

//! Multi-depot task orchestration
//!
//! Uploads, installations and removals are grouped into one FIFO
//! [`TaskQueue`] per depot. Every queue runs on its own thread; uploads
//! across all queues share a bounded number of transfer permits.
//!
//! ```text
//! Pending -> Running -> Succeeded
//!                    -> Failed
//! Pending -> Skipped        (Install directly after a failed Upload)
//! ```
//!
//! A failing task does not stop its queue. The run fails after all
//! queues finished if any of them recorded an error.

mod executor;
mod heartbeat;
mod queue;

pub use executor::{DepotConnection, DepotTaskExecutor};
pub use heartbeat::{heartbeat_interval, TransferSlotGuard};
pub use queue::TaskQueue;

use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Default pause between two tasks of a queue
pub const DEFAULT_TASK_PAUSE: Duration = Duration::from_secs(2);

/// Poll interval while waiting for a free transfer permit
const PERMIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Upload,
    Install,
    Uninstall,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Upload => "upload",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed(String),
}

/// One unit of work on a depot
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub kind: TaskKind,
    pub depot_id: String,
    /// Package file for uploads and installs, product id for removals
    pub payload: String,
    pub status: TaskStatus,
}

impl Task {
    fn new(kind: TaskKind, depot_id: &str, payload: String, name: String) -> Self {
        Self {
            name,
            kind,
            depot_id: depot_id.to_string(),
            payload,
            status: TaskStatus::Pending,
        }
    }

    pub fn upload(depot_id: &str, package: &Path) -> Self {
        let name = format!("Upload of package '{}' to depot '{}'", package.display(), depot_id);
        Self::new(TaskKind::Upload, depot_id, package.display().to_string(), name)
    }

    pub fn install(depot_id: &str, package: &Path) -> Self {
        let name = format!("Install of package '{}' on depot '{}'", package.display(), depot_id);
        Self::new(TaskKind::Install, depot_id, package.display().to_string(), name)
    }

    pub fn uninstall(depot_id: &str, product_id: &str) -> Self {
        let name = format!("Uninstall of product '{}' on depot '{}'", product_id, depot_id);
        Self::new(TaskKind::Uninstall, depot_id, product_id.to_string(), name)
    }

    /// Package path of an upload or install task
    pub fn package_path(&self) -> PathBuf {
        PathBuf::from(&self.payload)
    }
}

/// Carries out tasks; shared by all queue threads
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &Task) -> Result<()>;
}

/// A task error recorded by a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub queue: String,
    pub task: String,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.queue, self.task, self.message)
    }
}

/// Cooperative stop signal for running queues
///
/// The task in progress completes; no further task starts.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded number of concurrent uploads across all queues
#[derive(Debug)]
pub struct TransferPermits {
    /// 0 means unlimited
    max: usize,
    running: Mutex<usize>,
}

/// A held upload permit, returned on drop
pub struct TransferPermit<'a> {
    permits: &'a TransferPermits,
}

impl TransferPermits {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            running: Mutex::new(0),
        }
    }

    pub fn running(&self) -> usize {
        self.running.lock().map(|r| *r).unwrap_or(0)
    }

    /// Take a permit if one is free
    pub fn try_acquire(&self) -> Option<TransferPermit<'_>> {
        let mut running = self.running.lock().ok()?;
        if self.max > 0 && *running >= self.max {
            return None;
        }
        *running += 1;
        Some(TransferPermit { permits: self })
    }

    /// Wait until a permit is free
    ///
    /// Returns `None` if `abort` is raised while waiting.
    pub fn acquire(&self, abort: &AbortHandle) -> Option<TransferPermit<'_>> {
        let mut logged = false;
        loop {
            if let Some(permit) = self.try_acquire() {
                return Some(permit);
            }
            if abort.is_aborted() {
                return None;
            }
            if !logged {
                debug!("Maximum number of transfers ({}) reached, waiting", self.max);
                logged = true;
            }
            thread::sleep(PERMIT_POLL_INTERVAL);
        }
    }
}

impl Drop for TransferPermit<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.permits.running.lock() {
            *running = running.saturating_sub(1);
        }
    }
}

/// Runs task queues concurrently
pub struct TaskOrchestrator {
    queues: Vec<TaskQueue>,
    pause: Duration,
    permits: TransferPermits,
    abort: AbortHandle,
}

impl TaskOrchestrator {
    /// Create an orchestrator allowing `max_transfers` parallel uploads
    /// (0 for no limit)
    pub fn new(max_transfers: usize) -> Self {
        Self {
            queues: Vec::new(),
            pause: DEFAULT_TASK_PAUSE,
            permits: TransferPermits::new(max_transfers),
            abort: AbortHandle::default(),
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn add_queue(&mut self, queue: TaskQueue) {
        self.queues.push(queue);
    }

    /// Append `task` to the queue of its depot, creating it if needed
    pub fn add_task(&mut self, task: Task) {
        match self.queues.iter_mut().find(|q| q.depot_id() == task.depot_id) {
            Some(queue) => queue.push(task),
            None => {
                let mut queue = TaskQueue::new(
                    format!("Tasks for depot '{}'", task.depot_id),
                    task.depot_id.clone(),
                );
                queue.push(task);
                self.queues.push(queue);
            }
        }
    }

    pub fn queues(&self) -> &[TaskQueue] {
        &self.queues
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run all queues to completion
    pub fn run(&mut self, executor: &dyn TaskExecutor) -> Result<()> {
        let context = QueueContext {
            pause: self.pause,
            permits: &self.permits,
            abort: &self.abort,
        };

        thread::scope(|scope| {
            for queue in &mut self.queues {
                info!("Starting task queue '{}'", queue.name());
                let context = &context;
                scope.spawn(move || queue.run(executor, context));
            }
        });

        let failures: Vec<TaskFailure> = self
            .queues
            .iter()
            .flat_map(|q| q.failures().iter().cloned())
            .collect();
        if failures.is_empty() {
            return Ok(());
        }

        for failure in &failures {
            error!("{}", failure);
        }
        Err(Error::TaskQueues {
            count: failures.len(),
            failures,
        })
    }
}

/// Run-wide state handed to every queue thread
pub struct QueueContext<'a> {
    pub pause: Duration,
    pub permits: &'a TransferPermits,
    pub abort: &'a AbortHandle,
}
