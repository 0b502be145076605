// src/orchestrator/queue.rs

//! FIFO task queue for one depot

use super::{QueueContext, Task, TaskExecutor, TaskFailure, TaskKind, TaskStatus};
use std::thread;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct TaskQueue {
    name: String,
    depot_id: String,
    tasks: Vec<Task>,
    failures: Vec<TaskFailure>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, depot_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depot_id: depot_id.into(),
            tasks: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depot_id(&self) -> &str {
        &self.depot_id
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    fn record_failure(&mut self, index: usize, message: String) {
        let task = &mut self.tasks[index];
        error!("Task '{}' failed: {}", task.name, message);
        task.status = TaskStatus::Failed(message.clone());
        self.failures.push(TaskFailure {
            queue: self.name.clone(),
            task: task.name.clone(),
            message,
        });
    }

    /// Execute the tasks in order
    ///
    /// Failures are recorded and do not stop the queue, except that an
    /// Install of the same package directly following a failed Upload is
    /// skipped.
    pub fn run(&mut self, executor: &dyn TaskExecutor, context: &QueueContext<'_>) {
        debug!("Task queue '{}' started", self.name);
        let mut index = 0;

        while index < self.tasks.len() {
            if context.abort.is_aborted() {
                info!("Task queue '{}' aborted", self.name);
                return;
            }

            let kind = self.tasks[index].kind;
            self.tasks[index].status = TaskStatus::Running;
            debug!("Starting task '{}'", self.tasks[index].name);

            let result = if kind == TaskKind::Upload {
                match context.permits.acquire(context.abort) {
                    Some(_permit) => executor.execute(&self.tasks[index]),
                    None => {
                        self.tasks[index].status = TaskStatus::Pending;
                        info!("Task queue '{}' aborted", self.name);
                        return;
                    }
                }
            } else {
                executor.execute(&self.tasks[index])
            };

            match result {
                Ok(()) => {
                    self.tasks[index].status = TaskStatus::Succeeded;
                    debug!("Task '{}' ended", self.tasks[index].name);
                }
                Err(e) => {
                    self.record_failure(index, e.to_string());
                    let payload = &self.tasks[index].payload;
                    let next_installs_same = self
                        .tasks
                        .get(index + 1)
                        .is_some_and(|next| next.kind == TaskKind::Install && next.payload == *payload);
                    if kind == TaskKind::Upload && next_installs_same {
                        index += 1;
                        info!("Upload task failed, skipping install task '{}'", self.tasks[index].name);
                        self.tasks[index].status = TaskStatus::Skipped;
                    }
                }
            }

            if let Some(next) = self.tasks.get(index + 1) {
                let mut pause = context.pause;
                if kind == TaskKind::Upload && next.kind == TaskKind::Upload {
                    // Leave other queues room to start their uploads
                    pause *= 2;
                }
                thread::sleep(pause);
            }
            index += 1;
        }

        debug!("Task queue '{}' finished", self.name);
    }
}
