use crate::scheduler::worker::{WorkerPriority, WorkerShared};
use crate::task::handle::Task;
use crate::task::types::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Domain behavior of a task.
///
/// The scheduler calls `prepare` once on the coordinator thread when the task
/// is admitted, `run` once (inline or on a dedicated worker thread), and then
/// `report` on the coordinator thread until it returns [`ReportResult::Finished`].
/// A returned error becomes the task's error text.
pub trait TaskBody: Send + 'static {
    fn prepare(&mut self, _ctx: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }

    fn run(&mut self, _ctx: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }

    fn report(&mut self, _ctx: &TaskContext) -> Result<ReportResult, TaskError> {
        Ok(ReportResult::Finished)
    }

    /// Called after one of this task's subtasks finished. Returned tasks are
    /// appended as new subtasks and admitted on a later tick.
    fn on_subtask_finished(&mut self, _ctx: &TaskContext, _subtask: &Task) -> Vec<Task> {
        Vec::new()
    }
}

/// Body that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBody;

impl TaskBody for NoopBody {}

/// Adapts a closure into a body whose `run` calls it
pub struct FnBody<F> {
    run: F,
}

impl<F> FnBody<F>
where
    F: FnMut(&TaskContext) -> Result<(), TaskError> + Send + 'static,
{
    pub fn new(run: F) -> Self {
        Self { run }
    }
}

impl<F> TaskBody for FnBody<F>
where
    F: FnMut(&TaskContext) -> Result<(), TaskError> + Send + 'static,
{
    fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        (self.run)(ctx)
    }
}

impl Task {
    /// Task whose `run` is the given closure
    pub fn from_fn<F>(name: impl Into<String>, run: F) -> Task
    where
        F: FnMut(&TaskContext) -> Result<(), TaskError> + Send + 'static,
    {
        Task::new(name, FnBody::new(run))
    }
}

/// View of the owning task handed to body callbacks
pub struct TaskContext {
    task: Task,
    worker: Option<Arc<WorkerShared>>,
}

impl TaskContext {
    pub(crate) fn new(task: Task) -> Self {
        Self { task, worker: None }
    }

    pub(crate) fn on_worker(task: Task, worker: Arc<WorkerShared>) -> Self {
        Self {
            task,
            worker: Some(worker),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn is_canceled(&self) -> bool {
        self.task.is_canceled()
    }

    /// Canceled or failed; long-running bodies should return early
    pub fn should_stop(&self) -> bool {
        self.task.is_stopped()
    }

    pub fn set_progress(&self, progress: i32) {
        self.task.set_progress(progress);
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.task.set_description(description);
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        self.task.add_warning(warning);
    }

    /// Only valid during `prepare`
    pub fn add_subtask(&self, subtask: Task) -> Result<(), TaskError> {
        self.task.add_subtask(subtask)
    }

    /// Priority the scheduler currently assigns to this task's worker thread
    pub fn priority(&self) -> WorkerPriority {
        self.worker
            .as_ref()
            .map(|w| w.priority())
            .unwrap_or(WorkerPriority::Low)
    }

    /// Cooperative pause point: blocks while the worker is paused, then
    /// reports cancellation so the body can bail out.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if let Some(worker) = &self.worker {
            worker.pause_gate().wait_while_paused();
        }
        if self.task.is_canceled() {
            return Err(TaskError::Canceled);
        }
        Ok(())
    }
}

/// Invoke a body callback, turning errors and panics into a task error.
pub(crate) fn invoke_guarded<T>(
    task: &Task,
    call: impl FnOnce() -> Result<T, TaskError>,
) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(TaskError::Canceled)) if task.is_canceled() => None,
        Ok(Err(e)) => {
            task.set_error(e.to_string());
            None
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Task {{{}}} panicked: {}", task.name(), message);
            task.set_error(TaskError::Panicked(message).to_string());
            None
        }
    }
}
