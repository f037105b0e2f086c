use crate::scheduler::worker::TaskThread;
use crate::task::{Task, TaskId};

/// Scheduler-side bookkeeping for one active task.
///
/// Lives in the scheduler's arena from admission until the task is promoted
/// to `Finished`. Dropping it joins the owned worker thread, if any.
#[derive(Debug)]
pub(crate) struct TaskInfo {
    pub task: Task,
    pub parent: Option<TaskId>,
    pub thread: Option<TaskThread>,

    pub num_prepared_subtasks: usize,
    pub num_running_subtasks: usize,
    pub num_finished_subtasks: usize,

    pub self_run_finished: bool,
    pub has_locked_prepare_resources: bool,
    pub has_locked_run_resources: bool,
    pub was_prepared: bool,
    pub subtasks_were_canceled: bool,

    /// Known subtasks not admitted yet, in list order
    pub new_subtasks: Vec<Task>,
    /// Finished subtasks not yet reported to this task's body because the
    /// body was busy on its worker thread
    pub unreported_subtasks: Vec<Task>,

    pub prev_progress: i32,
    pub prev_description: String,
}

impl TaskInfo {
    pub fn new(task: Task, parent: Option<TaskId>) -> Self {
        let prev_progress = task.progress();
        let prev_description = task.description();
        Self {
            task,
            parent,
            thread: None,
            num_prepared_subtasks: 0,
            num_running_subtasks: 0,
            num_finished_subtasks: 0,
            self_run_finished: false,
            has_locked_prepare_resources: false,
            has_locked_run_resources: false,
            was_prepared: false,
            subtasks_were_canceled: false,
            new_subtasks: Vec::new(),
            unreported_subtasks: Vec::new(),
            prev_progress,
            prev_description,
        }
    }

    pub fn num_active_subtasks(&self) -> usize {
        self.num_prepared_subtasks + self.num_running_subtasks
    }

    /// Pick up completion of the body on the worker thread
    pub fn poll_thread(&mut self) -> bool {
        if self.self_run_finished {
            return false;
        }
        let done = self
            .thread
            .as_ref()
            .is_some_and(|t| t.self_run_finished() || !t.is_running());
        if done {
            self.self_run_finished = true;
        }
        done
    }

    /// Subtasks may still appear: a relay answer or a deferred
    /// `on_subtask_finished` call is outstanding
    pub fn discovery_pending(&self) -> bool {
        !self.unreported_subtasks.is_empty()
            || self.thread.as_ref().is_some_and(|t| t.relay_in_flight())
    }

    /// Child of a message-loop task whose relay thread is paused
    pub fn relay_paused(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| t.is_paused())
    }
}
