use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Unique identifier for tasks
pub type TaskId = u64;

/// Identifier of a named counting resource in the resource pool
pub type ResourceId = String;

/// Lifecycle state of a task. Transitions are strictly increasing.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    New = 0,
    Prepared = 1,
    Running = 2,
    Finished = 3,
}

impl TaskState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::New,
            1 => TaskState::Prepared,
            2 => TaskState::Running,
            _ => TaskState::Finished,
        }
    }

    /// Human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::New => "New",
            TaskState::Prepared => "Prepared",
            TaskState::Running => "Running",
            TaskState::Finished => "Finished",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Behavior flags the scheduler consults for a task.
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TaskFlags: u32 {
        /// Skip body execution entirely.
        const NO_RUN = 1;
        /// Execute `run` inline on the coordinator thread.
        const RUN_IN_MAIN_THREAD = 1 << 1;
        /// The body may start before all known subtasks finished.
        const RUN_BEFORE_SUBTASKS_FINISHED = 1 << 2;
        /// After `run`, keep the worker thread alive as a relay for subtask discovery.
        const RUN_MESSAGE_LOOP_ONLY = 1 << 3;
        const FAIL_ON_SUBTASK_ERROR = 1 << 4;
        const CANCEL_ON_SUBTASK_CANCEL = 1 << 5;
        const FAIL_ON_SUBTASK_CANCEL = 1 << 6;
        const COLLECT_CHILDREN_WARNINGS = 1 << 7;
        /// The tree is left intact when the top-level task is unregistered.
        const NO_AUTO_DELETE = 1 << 8;
        /// Log start and finish of a top-level task at info level.
        const VERBOSE_LOG_MODE = 1 << 9;
        /// Log cancellation of a top-level task at info level.
        const VERBOSE_ON_TASK_CANCEL = 1 << 10;
        /// Copy a failed child's error verbatim instead of wrapping it.
        const MINIMIZE_SUBTASK_ERROR_TEXT = 1 << 11;
        /// Mirror the description of the last subtask.
        const DESCRIPTION_FROM_SUBTASK = 1 << 12;

        /// Sensible default for tasks that aggregate their children.
        const FAIL_ON_SUBTASK_PROBLEMS = Self::FAIL_ON_SUBTASK_ERROR.bits()
            | Self::FAIL_ON_SUBTASK_CANCEL.bits();
    }
}

/// How a task's progress value is maintained
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProgressManagement {
    /// The task body sets progress itself
    Manual,
    /// Weighted average of the subtasks' progress
    #[default]
    SubtasksBased,
}

/// Outcome of a `report` call
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportResult {
    Finished,
    CallMeAgain,
}

/// One resource requirement of a task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskResourceUsage {
    pub resource_id: ResourceId,
    pub amount: usize,
    /// Locked during admission (`prepare`) rather than right before `run`
    pub prepare_stage_lock: bool,
    /// Whether `amount` units are currently held
    #[serde(skip)]
    pub locked: bool,
    /// Replaces the generic over-capacity error text
    pub error_message: Option<String>,
}

impl TaskResourceUsage {
    /// Requirement locked right before `run`
    pub fn run_stage(resource_id: impl Into<ResourceId>, amount: usize) -> Self {
        Self {
            resource_id: resource_id.into(),
            amount,
            prepare_stage_lock: false,
            locked: false,
            error_message: None,
        }
    }

    /// Requirement locked when the task is admitted
    pub fn prepare_stage(resource_id: impl Into<ResourceId>, amount: usize) -> Self {
        Self {
            prepare_stage_lock: true,
            ..Self::run_stage(resource_id, amount)
        }
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Wall-clock bookkeeping of a task
#[derive(Clone, Debug, Default)]
pub struct TaskTimeInfo {
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    /// Monotonic start, used for timeouts and priority aging
    pub(crate) started_at: Option<Instant>,
}

impl TaskTimeInfo {
    /// Seconds since the task was promoted to `Running`
    pub fn elapsed_secs(&self) -> Option<u64> {
        self.started_at.map(|started| started.elapsed().as_secs())
    }
}

/// Mutable run-state shared between the coordinator and the task body
#[derive(Clone, Debug, Default)]
pub struct TaskStateInfo {
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub description: String,
    pub progress: i32,
}

impl TaskStateInfo {
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Keeps the first error; later errors are ignored
    pub fn set_error(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            let error = error.into();
            self.error = Some(if error.is_empty() {
                "Unknown error".to_string()
            } else {
                error
            });
        }
    }

    pub fn insert_warnings(&mut self, warnings: &[String]) {
        self.warnings.extend(warnings.iter().cloned());
    }
}

/// Errors returned by task bodies and task-tree operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Allocation failure inside a body
    #[error("There is not enough memory to finish the task.")]
    OutOfMemory,

    /// The body failed with a domain message
    #[error("{0}")]
    Failed(String),

    /// The body observed cancellation and bailed out
    #[error("Task was canceled")]
    Canceled,

    /// A tree operation is not allowed in the task's current state
    #[error("Task {task} is in state {state}, operation not allowed: {operation}")]
    InvalidState {
        task: String,
        state: TaskState,
        operation: &'static str,
    },

    /// The subtask already belongs to a tree
    #[error("Task {0} already has a parent")]
    AlreadyParented(String),

    /// A body panicked; the payload text is kept when available
    #[error("Task body panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}
