use crate::task::body::{NoopBody, TaskBody};
use crate::task::types::*;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to a unit of work.
///
/// Cloning is cheap and every clone refers to the same task. A parent holds
/// strong handles to its subtasks; the back-link to the parent is weak.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: TaskId,
    name: String,
    flags: TaskFlags,
    num_parallel_subtasks: usize,
    timeout: Option<Duration>,
    progress_management: ProgressManagement,
    subtask_progress_weight: f32,
    state: AtomicU8,
    cancel_flag: AtomicBool,
    deleted: AtomicBool,
    state_info: Mutex<TaskStateInfo>,
    time_info: Mutex<TaskTimeInfo>,
    parent: Mutex<Weak<TaskInner>>,
    subtasks: Mutex<Vec<Task>>,
    resources: Mutex<Vec<TaskResourceUsage>>,
    body: Mutex<Option<Box<dyn TaskBody>>>,
}

/// Builder for [`Task`]
pub struct TaskBuilder {
    name: String,
    body: Box<dyn TaskBody>,
    flags: TaskFlags,
    num_parallel_subtasks: usize,
    timeout: Option<Duration>,
    progress_management: ProgressManagement,
    subtask_progress_weight: f32,
    resources: Vec<TaskResourceUsage>,
    subtasks: Vec<Task>,
}

impl TaskBuilder {
    pub fn flags(mut self, flags: TaskFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Only the first `n` not-yet-started subtasks may be active at once
    pub fn parallel_subtasks(mut self, n: usize) -> Self {
        self.num_parallel_subtasks = n.max(1);
        self
    }

    /// Cancel the task with an error once it has been running this long.
    /// A zero duration means no timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn progress_management(mut self, management: ProgressManagement) -> Self {
        self.progress_management = management;
        self
    }

    /// Weight of this task in its parent's progress average
    pub fn progress_weight(mut self, weight: f32) -> Self {
        self.subtask_progress_weight = weight.max(0.0);
        self
    }

    pub fn resource(mut self, usage: TaskResourceUsage) -> Self {
        self.resources.push(usage);
        self
    }

    pub fn subtask(mut self, subtask: Task) -> Self {
        self.subtasks.push(subtask);
        self
    }

    pub fn build(self) -> Task {
        let task = Task {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                name: self.name,
                flags: self.flags,
                num_parallel_subtasks: self.num_parallel_subtasks,
                timeout: self.timeout,
                progress_management: self.progress_management,
                subtask_progress_weight: self.subtask_progress_weight,
                state: AtomicU8::new(TaskState::New as u8),
                cancel_flag: AtomicBool::new(false),
                deleted: AtomicBool::new(false),
                state_info: Mutex::new(TaskStateInfo::default()),
                time_info: Mutex::new(TaskTimeInfo::default()),
                parent: Mutex::new(Weak::new()),
                subtasks: Mutex::new(Vec::new()),
                resources: Mutex::new(self.resources),
                body: Mutex::new(Some(self.body)),
            }),
        };
        for subtask in self.subtasks {
            // Freshly built tasks are always `New`, so only foreign parents can fail here.
            if let Err(e) = task.add_subtask(subtask) {
                tracing::warn!("Dropping subtask while building {}: {}", task.name(), e);
            }
        }
        task
    }
}

impl Task {
    /// Start building a task with the given body
    pub fn builder(name: impl Into<String>, body: impl TaskBody) -> TaskBuilder {
        TaskBuilder {
            name: name.into(),
            body: Box::new(body),
            flags: TaskFlags::empty(),
            num_parallel_subtasks: usize::MAX,
            timeout: None,
            progress_management: ProgressManagement::default(),
            subtask_progress_weight: 1.0,
            resources: Vec::new(),
            subtasks: Vec::new(),
        }
    }

    /// Create a task with default settings
    pub fn new(name: impl Into<String>, body: impl TaskBody) -> Self {
        Self::builder(name, body).build()
    }

    /// A task without a body of its own, useful as a container for subtasks
    pub fn group(name: impl Into<String>, flags: TaskFlags) -> TaskBuilder {
        Self::builder(name, NoopBody).flags(flags | TaskFlags::NO_RUN)
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn flags(&self) -> TaskFlags {
        self.inner.flags
    }

    pub fn has_flags(&self, flags: TaskFlags) -> bool {
        self.inner.flags.contains(flags)
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_new(&self) -> bool {
        self.state() == TaskState::New
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn num_parallel_subtasks(&self) -> usize {
        self.inner.num_parallel_subtasks
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn progress_management(&self) -> ProgressManagement {
        self.inner.progress_management
    }

    pub fn subtask_progress_weight(&self) -> f32 {
        self.inner.subtask_progress_weight
    }

    pub fn parent(&self) -> Option<Task> {
        self.inner.parent.lock().upgrade().map(|inner| Task { inner })
    }

    pub fn is_top_level(&self) -> bool {
        self.parent().is_none()
    }

    /// Root of the tree this task belongs to
    pub fn top_level_parent(&self) -> Task {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Snapshot of the subtask list, in insertion order
    pub fn subtasks(&self) -> Vec<Task> {
        self.inner.subtasks.lock().clone()
    }

    pub fn subtask_count(&self) -> usize {
        self.inner.subtasks.lock().len()
    }

    pub fn last_subtask(&self) -> Option<Task> {
        self.inner.subtasks.lock().last().cloned()
    }

    /// Attach a subtask while this task is still being set up.
    ///
    /// Subtasks discovered after preparation are delivered through
    /// [`TaskBody::on_subtask_finished`] instead.
    pub fn add_subtask(&self, subtask: Task) -> Result<(), TaskError> {
        if !self.is_new() {
            return Err(TaskError::InvalidState {
                task: self.name().to_string(),
                state: self.state(),
                operation: "add_subtask",
            });
        }
        self.attach_subtask(subtask)
    }

    /// Attach a subtask regardless of this task's state
    pub(crate) fn attach_subtask(&self, subtask: Task) -> Result<(), TaskError> {
        if subtask == *self {
            return Err(TaskError::AlreadyParented(subtask.name().to_string()));
        }
        if !subtask.is_new() {
            return Err(TaskError::InvalidState {
                task: subtask.name().to_string(),
                state: subtask.state(),
                operation: "attach as subtask",
            });
        }
        let mut parent = subtask.inner.parent.lock();
        if parent.upgrade().is_some() {
            return Err(TaskError::AlreadyParented(subtask.name().to_string()));
        }
        *parent = Arc::downgrade(&self.inner);
        drop(parent);
        self.inner.subtasks.lock().push(subtask);
        Ok(())
    }

    pub fn resources(&self) -> Vec<TaskResourceUsage> {
        self.inner.resources.lock().clone()
    }

    pub(crate) fn resources_mut(&self) -> MutexGuard<'_, Vec<TaskResourceUsage>> {
        self.inner.resources.lock()
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.inner.cancel_flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.cancel_flag.load(Ordering::Acquire)
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.inner.state_info.lock().set_error(error);
    }

    pub fn has_error(&self) -> bool {
        self.inner.state_info.lock().has_error()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state_info.lock().error.clone()
    }

    /// Canceled or failed
    pub fn is_stopped(&self) -> bool {
        self.is_canceled() || self.has_error()
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        self.inner.state_info.lock().warnings.push(warning.into());
    }

    pub fn warnings(&self) -> Vec<String> {
        self.inner.state_info.lock().warnings.clone()
    }

    pub fn has_warning(&self) -> bool {
        !self.inner.state_info.lock().warnings.is_empty()
    }

    pub fn description(&self) -> String {
        self.inner.state_info.lock().description.clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.inner.state_info.lock().description = description.into();
    }

    /// Progress in percent, 0..=100
    pub fn progress(&self) -> i32 {
        self.inner.state_info.lock().progress
    }

    pub fn set_progress(&self, progress: i32) {
        self.inner.state_info.lock().progress = progress.clamp(0, 100);
    }

    pub fn state_info(&self) -> TaskStateInfo {
        self.inner.state_info.lock().clone()
    }

    pub(crate) fn state_info_mut(&self) -> MutexGuard<'_, TaskStateInfo> {
        self.inner.state_info.lock()
    }

    pub fn time_info(&self) -> TaskTimeInfo {
        self.inner.time_info.lock().clone()
    }

    pub(crate) fn time_info_mut(&self) -> MutexGuard<'_, TaskTimeInfo> {
        self.inner.time_info.lock()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Lock the body, blocking until it is free
    pub(crate) fn body(&self) -> MutexGuard<'_, Option<Box<dyn TaskBody>>> {
        self.inner.body.lock()
    }

    /// Lock the body only if no other thread is executing it
    pub(crate) fn try_body(&self) -> Option<MutexGuard<'_, Option<Box<dyn TaskBody>>>> {
        self.inner.body.try_lock()
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    /// Release the subtree: children are detached and bodies dropped.
    pub(crate) fn delete_tree(&self) {
        let subtasks = std::mem::take(&mut *self.inner.subtasks.lock());
        for subtask in subtasks {
            subtask.delete_tree();
        }
        tracing::trace!("Deleting task: {}", self.name());
        self.inner.body.lock().take();
        self.inner.deleted.store(true, Ordering::Release);
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("flags", &self.flags())
            .field("canceled", &self.is_canceled())
            .field("error", &self.error())
            .finish()
    }
}
