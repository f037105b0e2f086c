//! The coordinator: admits, runs, polls and retires tasks on every tick.
//!
//! All task state transitions happen here, on the thread calling
//! [`Scheduler::tick`]. Worker threads only run bodies and answer relay
//! requests; the coordinator polls them instead of blocking.

use crate::resource::{AppResourcePool, RESOURCE_THREAD, Resource, ResourceError, ResourcePool};
use crate::scheduler::config::SchedulerConfig;
use crate::scheduler::events::{SchedulerEvent, SchedulerEventHandler};
use crate::scheduler::info::TaskInfo;
use crate::scheduler::locks::{LockStage, release_resources, try_lock_resources};
use crate::scheduler::progress;
use crate::scheduler::registry::{TaskThreadHandle, ThreadRegistry};
use crate::scheduler::worker::{TaskThread, WorkerPriority};
use crate::task::body::{TaskContext, invoke_guarded};
use crate::task::tree::{SubtaskStateCounts, walk};
use crate::task::{ReportResult, Task, TaskFlags, TaskId, TaskState};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

/// Collaborator bugs are logged; debug builds also abort on them.
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            tracing::error!($($arg)+);
            debug_assert!($cond, $($arg)+);
        }
    };
}

/// Errors returned by the scheduler's registration API
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Trying to register task in not New state: {name} ({state})")]
    NotNew { name: String, state: TaskState },

    #[error("Task is already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Task {0} has a parent and cannot be registered as top-level")]
    NotTopLevel(String),

    #[error("Task {0} is not a registered top-level task")]
    NotRegistered(String),

    #[error("Resource pool has no '{}' resource", RESOURCE_THREAD)]
    MissingThreadResource,

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Cooperative coordinator for hierarchical tasks
pub struct Scheduler {
    config: SchedulerConfig,
    pool: Arc<dyn ResourcePool>,
    threads: Arc<dyn Resource>,

    top_level_tasks: Vec<Task>,
    /// Registered top-level tasks waiting for admission
    new_tasks: Vec<Task>,
    /// Top-level tasks registered before the first one was unregistered
    loading_tasks: Vec<Task>,
    state_is_loaded: bool,

    infos: HashMap<TaskId, TaskInfo>,
    /// Active task ids in admission order
    queue: Vec<TaskId>,
    tasks_with_new_subtasks: Vec<TaskId>,
    /// Unregistered trees whose deletion waits for their tasks to leave the active set
    pending_deletes: Vec<Task>,

    registry: Arc<ThreadRegistry>,
    handlers: Vec<Box<dyn SchedulerEventHandler>>,
    wakeup: Arc<Notify>,
    state_changes_observed: bool,
    idle_reported: bool,
    ticks_until_rebalance: u32,
}

impl Scheduler {
    /// Scheduler with an [`AppResourcePool`] built from `config.resources`
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let pool = Arc::new(AppResourcePool::with_config(&config.resources)?);
        Self::with_resource_pool(config, pool)
    }

    /// Scheduler over an external resource pool, which must provide
    /// the thread resource
    pub fn with_resource_pool(
        config: SchedulerConfig,
        pool: Arc<dyn ResourcePool>,
    ) -> Result<Self, SchedulerError> {
        let threads = pool
            .resource(RESOURCE_THREAD)
            .ok_or(SchedulerError::MissingThreadResource)?;
        let ticks_until_rebalance = config.priority_rebalance_ticks.max(1);
        Ok(Self {
            config,
            pool,
            threads,
            top_level_tasks: Vec::new(),
            new_tasks: Vec::new(),
            loading_tasks: Vec::new(),
            state_is_loaded: false,
            infos: HashMap::new(),
            queue: Vec::new(),
            tasks_with_new_subtasks: Vec::new(),
            pending_deletes: Vec::new(),
            registry: Arc::new(ThreadRegistry::new()),
            handlers: Vec::new(),
            wakeup: Arc::new(Notify::new()),
            state_changes_observed: false,
            idle_reported: false,
            ticks_until_rebalance,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn resource_pool(&self) -> &Arc<dyn ResourcePool> {
        &self.pool
    }

    /// Add event handler
    pub fn add_event_handler(&mut self, handler: Box<dyn SchedulerEventHandler>) {
        self.handlers.push(handler);
    }

    fn emit(&self, event: SchedulerEvent) {
        for handler in &self.handlers {
            if let Err(e) = handler.handle_event(&event) {
                error!("Event handler error: {}", e);
            }
        }
    }

    pub fn register_top_level_task(&mut self, task: Task) -> Result<(), SchedulerError> {
        if task.state() != TaskState::New {
            return Err(SchedulerError::NotNew {
                name: task.name().to_string(),
                state: task.state(),
            });
        }
        if self.top_level_tasks.contains(&task) {
            return Err(SchedulerError::AlreadyRegistered(task.name().to_string()));
        }
        if !task.is_top_level() {
            return Err(SchedulerError::NotTopLevel(task.name().to_string()));
        }

        debug!("Registering new task: {}", task.name());
        self.top_level_tasks.push(task.clone());
        self.emit(SchedulerEvent::TopLevelTaskRegistered { task: task.clone() });
        if !self.state_is_loaded {
            self.loading_tasks.push(task.clone());
        }
        self.new_tasks.push(task);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Stop the task tree, waiting for its worker threads, and forget it.
    /// Unless flagged `NO_AUTO_DELETE` the tree is deleted once none of its
    /// tasks is active any more.
    pub fn unregister_top_level_task(&mut self, task: &Task) -> Result<(), SchedulerError> {
        let Some(position) = self.top_level_tasks.iter().position(|t| t == task) else {
            return Err(SchedulerError::NotRegistered(task.name().to_string()));
        };

        trace!("Unregistering task: {}", task.name());
        self.stop_task(task);
        self.top_level_tasks.remove(position);
        self.new_tasks.retain(|t| t != task);
        if !self.state_is_loaded {
            self.loading_tasks.retain(|t| t != task);
            if self.loading_tasks.is_empty() {
                self.state_is_loaded = true;
                self.emit(SchedulerEvent::ReadyToWork);
            }
        }

        self.emit(SchedulerEvent::TopLevelTaskUnregistered { task: task.clone() });

        if !task.has_flags(TaskFlags::NO_AUTO_DELETE) {
            if self.subtree_active(task) {
                self.pending_deletes.push(task.clone());
            } else {
                task.delete_tree();
            }
        }
        Ok(())
    }

    fn stop_task(&mut self, task: &Task) {
        for sub in task.subtasks() {
            self.stop_task(&sub);
        }
        if !self.infos.contains_key(&task.id()) {
            return;
        }
        self.cancel_task(task);
        if let Some(thread) = self
            .infos
            .get_mut(&task.id())
            .and_then(|ti| ti.thread.as_mut())
            && thread.is_running()
        {
            thread.join();
        }
    }

    fn subtree_active(&self, task: &Task) -> bool {
        let mut active = false;
        walk(task, &mut |t| active |= self.infos.contains_key(&t.id()));
        active
    }

    /// Request cancellation of `task` and its whole subtree.
    /// Paused worker threads are resumed so they can observe it.
    pub fn cancel_task(&self, task: &Task) {
        if task.state() < TaskState::Finished {
            info!("Canceling task: {}", task.name());
            task.cancel();
            self.resume_thread_with_task(task);
            for sub in task.subtasks() {
                self.cancel_task(&sub);
            }
        }
    }

    pub fn cancel_all_tasks(&self) {
        for task in &self.top_level_tasks {
            self.cancel_task(task);
        }
    }

    /// Pause the worker thread of an active task. Message loops block at
    /// once; run bodies block at their next [`TaskContext::checkpoint`].
    pub fn pause_thread_with_task(&self, task: &Task) -> bool {
        match self.thread_of(task) {
            Some(thread) if thread.is_running() => {
                debug!("Pausing thread of task {{{}}}", task.name());
                thread.pause();
                true
            }
            _ => false,
        }
    }

    pub fn resume_thread_with_task(&self, task: &Task) {
        if let Some(thread) = self.thread_of(task)
            && thread.is_paused()
        {
            debug!("Resuming thread of task {{{}}}", task.name());
            thread.resume();
        }
    }

    pub fn is_thread_paused(&self, task: &Task) -> bool {
        self.thread_of(task).is_some_and(|t| t.is_paused())
    }

    fn thread_of(&self, task: &Task) -> Option<&TaskThread> {
        self.infos.get(&task.id()).and_then(|ti| ti.thread.as_ref())
    }

    pub fn top_level_tasks(&self) -> &[Task] {
        &self.top_level_tasks
    }

    pub fn top_level_task_by_id(&self, id: TaskId) -> Option<Task> {
        self.top_level_tasks.iter().find(|t| t.id() == id).cloned()
    }

    pub fn state_name(&self, task: &Task) -> &'static str {
        task.state().name()
    }

    /// Linear extrapolation from elapsed time and progress; running tasks only
    pub fn estimated_finish_time(&self, task: &Task) -> Option<DateTime<Utc>> {
        if !task.is_running() {
            warn!("Estimated finish time is only known for running tasks");
            return None;
        }
        let elapsed = task.time_info().started_at?.elapsed().as_secs_f64();
        let progress = f64::from(task.progress());
        if progress <= 0.0 || elapsed <= 0.0 {
            return None;
        }
        let total = elapsed * 100.0 / progress;
        let left = TimeDelta::milliseconds(((total - elapsed) * 1000.0) as i64);
        Some(Utc::now() + left)
    }

    pub fn active_task_count(&self) -> usize {
        self.infos.len()
    }

    pub fn is_active(&self, task: &Task) -> bool {
        self.infos.contains_key(&task.id())
    }

    /// No active, pending or newly registered tasks
    pub fn is_idle(&self) -> bool {
        self.infos.is_empty() && self.tasks_with_new_subtasks.is_empty() && self.new_tasks.is_empty()
    }

    /// The top-level tasks registered during start-up have all finished
    pub fn is_ready_to_work(&self) -> bool {
        self.state_is_loaded
    }

    pub fn worker_priority(&self, task_id: TaskId) -> Option<WorkerPriority> {
        self.infos
            .get(&task_id)
            .and_then(|ti| ti.thread.as_ref())
            .map(|t| t.priority())
    }

    pub fn thread_registry(&self) -> Arc<ThreadRegistry> {
        self.registry.clone()
    }

    pub fn add_thread_id(&self, task_id: TaskId, handle: TaskThreadHandle) {
        self.registry.add_thread_id(task_id, handle);
    }

    pub fn remove_thread_id(&self, task_id: TaskId) -> Option<TaskThreadHandle> {
        self.registry.remove_thread_id(task_id)
    }

    pub fn thread_for_task(&self, task_id: TaskId) -> Option<TaskThreadHandle> {
        self.registry.thread_for_task(task_id)
    }

    /// One scheduling pass. Returns true if any state change was observed,
    /// in which case the next tick should follow immediately.
    pub fn tick(&mut self) -> bool {
        self.state_changes_observed = false;

        if self.process_finished_tasks() {
            self.unregister_finished_top_level_tasks();
        }
        self.process_pending_deletes();
        self.process_new_subtasks();
        self.prepare_new_tasks();
        self.run_ready();
        self.update_old_tasks_priority();

        if self.is_idle() {
            if !self.idle_reported {
                self.idle_reported = true;
                self.emit(SchedulerEvent::NoTasksInScheduler);
            }
        } else {
            self.idle_reported = false;
        }

        std::mem::take(&mut self.state_changes_observed)
    }

    /// Tick until every registered task has finished
    pub async fn run_until_idle(&mut self) {
        loop {
            let changed = self.tick();
            if self.is_idle() {
                break;
            }
            self.wait_next_tick(changed).await;
        }
    }

    /// Tick until `shutdown` completes
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) {
        tokio::pin!(shutdown);
        loop {
            let changed = self.tick();
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.wait_next_tick(changed) => {}
            }
        }
    }

    async fn wait_next_tick(&self, changed: bool) {
        if changed {
            tokio::task::yield_now().await;
            return;
        }
        let _ = tokio::time::timeout(self.config.idle_interval(), self.wakeup.notified()).await;
    }

    fn process_finished_tasks(&mut self) -> bool {
        let mut has_finished = false;
        let ids: Vec<TaskId> = self.queue.iter().rev().copied().collect();
        for id in ids {
            if self.process_active_task(id) {
                has_finished = true;
            }
        }
        has_finished
    }

    /// Poll one active task; true if it finished
    fn process_active_task(&mut self, id: TaskId) -> bool {
        let Some(ti) = self.infos.get(&id) else {
            return false;
        };
        let task = ti.task.clone();
        let parent_id = ti.parent;
        invariant!(
            !task.is_finished(),
            "Finished task {{{}}} is still active",
            task.name()
        );

        self.check_timeout(&task);

        let cascade = task.is_canceled()
            && self
                .infos
                .get_mut(&id)
                .is_some_and(|ti| !std::mem::replace(&mut ti.subtasks_were_canceled, true));
        if cascade {
            for sub in task.subtasks() {
                self.cancel_task(&sub);
            }
        }

        if task.state() != TaskState::Running {
            return false;
        }

        if let Some(ti) = self.infos.get_mut(&id) {
            if ti.poll_thread() {
                self.state_changes_observed = true;
            }
            if ti.self_run_finished && ti.has_locked_run_resources {
                release_resources(self.pool.as_ref(), &self.threads, &task, LockStage::Run);
                ti.has_locked_run_resources = false;
            }
        }

        self.collect_relay_answers(id);
        self.deliver_unreported_subtasks(id);
        self.update_progress(id);

        if !self.ready_to_finish(id) {
            return false;
        }

        let was_prepared = self.infos.get(&id).is_some_and(|ti| ti.was_prepared);
        if was_prepared && call_report(&task) == ReportResult::CallMeAgain {
            return false;
        }

        if let Some(pid) = parent_id
            && self.infos.get(&pid).is_some_and(|p| {
                p.task.has_flags(TaskFlags::RUN_MESSAGE_LOOP_ONLY) && p.relay_paused()
            })
        {
            return false;
        }

        self.promote_task(id, TaskState::Finished);
        let Some(mut ti) = self.take_info(id) else {
            return true;
        };
        if ti.has_locked_prepare_resources {
            release_resources(self.pool.as_ref(), &self.threads, &task, LockStage::Prepare);
            ti.has_locked_prepare_resources = false;
        }
        if task.has_flags(TaskFlags::RUN_MESSAGE_LOOP_ONLY)
            && let Some(thread) = &ti.thread
        {
            thread.terminate_message_loop();
        }
        drop(ti);

        if let Some(pid) = parent_id {
            self.propagate_state_to_parent(&task);
            self.notify_parent(pid, &task);
        }
        true
    }

    fn check_timeout(&self, task: &Task) {
        let Some(timeout) = task.timeout() else {
            return;
        };
        if task.is_canceled() {
            return;
        }
        let Some(started) = task.time_info().started_at else {
            return;
        };
        let elapsed = started.elapsed();
        if elapsed > timeout {
            let message = format!(
                "Timeout error, running {} sec expected {} sec.",
                elapsed.as_secs(),
                timeout.as_secs()
            );
            error!("Task {{{}}} {} Cancelling task...", task.name(), message);
            task.set_error(message);
            self.cancel_task(task);
        }
    }

    fn ready_to_finish(&self, id: TaskId) -> bool {
        let Some(ti) = self.infos.get(&id) else {
            return false;
        };
        match ti.task.state() {
            TaskState::Finished => return true,
            TaskState::Running => {}
            _ => return false,
        }
        ti.num_finished_subtasks >= ti.task.subtask_count()
            && ti.self_run_finished
            && !ti.discovery_pending()
    }

    fn take_info(&mut self, id: TaskId) -> Option<TaskInfo> {
        self.queue.retain(|q| *q != id);
        self.tasks_with_new_subtasks.retain(|q| *q != id);
        self.infos.remove(&id)
    }

    fn unregister_finished_top_level_tasks(&mut self) {
        let finished: Vec<Task> = self
            .top_level_tasks
            .iter()
            .filter(|t| t.is_finished())
            .cloned()
            .collect();
        for task in finished {
            if let Err(e) = self.unregister_top_level_task(&task) {
                warn!("Cannot unregister finished task: {}", e);
            }
        }
    }

    fn process_pending_deletes(&mut self) {
        if self.pending_deletes.is_empty() {
            return;
        }
        for task in std::mem::take(&mut self.pending_deletes) {
            if self.subtree_active(&task) {
                self.pending_deletes.push(task);
            } else {
                task.delete_tree();
            }
        }
    }

    /// Admit deferred subtasks, up to each parent's free parallel slots
    fn process_new_subtasks(&mut self) {
        for pid in std::mem::take(&mut self.tasks_with_new_subtasks) {
            let Some(ti) = self.infos.get_mut(&pid) else {
                continue;
            };
            let free = ti
                .task
                .num_parallel_subtasks()
                .saturating_sub(ti.num_active_subtasks());
            let pending = std::mem::take(&mut ti.new_subtasks);

            let mut remaining = Vec::new();
            for (i, sub) in pending.into_iter().enumerate() {
                if i < free && self.add_to_priority_queue(sub.clone(), Some(pid)) {
                    continue;
                }
                remaining.push(sub);
            }

            if let Some(ti) = self.infos.get_mut(&pid) {
                remaining.append(&mut ti.new_subtasks);
                ti.new_subtasks = remaining;
                if !ti.new_subtasks.is_empty() && !self.tasks_with_new_subtasks.contains(&pid) {
                    self.tasks_with_new_subtasks.push(pid);
                }
            }
        }
    }

    /// Admit newly registered top-level tasks
    fn prepare_new_tasks(&mut self) {
        for task in std::mem::take(&mut self.new_tasks) {
            if task.is_stopped() {
                debug!("Task {{{}}} was stopped before admission", task.name());
                self.propagate_state_to_parent(&task);
                self.finish_unadmitted(&task);
                if self.top_level_tasks.contains(&task)
                    && let Err(e) = self.unregister_top_level_task(&task)
                {
                    warn!("Cannot unregister stopped task: {}", e);
                }
                continue;
            }
            if !self.add_to_priority_queue(task.clone(), None) {
                self.new_tasks.push(task);
            }
        }
    }

    /// Mark a never-admitted tree as finished
    fn finish_unadmitted(&mut self, task: &Task) {
        for sub in task.subtasks() {
            self.finish_unadmitted(&sub);
        }
        if task.is_finished() {
            return;
        }
        self.state_changes_observed = true;
        task.set_state(TaskState::Finished);
        task.time_info_mut().finish_time = Some(Utc::now());
        task.set_description("");
        trace!("Promoting task {{{}}} to 'Finished'", task.name());
        self.log_top_level_finish(task);
        self.emit(SchedulerEvent::TaskStateChanged {
            task: task.clone(),
            state: TaskState::Finished,
        });
    }

    /// Admission: lock prepare-stage resources, call `prepare`, then admit
    /// the first `num_parallel_subtasks` subtasks. Returns false if the task
    /// has to wait for resources and should be retried later.
    fn add_to_priority_queue(&mut self, task: Task, parent: Option<TaskId>) -> bool {
        if let Some(pid) = parent
            && self.infos.get(&pid).is_some_and(|p| p.task.is_stopped())
        {
            task.cancel();
        }

        let mut run_prepare = !task.is_stopped();
        let mut locked = false;
        if run_prepare {
            match try_lock_resources(self.pool.as_ref(), &self.threads, &task, LockStage::Prepare) {
                Ok(()) => {
                    locked = true;
                    if task.resources().iter().any(|u| u.prepare_stage_lock) {
                        task.set_description("");
                    }
                }
                Err(message) => {
                    task.set_description(message);
                    if !task.has_error() {
                        return false;
                    }
                    run_prepare = false;
                }
            }
        }

        debug!("Admitting task {{{}}}", task.name());
        let id = task.id();
        let mut ti = TaskInfo::new(task.clone(), parent);
        ti.has_locked_prepare_resources = locked;
        self.infos.insert(id, ti);
        self.queue.push(id);

        if run_prepare {
            call_prepare(&task);
            if let Some(ti) = self.infos.get_mut(&id) {
                ti.was_prepared = true;
            }
        }
        self.promote_task(id, TaskState::Prepared);

        let n_parallel = task.num_parallel_subtasks();
        for (i, sub) in task.subtasks().into_iter().enumerate() {
            if i < n_parallel && self.add_to_priority_queue(sub.clone(), Some(id)) {
                continue;
            }
            if let Some(ti) = self.infos.get_mut(&id) {
                ti.new_subtasks.push(sub);
            }
            if !self.tasks_with_new_subtasks.contains(&id) {
                self.tasks_with_new_subtasks.push(id);
            }
        }
        true
    }

    /// Dispatch bodies whose subtasks and resources allow it
    fn run_ready(&mut self) {
        for id in self.queue.clone() {
            let Some(ti) = self.infos.get(&id) else {
                continue;
            };
            let task = ti.task.clone();
            let has_thread = ti.thread.is_some();
            let self_run_finished = ti.self_run_finished;
            let num_finished_subtasks = ti.num_finished_subtasks;

            let state = task.state();
            invariant!(
                matches!(state, TaskState::Prepared | TaskState::Running),
                "Active task {{{}}} is in state '{}'",
                task.name(),
                state
            );
            if !matches!(state, TaskState::Prepared | TaskState::Running) {
                continue;
            }

            if task.has_flags(TaskFlags::NO_RUN) || task.is_stopped() {
                if state == TaskState::Prepared {
                    self.promote_task(id, TaskState::Running);
                }
                if !has_thread
                    && !self_run_finished
                    && let Some(ti) = self.infos.get_mut(&id)
                {
                    ti.self_run_finished = true;
                    self.state_changes_observed = true;
                }
                continue;
            }
            if has_thread || self_run_finished {
                continue;
            }

            let ready = task.has_flags(TaskFlags::RUN_BEFORE_SUBTASKS_FINISHED)
                || num_finished_subtasks >= task.subtask_count();
            if !ready {
                continue;
            }

            if let Err(message) =
                try_lock_resources(self.pool.as_ref(), &self.threads, &task, LockStage::Run)
            {
                task.set_description(message);
                continue;
            }
            if let Some(ti) = self.infos.get_mut(&id) {
                ti.has_locked_run_resources = true;
            }
            if state == TaskState::Prepared {
                self.promote_task(id, TaskState::Running);
            }
            task.set_description("");

            if task.has_flags(TaskFlags::RUN_IN_MAIN_THREAD) {
                call_run_inline(&task);
                if let Some(ti) = self.infos.get_mut(&id) {
                    ti.self_run_finished = true;
                }
            } else {
                self.run_thread(id, &task);
            }
        }
    }

    fn run_thread(&mut self, id: TaskId, task: &Task) {
        let priority = self.priority_for(task);
        let spawned = TaskThread::spawn(
            task.clone(),
            self.registry.clone(),
            self.wakeup.clone(),
            self.config.message_loop_timer(),
            priority,
        );
        let Some(ti) = self.infos.get_mut(&id) else {
            return;
        };
        match spawned {
            Ok(thread) => ti.thread = Some(thread),
            Err(e) => {
                error!("Cannot start a worker thread for {{{}}}: {}", task.name(), e);
                task.set_error(format!("Cannot start a worker thread: {e}"));
                ti.self_run_finished = true;
            }
        }
    }

    fn priority_for(&self, task: &Task) -> WorkerPriority {
        let elapsed = task
            .top_level_parent()
            .time_info()
            .started_at
            .map(|started| started.elapsed());
        if elapsed.is_some_and(|e| e > self.config.long_running_threshold()) {
            WorkerPriority::Lowest
        } else {
            WorkerPriority::Low
        }
    }

    /// Demote workers of long-running top-level tasks, every N-th tick
    fn update_old_tasks_priority(&mut self) {
        self.ticks_until_rebalance = self.ticks_until_rebalance.saturating_sub(1);
        if self.ticks_until_rebalance > 0 {
            return;
        }
        self.ticks_until_rebalance = self.config.priority_rebalance_ticks.max(1);

        for ti in self.infos.values() {
            let Some(thread) = &ti.thread else {
                continue;
            };
            if !ti.task.is_running() || !thread.is_running() {
                continue;
            }
            let priority = self.priority_for(&ti.task);
            if thread.priority() != priority {
                debug!(
                    "Changing worker priority of {{{}}} to {:?}",
                    ti.task.name(),
                    priority
                );
                thread.set_priority(priority);
            }
        }
    }

    /// Apply the parent's subtask-failure flags and collect warnings
    fn propagate_state_to_parent(&self, task: &Task) {
        let Some(parent) = task.parent() else {
            return;
        };
        if parent.is_stopped() {
            return;
        }

        let error = task.error().unwrap_or_default();
        if task.is_canceled() && parent.has_flags(TaskFlags::FAIL_ON_SUBTASK_CANCEL) {
            let message = format!("Subtask {{{}}} is canceled {}", task.name(), error);
            parent.set_error(message.trim_end());
        } else if task.is_canceled() && parent.has_flags(TaskFlags::CANCEL_ON_SUBTASK_CANCEL) {
            self.cancel_task(&parent);
        } else if task.has_error() && parent.has_flags(TaskFlags::FAIL_ON_SUBTASK_ERROR) {
            if parent.has_flags(TaskFlags::MINIMIZE_SUBTASK_ERROR_TEXT) {
                parent.set_error(error);
            } else {
                parent.set_error(format!("Subtask {{{}}} is failed: {}", task.name(), error));
            }
        }

        if task.is_finished()
            && parent.has_flags(TaskFlags::COLLECT_CHILDREN_WARNINGS)
            && task.has_warning()
        {
            let warnings = task.warnings();
            parent.state_info_mut().insert_warnings(&warnings);
        }
    }

    /// Ask the parent for subtasks discovered because `child` finished.
    /// Message-loop parents answer on their own thread.
    fn notify_parent(&mut self, pid: TaskId, child: &Task) {
        let Some(pti) = self.infos.get_mut(&pid) else {
            return;
        };
        if pti.task.has_flags(TaskFlags::RUN_MESSAGE_LOOP_ONLY)
            && let Some(thread) = &pti.thread
            && thread.request_new_subtasks(child.clone())
        {
            trace!("Asked message loop of {{{}}} for new subtasks", pti.task.name());
            return;
        }
        pti.unreported_subtasks.push(child.clone());
        self.deliver_unreported_subtasks(pid);
    }

    /// Call `on_subtask_finished` directly, unless the body is busy on its
    /// worker thread; then try again next tick
    fn deliver_unreported_subtasks(&mut self, id: TaskId) {
        let Some(ti) = self.infos.get_mut(&id) else {
            return;
        };
        if ti.unreported_subtasks.is_empty() {
            return;
        }
        let task = ti.task.clone();
        let Some(mut guard) = task.try_body() else {
            return;
        };
        let finished = std::mem::take(&mut ti.unreported_subtasks);

        let mut discovered = Vec::new();
        if let Some(body) = guard.as_mut() {
            let ctx = TaskContext::new(task.clone());
            for sub in &finished {
                if let Some(new) = invoke_guarded(&task, || Ok(body.on_subtask_finished(&ctx, sub))) {
                    discovered.extend(new);
                }
            }
        }
        drop(guard);
        self.accept_new_subtasks(id, discovered);
    }

    fn collect_relay_answers(&mut self, id: TaskId) {
        let Some(new) = self
            .infos
            .get(&id)
            .and_then(|ti| ti.thread.as_ref())
            .and_then(|thread| thread.take_new_subtasks())
        else {
            return;
        };
        self.state_changes_observed = true;
        self.accept_new_subtasks(id, new);
    }

    /// Attach discovered subtasks and queue them for admission.
    /// Entries that cannot become subtasks are logged and skipped.
    fn accept_new_subtasks(&mut self, id: TaskId, new_subtasks: Vec<Task>) {
        if new_subtasks.is_empty() {
            return;
        }
        let Some(ti) = self.infos.get_mut(&id) else {
            return;
        };
        let parent = ti.task.clone();
        for sub in new_subtasks {
            if let Err(e) = parent.attach_subtask(sub.clone()) {
                error!(
                    "on_subtask_finished of {{{}}} returned an unusable subtask {{{}}}, skipping: {}",
                    parent.name(),
                    sub.name(),
                    e
                );
                continue;
            }
            ti.new_subtasks.push(sub);
        }
        if !ti.new_subtasks.is_empty() && !self.tasks_with_new_subtasks.contains(&id) {
            self.tasks_with_new_subtasks.push(id);
        }
        self.state_changes_observed = true;
    }

    fn promote_task(&mut self, id: TaskId, new_state: TaskState) {
        self.state_changes_observed = true;
        let Some(ti) = self.infos.get(&id) else {
            return;
        };
        let task = ti.task.clone();
        let parent_id = ti.parent;
        let old_state = task.state();
        invariant!(
            new_state > old_state,
            "Task {{{}}} promoted from '{}' to '{}'",
            task.name(),
            old_state,
            new_state
        );
        if new_state <= old_state {
            return;
        }

        task.set_state(new_state);
        match task.error() {
            None => trace!("Promoting task {{{}}} to '{}'", task.name(), new_state),
            Some(e) => trace!(
                "Promoting task {{{}}} to '{}', error '{}'",
                task.name(),
                new_state,
                e
            ),
        }

        match new_state {
            TaskState::New => {}
            TaskState::Prepared => {
                if let Some(pti) = parent_id.and_then(|pid| self.infos.get_mut(&pid)) {
                    pti.num_prepared_subtasks += 1;
                }
                if task.is_top_level() && task.has_flags(TaskFlags::VERBOSE_LOG_MODE) {
                    info!("Starting {{{}}} task", task.name());
                }
            }
            TaskState::Running => {
                {
                    let mut time = task.time_info_mut();
                    time.start_time = Some(Utc::now());
                    time.started_at = Some(Instant::now());
                }
                let promote_parent = match parent_id.and_then(|pid| self.infos.get_mut(&pid)) {
                    Some(pti) => {
                        decrement(&mut pti.num_prepared_subtasks, "prepared", &pti.task);
                        pti.num_running_subtasks += 1;
                        pti.task.state() < TaskState::Running
                    }
                    None => false,
                };
                if let Some(pid) = parent_id
                    && promote_parent
                {
                    self.promote_task(pid, TaskState::Running);
                }
            }
            TaskState::Finished => {
                self.check_finished_state(id);
                task.time_info_mut().finish_time = Some(Utc::now());
                task.set_description("");
                if let Some(pti) = parent_id.and_then(|pid| self.infos.get_mut(&pid)) {
                    match old_state {
                        TaskState::Running => {
                            decrement(&mut pti.num_running_subtasks, "running", &pti.task)
                        }
                        TaskState::Prepared => {
                            decrement(&mut pti.num_prepared_subtasks, "prepared", &pti.task)
                        }
                        _ => {}
                    }
                    pti.num_finished_subtasks += 1;
                    invariant!(
                        pti.num_finished_subtasks <= pti.task.subtask_count(),
                        "Task {{{}}} has more finished subtasks than subtasks",
                        pti.task.name()
                    );
                }
                self.log_top_level_finish(&task);
            }
        }

        if cfg!(debug_assertions) {
            self.check_parent_counters(parent_id);
        }
        self.emit(SchedulerEvent::TaskStateChanged {
            task: task.clone(),
            state: new_state,
        });
        self.update_progress(id);
    }

    fn check_finished_state(&self, id: TaskId) {
        let Some(ti) = self.infos.get(&id) else {
            return;
        };
        for sub in ti.task.subtasks() {
            invariant!(
                sub.is_finished(),
                "Task {{{}}} finishes while subtask {{{}}} is '{}'",
                ti.task.name(),
                sub.name(),
                sub.state()
            );
        }
        invariant!(
            ti.new_subtasks.is_empty()
                && ti.num_finished_subtasks == ti.task.subtask_count()
                && ti.num_running_subtasks == 0
                && ti.num_prepared_subtasks == 0,
            "Task {{{}}} finishes with inconsistent subtask counters",
            ti.task.name()
        );
    }

    /// Cross-check the parent's counters against its subtasks' states
    fn check_parent_counters(&self, parent_id: Option<TaskId>) {
        let Some(pti) = parent_id.and_then(|pid| self.infos.get(&pid)) else {
            return;
        };
        let counts = SubtaskStateCounts::of(&pti.task);
        invariant!(
            counts.prepared == pti.num_prepared_subtasks
                && counts.running == pti.num_running_subtasks
                && counts.finished == pti.num_finished_subtasks,
            "Subtask counters of {{{}}} do not match subtask states: {:?}",
            pti.task.name(),
            counts
        );
        invariant!(
            counts.active() <= pti.task.num_parallel_subtasks(),
            "Task {{{}}} has {} active subtasks, limit is {}",
            pti.task.name(),
            counts.active(),
            pti.task.num_parallel_subtasks()
        );
    }

    fn log_top_level_finish(&self, task: &Task) {
        if !task.is_top_level() {
            return;
        }
        if task.is_canceled() {
            if task.has_flags(TaskFlags::VERBOSE_ON_TASK_CANCEL) {
                info!("Task {{{}}} canceled", task.name());
            }
        } else if let Some(error) = task.error() {
            error!("Task {{{}}} finished with error: {}", task.name(), error);
        } else if task.has_flags(TaskFlags::VERBOSE_LOG_MODE) {
            info!("Task {{{}}} finished", task.name());
        }
    }

    fn update_progress(&mut self, id: TaskId) {
        let epsilon = self.config.progress_weight_epsilon;
        let Some(ti) = self.infos.get_mut(&id) else {
            return;
        };
        let update = progress::refresh(ti, epsilon);
        let task = ti.task.clone();
        if let Some(description) = update.description {
            self.emit(SchedulerEvent::TaskDescriptionChanged {
                task: task.clone(),
                description,
            });
        }
        if let Some(progress) = update.progress {
            self.emit(SchedulerEvent::TaskProgressChanged { task, progress });
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.infos.is_empty() {
            warn!(
                "Scheduler dropped with {} active tasks, canceling them",
                self.infos.len()
            );
        }
        for ti in self.infos.values() {
            ti.task.cancel();
            if let Some(thread) = &ti.thread {
                thread.resume();
            }
        }
        self.queue.clear();
        // joins the worker threads
        self.infos.clear();
    }
}

fn decrement(counter: &mut usize, what: &str, task: &Task) {
    invariant!(
        *counter > 0,
        "Negative {} subtask counter of {{{}}}",
        what,
        task.name()
    );
    *counter = counter.saturating_sub(1);
}

fn call_prepare(task: &Task) {
    let mut guard = task.body();
    if let Some(body) = guard.as_mut() {
        let ctx = TaskContext::new(task.clone());
        invoke_guarded(task, || body.prepare(&ctx));
    }
}

fn call_run_inline(task: &Task) {
    let mut guard = task.body();
    if let Some(body) = guard.as_mut() {
        let ctx = TaskContext::new(task.clone());
        invoke_guarded(task, || body.run(&ctx));
    }
}

/// A body still busy on its worker thread asks to be called again
fn call_report(task: &Task) -> ReportResult {
    let Some(mut guard) = task.try_body() else {
        return ReportResult::CallMeAgain;
    };
    let Some(body) = guard.as_mut() else {
        return ReportResult::Finished;
    };
    let ctx = TaskContext::new(task.clone());
    invoke_guarded(task, || body.report(&ctx)).unwrap_or(ReportResult::Finished)
}
