//! Non-blocking acquisition and release of a task's resources.
//!
//! Resources are locked in two stages. Prepare-stage requirements are taken
//! when the task is admitted and held until it finishes; run-stage
//! requirements (plus one unit of the thread resource) are taken right before
//! the body runs and released as soon as it returns.

use crate::resource::{Resource, ResourcePool};
use crate::task::{Task, TaskFlags, TaskState};
use std::sync::Arc;
use tracing::error;

/// Which group of requirements to lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockStage {
    Prepare,
    Run,
}

impl LockStage {
    fn matches(self, prepare_stage_lock: bool) -> bool {
        prepare_stage_lock == (self == LockStage::Prepare)
    }

    /// Run-stage locking also takes a thread slot, except for message-loop tasks
    fn needs_thread(self, task: &Task) -> bool {
        self == LockStage::Run && !task.has_flags(TaskFlags::RUN_MESSAGE_LOOP_ONLY)
    }
}

fn amount_text(resource: &dyn Resource, amount: usize) -> String {
    format!("{}{}", amount, resource.suffix())
}

/// Try to lock every requirement of `stage`.
///
/// On failure nothing acquired by this call stays held and the returned text
/// describes what is missing. If the requirement can never be satisfied the
/// task's error is set as well; otherwise the caller retries later.
pub(crate) fn try_lock_resources(
    pool: &dyn ResourcePool,
    threads: &Arc<dyn Resource>,
    task: &Task,
    stage: LockStage,
) -> Result<(), String> {
    let state = task.state();
    let legal = match stage {
        LockStage::Prepare => state == TaskState::New,
        LockStage::Run => matches!(state, TaskState::Prepared | TaskState::Running),
    };
    if !legal {
        error!(
            "Attempt to lock {:?}-stage resources of {{{}}} in state {}",
            stage,
            task.name(),
            state
        );
        return Err("Internal error".to_string());
    }

    let thread_needed = stage.needs_thread(task);
    if thread_needed && !threads.try_acquire(1) {
        return Err(format!(
            "Waiting for resource '{}', count: {}",
            threads.name(),
            amount_text(threads.as_ref(), 1)
        ));
    }

    let mut usages = task.resources_mut();
    let mut acquired: Vec<(Arc<dyn Resource>, usize)> = Vec::new();
    let mut failure = None;

    for usage in usages.iter_mut() {
        if !stage.matches(usage.prepare_stage_lock) {
            continue;
        }
        let Some(resource) = pool.resource(&usage.resource_id) else {
            task.set_error(format!(
                "No required resources for the task, resource id: '{}'",
                usage.resource_id
            ));
            failure = Some("Unable to run the task because a required resource was not found".to_string());
            break;
        };

        if resource.try_acquire(usage.amount) {
            usage.locked = true;
            acquired.push((resource, usage.amount));
            continue;
        }

        if resource.max_task_use() < usage.amount {
            let mut message = format!(
                "Not enough resources for the task, resource name: '{}' max: {} requested: {}",
                resource.name(),
                amount_text(resource.as_ref(), resource.max_task_use()),
                amount_text(resource.as_ref(), usage.amount)
            );
            if let Some(custom) = &usage.error_message {
                error!("{}", message);
                message = custom.clone();
            }
            task.set_error(message);
        }
        failure = Some(format!(
            "Waiting for resource '{}', count: {}",
            resource.name(),
            amount_text(resource.as_ref(), usage.amount)
        ));
        break;
    }

    let Some(message) = failure else {
        return Ok(());
    };

    for usage in usages.iter_mut() {
        if stage.matches(usage.prepare_stage_lock) {
            usage.locked = false;
        }
    }
    for (resource, amount) in acquired {
        resource.release(amount);
    }
    if thread_needed {
        threads.release(1);
    }
    Err(message)
}

/// Release everything `stage` locked earlier. The caller tracks whether the
/// stage is held; entries not marked as locked are skipped.
pub(crate) fn release_resources(
    pool: &dyn ResourcePool,
    threads: &Arc<dyn Resource>,
    task: &Task,
    stage: LockStage,
) {
    if stage.needs_thread(task) {
        threads.release(1);
    }
    for usage in task.resources_mut().iter_mut() {
        if !stage.matches(usage.prepare_stage_lock) || !usage.locked {
            continue;
        }
        match pool.resource(&usage.resource_id) {
            Some(resource) => resource.release(usage.amount),
            None => error!(
                "Resource '{}' disappeared while held by {{{}}}",
                usage.resource_id,
                task.name()
            ),
        }
        usage.locked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{AppResourcePool, RESOURCE_THREAD, ResourceSemaphore};
    use crate::scheduler::config::ResourceSpec;
    use crate::task::{NoopBody, TaskResourceUsage};

    fn pool_with(id: &str, capacity: usize) -> (AppResourcePool, Arc<dyn Resource>) {
        let pool = AppResourcePool::new(2);
        pool.register(&ResourceSpec::new(id, capacity)).unwrap();
        let threads = pool.resource(RESOURCE_THREAD).unwrap();
        (pool, threads)
    }

    fn semaphore(pool: &AppResourcePool, id: &str) -> Arc<ResourceSemaphore> {
        pool.semaphore(id).unwrap()
    }

    #[test]
    fn test_prepare_stage_lock_and_release() {
        let (pool, threads) = pool_with("mem", 4);
        let task = Task::builder("t", NoopBody)
            .resource(TaskResourceUsage::prepare_stage("mem", 3))
            .build();

        assert!(try_lock_resources(&pool, &threads, &task, LockStage::Prepare).is_ok());
        assert_eq!(semaphore(&pool, "mem").in_use(), 3);
        // prepare stage never takes a thread
        assert_eq!(semaphore(&pool, RESOURCE_THREAD).in_use(), 0);

        task.set_state(TaskState::Finished);
        release_resources(&pool, &threads, &task, LockStage::Prepare);
        assert!(task.resources().iter().all(|u| !u.locked));
        assert_eq!(semaphore(&pool, "mem").in_use(), 0);
    }

    #[test]
    fn test_waiting_rolls_back_partial_locks() {
        let (pool, threads) = pool_with("a", 1);
        pool.register(&ResourceSpec::new("b", 1)).unwrap();
        assert!(semaphore(&pool, "b").try_acquire(1));

        let task = Task::builder("t", NoopBody)
            .resource(TaskResourceUsage::run_stage("a", 1))
            .resource(TaskResourceUsage::run_stage("b", 1))
            .build();
        task.set_state(TaskState::Prepared);

        let err = try_lock_resources(&pool, &threads, &task, LockStage::Run).unwrap_err();
        assert_eq!(err, "Waiting for resource 'b', count: 1");
        assert!(!task.has_error());
        assert_eq!(semaphore(&pool, "a").in_use(), 0);
        assert_eq!(semaphore(&pool, RESOURCE_THREAD).in_use(), 0);
        assert!(task.resources().iter().all(|u| !u.locked));
    }

    #[test]
    fn test_missing_resource_sets_error() {
        let (pool, threads) = pool_with("a", 1);
        let task = Task::builder("t", NoopBody)
            .resource(TaskResourceUsage::prepare_stage("gpu", 1))
            .build();

        assert!(try_lock_resources(&pool, &threads, &task, LockStage::Prepare).is_err());
        assert_eq!(
            task.error().as_deref(),
            Some("No required resources for the task, resource id: 'gpu'")
        );
    }

    #[test]
    fn test_over_capacity_uses_custom_message() {
        let (pool, threads) = pool_with("mem", 2);
        let plain = Task::builder("plain", NoopBody)
            .resource(TaskResourceUsage::prepare_stage("mem", 5))
            .build();
        let custom = Task::builder("custom", NoopBody)
            .resource(TaskResourceUsage::prepare_stage("mem", 5).with_error_message("Too big"))
            .build();

        assert!(try_lock_resources(&pool, &threads, &plain, LockStage::Prepare).is_err());
        assert_eq!(
            plain.error().as_deref(),
            Some("Not enough resources for the task, resource name: 'mem' max: 2 requested: 5")
        );
        assert!(try_lock_resources(&pool, &threads, &custom, LockStage::Prepare).is_err());
        assert_eq!(custom.error().as_deref(), Some("Too big"));
    }

    #[test]
    fn test_message_loop_task_skips_thread_slot() {
        let (pool, threads) = pool_with("a", 1);
        let task = Task::builder("loop", NoopBody)
            .flags(TaskFlags::RUN_MESSAGE_LOOP_ONLY)
            .build();
        task.set_state(TaskState::Prepared);
        assert!(semaphore(&pool, RESOURCE_THREAD).try_acquire(2));

        assert!(try_lock_resources(&pool, &threads, &task, LockStage::Run).is_ok());
        task.set_state(TaskState::Running);
        release_resources(&pool, &threads, &task, LockStage::Run);
        assert_eq!(semaphore(&pool, RESOURCE_THREAD).in_use(), 2);
    }

    #[test]
    fn test_thread_starvation_message() {
        let (pool, threads) = pool_with("a", 1);
        assert!(semaphore(&pool, RESOURCE_THREAD).try_acquire(2));
        let task = Task::new("t", NoopBody);
        task.set_state(TaskState::Prepared);

        let err = try_lock_resources(&pool, &threads, &task, LockStage::Run).unwrap_err();
        assert_eq!(err, "Waiting for resource 'Threads', count: 1");
    }
}
