use cotask::scheduler::{ResourceSpec, WorkerPriority};
use cotask::task::descendants;
use cotask::{
    AppResourcePool, RecordingEventHandler, Scheduler, SchedulerConfig, SchedulerEvent,
    SchedulerEventHandler, Task, TaskBody, TaskContext, TaskError, TaskFlags, TaskId, TaskResourceUsage, TaskState,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

fn config(threads: usize) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.idle_interval_ms = 5;
    config.resources.max_threads = Some(threads);
    config
}

async fn run_to_idle(scheduler: &mut Scheduler) {
    tokio::time::timeout(Duration::from_secs(30), scheduler.run_until_idle())
        .await
        .expect("scheduler did not become idle");
}

async fn tick_until(scheduler: &mut Scheduler, condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        scheduler.tick();
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Body that tracks how many copies of it run at the same time
fn counted_task(name: String, sleep: Duration, current: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Task {
    Task::from_fn(name, move |_| {
        let now = current.fetch_add(1, Ordering::AcqRel) + 1;
        peak.fetch_max(now, Ordering::AcqRel);
        thread::sleep(sleep);
        current.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    })
}

/// Body that waits at checkpoints until released or canceled
fn held_task(name: &str, release: Arc<AtomicBool>) -> Task {
    Task::from_fn(name, move |ctx| {
        while !release.load(Ordering::Acquire) {
            ctx.checkpoint()?;
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    })
}

#[tokio::test]
async fn test_prepare_stage_resource_starvation() {
    let pool = Arc::new(AppResourcePool::new(4));
    let slot = pool.register(&ResourceSpec::new("R", 1)).unwrap();
    let mut scheduler = Scheduler::with_resource_pool(config(4), pool.clone()).unwrap();

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for i in 0..2 {
        let task = Task::builder(
            format!("holder-{i}"),
            cotask::task::FnBody::new({
                let current = current.clone();
                let peak = peak.clone();
                move |_: &TaskContext| {
                    let now = current.fetch_add(1, Ordering::AcqRel) + 1;
                    peak.fetch_max(now, Ordering::AcqRel);
                    thread::sleep(Duration::from_millis(20));
                    current.fetch_sub(1, Ordering::AcqRel);
                    Ok(())
                }
            }),
        )
        .resource(TaskResourceUsage::prepare_stage("R", 1))
        .build();
        scheduler.register_top_level_task(task.clone()).unwrap();
        tasks.push(task);
    }

    scheduler.tick();
    assert_eq!(slot.in_use(), 1);
    assert_eq!(tasks[1].state(), TaskState::New);
    assert_eq!(tasks[1].description(), "Waiting for resource 'R', count: 1");

    run_to_idle(&mut scheduler).await;

    assert!(tasks.iter().all(|t| t.is_finished() && !t.has_error()));
    assert_eq!(peak.load(Ordering::Acquire), 1);
    assert_eq!(slot.in_use(), 0);
    assert_eq!(tasks[1].description(), "");
}

struct RelayParent {
    seed: Option<Task>,
    remaining: usize,
    seen_on: Arc<Mutex<Vec<ThreadId>>>,
}

impl TaskBody for RelayParent {
    fn prepare(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        if let Some(seed) = self.seed.take() {
            ctx.add_subtask(seed)?;
        }
        Ok(())
    }

    fn on_subtask_finished(&mut self, _ctx: &TaskContext, _subtask: &Task) -> Vec<Task> {
        self.seen_on.lock().push(thread::current().id());
        if self.remaining == 0 {
            return Vec::new();
        }
        self.remaining -= 1;
        vec![Task::from_fn(format!("found-{}", self.remaining), |_| Ok(()))]
    }
}

#[tokio::test]
async fn test_message_loop_relay_discovers_subtasks_on_worker() {
    let mut scheduler = Scheduler::new(config(2)).unwrap();
    let seen_on = Arc::new(Mutex::new(Vec::new()));
    let parent = Task::builder(
        "relay",
        RelayParent {
            seed: Some(Task::from_fn("seed", |_| Ok(()))),
            remaining: 3,
            seen_on: seen_on.clone(),
        },
    )
    .flags(
        TaskFlags::RUN_MESSAGE_LOOP_ONLY
            | TaskFlags::RUN_BEFORE_SUBTASKS_FINISHED
            | TaskFlags::NO_AUTO_DELETE,
    )
    .build();

    scheduler.register_top_level_task(parent.clone()).unwrap();
    run_to_idle(&mut scheduler).await;

    assert!(parent.is_finished());
    assert!(!parent.has_error());
    assert_eq!(parent.subtask_count(), 4);
    assert!(parent.subtasks().iter().all(Task::is_finished));

    let seen_on = seen_on.lock();
    assert_eq!(seen_on.len(), 4);
    let coordinator = thread::current().id();
    assert!(seen_on.iter().all(|id| *id != coordinator));
    assert!(seen_on.iter().all(|id| *id == seen_on[0]));
}

/// Answers the relay slowly, once
struct SlowRelayParent {
    seed: Option<Task>,
    answered: bool,
}

impl TaskBody for SlowRelayParent {
    fn prepare(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        if let Some(seed) = self.seed.take() {
            ctx.add_subtask(seed)?;
        }
        Ok(())
    }

    fn on_subtask_finished(&mut self, _ctx: &TaskContext, _subtask: &Task) -> Vec<Task> {
        thread::sleep(Duration::from_millis(50));
        if std::mem::replace(&mut self.answered, true) {
            return Vec::new();
        }
        vec![Task::from_fn("late", |_| Ok(()))]
    }
}

/// Stalls the coordinator when the watched task reaches 100%
struct SlowObserver {
    watched: TaskId,
}

impl SchedulerEventHandler for SlowObserver {
    fn handle_event(&self, event: &SchedulerEvent) -> anyhow::Result<()> {
        if let SchedulerEvent::TaskProgressChanged {
            task,
            progress: 100,
        } = event
            && task.id() == self.watched
        {
            thread::sleep(Duration::from_millis(300));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_slow_relay_answer_is_not_lost() {
    let mut scheduler = Scheduler::new(config(2)).unwrap();
    let parent = Task::builder(
        "relay",
        SlowRelayParent {
            seed: Some(Task::from_fn("seed", |_| Ok(()))),
            answered: false,
        },
    )
    .flags(
        TaskFlags::RUN_MESSAGE_LOOP_ONLY
            | TaskFlags::RUN_BEFORE_SUBTASKS_FINISHED
            | TaskFlags::NO_AUTO_DELETE,
    )
    .build();
    scheduler.add_event_handler(Box::new(SlowObserver {
        watched: parent.id(),
    }));

    scheduler.register_top_level_task(parent.clone()).unwrap();
    run_to_idle(&mut scheduler).await;

    assert!(parent.is_finished());
    assert!(!parent.has_error());
    let names: Vec<String> = parent
        .subtasks()
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    assert_eq!(names, vec!["seed".to_string(), "late".to_string()]);
    assert!(parent.subtasks().iter().all(Task::is_finished));
}

#[tokio::test]
async fn test_timeout_cancels_with_error() {
    let mut scheduler = Scheduler::new(config(2)).unwrap();
    let task = Task::builder(
        "sluggish",
        cotask::task::FnBody::new(|ctx: &TaskContext| {
            while !ctx.should_stop() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }),
    )
    .timeout(Duration::from_secs(1))
    .build();

    scheduler.register_top_level_task(task.clone()).unwrap();
    run_to_idle(&mut scheduler).await;

    assert!(task.is_finished());
    assert!(task.is_canceled());
    let error = task.error().unwrap();
    assert!(error.starts_with("Timeout error, running"), "{error}");
    assert!(error.ends_with("expected 1 sec."), "{error}");
}

#[tokio::test]
async fn test_cancellation_cascades_through_paused_relay() {
    let mut scheduler = Scheduler::new(config(4)).unwrap();
    // message-loop leaf holding its body until canceled
    let leaf = Task::builder(
        "leaf",
        cotask::task::FnBody::new(|ctx: &TaskContext| {
            loop {
                ctx.checkpoint()?;
                thread::sleep(Duration::from_millis(1));
            }
        }),
    )
    .flags(TaskFlags::RUN_MESSAGE_LOOP_ONLY)
    .build();
    let relay = Task::builder("relay", cotask::task::NoopBody)
        .flags(TaskFlags::RUN_MESSAGE_LOOP_ONLY | TaskFlags::RUN_BEFORE_SUBTASKS_FINISHED)
        .subtask(leaf.clone())
        .build();
    let mid = Task::group("mid", TaskFlags::empty())
        .subtask(relay.clone())
        .build();
    let root = Task::group("root", TaskFlags::VERBOSE_ON_TASK_CANCEL)
        .subtask(mid.clone())
        .build();

    scheduler.register_top_level_task(root.clone()).unwrap();
    // the relay's message loop starts before its child runs
    tick_until(&mut scheduler, || leaf.is_running()).await;
    let registry = scheduler.thread_registry();
    tick_until(&mut scheduler, || registry.thread_for_task(leaf.id()).is_some()).await;

    assert!(scheduler.pause_thread_with_task(&leaf));
    assert!(scheduler.pause_thread_with_task(&relay));
    assert!(scheduler.is_thread_paused(&leaf));
    assert!(scheduler.is_thread_paused(&relay));

    scheduler.cancel_task(&root);
    assert!(!scheduler.is_thread_paused(&leaf));
    assert!(!scheduler.is_thread_paused(&relay));
    run_to_idle(&mut scheduler).await;

    for task in [&root, &mid, &relay, &leaf] {
        assert!(task.is_finished(), "{} not finished", task.name());
        assert!(task.is_canceled(), "{} not canceled", task.name());
        assert!(!task.has_error(), "{} has error", task.name());
    }
    assert!(scheduler.thread_for_task(leaf.id()).is_none());
    assert!(scheduler.thread_for_task(relay.id()).is_none());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_parallel_cap_with_random_durations() {
    let mut scheduler = Scheduler::new(config(8)).unwrap();
    let recorder = RecordingEventHandler::new();
    scheduler.add_event_handler(Box::new(recorder.clone()));

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut rng = rand::rng();
    let mut root = Task::group("root", TaskFlags::NO_AUTO_DELETE).parallel_subtasks(2);
    for i in 0..6 {
        let sleep = Duration::from_millis(rng.random_range(1..10));
        root = root.subtask(counted_task(
            format!("child-{i}"),
            sleep,
            current.clone(),
            peak.clone(),
        ));
    }
    let root = root.build();

    scheduler.register_top_level_task(root.clone()).unwrap();
    run_to_idle(&mut scheduler).await;

    assert!(root.is_finished());
    assert!(peak.load(Ordering::Acquire) <= 2);

    // replay admissions: never more than two children active at once
    let child_ids: Vec<TaskId> = descendants(&root).iter().map(Task::id).collect();
    let mut active = 0usize;
    let mut max_active = 0usize;
    for event in recorder.events() {
        if let SchedulerEvent::TaskStateChanged { task, state } = event {
            if !child_ids.contains(&task.id()) {
                continue;
            }
            match state {
                TaskState::Prepared => active += 1,
                TaskState::Finished => active -= 1,
                _ => {}
            }
            max_active = max_active.max(active);
        }
    }
    assert_eq!(max_active, 2);
}

#[tokio::test]
async fn test_idle_notification_once() {
    let mut scheduler = Scheduler::new(config(2)).unwrap();
    let recorder = RecordingEventHandler::new();
    scheduler.add_event_handler(Box::new(recorder.clone()));

    for i in 0..3 {
        scheduler
            .register_top_level_task(Task::from_fn(format!("task-{i}"), |_| Ok(())))
            .unwrap();
    }
    run_to_idle(&mut scheduler).await;
    scheduler.tick();
    scheduler.tick();

    assert_eq!(
        recorder.count(|e| matches!(e, SchedulerEvent::NoTasksInScheduler)),
        1
    );
    assert!(scheduler.is_idle());
}

#[tokio::test]
async fn test_weighted_progress_of_parent() {
    let mut scheduler = Scheduler::new(config(4)).unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let heavy = Task::builder(
        "heavy",
        cotask::task::FnBody::new(|ctx: &TaskContext| {
            ctx.set_progress(100);
            Ok(())
        }),
    )
    .progress_weight(3.0)
    .build();
    let light = held_task("light", release.clone());
    let root = Task::group("root", TaskFlags::empty())
        .subtask(heavy.clone())
        .subtask(light.clone())
        .build();

    scheduler.register_top_level_task(root.clone()).unwrap();
    tick_until(&mut scheduler, || heavy.is_finished() && root.progress() == 75).await;
    assert_eq!(light.progress(), 0);

    release.store(true, Ordering::Release);
    run_to_idle(&mut scheduler).await;
    assert_eq!(root.progress(), 100);
}

#[tokio::test]
async fn test_resources_balance_after_mixed_outcomes() {
    let pool = Arc::new(AppResourcePool::new(2));
    let mem = pool
        .register(&ResourceSpec {
            suffix: Some("Mb".to_string()),
            ..ResourceSpec::new("mem", 4)
        })
        .unwrap();
    let db = pool.register(&ResourceSpec::new("db", 1)).unwrap();
    let threads = pool.threads().unwrap();
    let mut scheduler = Scheduler::with_resource_pool(config(2), pool.clone()).unwrap();

    let ok = Task::builder("ok", cotask::task::NoopBody)
        .resource(TaskResourceUsage::run_stage("mem", 2))
        .resource(TaskResourceUsage::prepare_stage("db", 1))
        .build();
    let failing = Task::builder(
        "failing",
        cotask::task::FnBody::new(|_: &TaskContext| Err(TaskError::failed("boom"))),
    )
    .resource(TaskResourceUsage::run_stage("mem", 2))
    .build();
    let greedy = Task::builder("greedy", cotask::task::NoopBody)
        .resource(TaskResourceUsage::run_stage("mem", 8))
        .build();
    let canceled = held_task("canceled", Arc::new(AtomicBool::new(false)));
    let missing = Task::builder("missing", cotask::task::NoopBody)
        .resource(TaskResourceUsage::prepare_stage("gpu", 1))
        .build();

    for task in [&ok, &failing, &greedy, &canceled, &missing] {
        scheduler.register_top_level_task(task.clone()).unwrap();
    }
    tick_until(&mut scheduler, || canceled.is_running()).await;
    scheduler.cancel_task(&canceled);
    run_to_idle(&mut scheduler).await;

    assert!(!ok.has_error());
    assert_eq!(failing.error().as_deref(), Some("boom"));
    assert_eq!(
        greedy.error().as_deref(),
        Some("Not enough resources for the task, resource name: 'mem' max: 4Mb requested: 8Mb")
    );
    assert_eq!(
        missing.error().as_deref(),
        Some("No required resources for the task, resource id: 'gpu'")
    );
    assert!(canceled.is_canceled());

    assert_eq!(mem.in_use(), 0);
    assert_eq!(db.in_use(), 0);
    assert_eq!(threads.in_use(), 0);
}

#[tokio::test]
async fn test_state_changes_are_monotonic() {
    let mut scheduler = Scheduler::new(config(3)).unwrap();
    let recorder = RecordingEventHandler::new();
    scheduler.add_event_handler(Box::new(recorder.clone()));

    let root = Task::group("root", TaskFlags::FAIL_ON_SUBTASK_PROBLEMS)
        .subtask(Task::from_fn("a", |_| Ok(())))
        .subtask(
            Task::group("nested", TaskFlags::empty())
                .subtask(Task::from_fn("b", |_| Ok(())))
                .subtask(Task::from_fn("c", |_| Err(TaskError::failed("c failed"))))
                .build(),
        )
        .subtask(
            Task::builder("inline", cotask::task::NoopBody)
                .flags(TaskFlags::RUN_IN_MAIN_THREAD)
                .build(),
        )
        .build();
    let members: Vec<Task> = std::iter::once(root.clone())
        .chain(descendants(&root))
        .collect();

    scheduler.register_top_level_task(root.clone()).unwrap();
    run_to_idle(&mut scheduler).await;

    let mut history: HashMap<TaskId, Vec<TaskState>> = HashMap::new();
    for event in recorder.events() {
        if let SchedulerEvent::TaskStateChanged { task, state } = event {
            history.entry(task.id()).or_default().push(state);
        }
    }
    for task in &members {
        let states = &history[&task.id()];
        assert!(
            states.windows(2).all(|w| w[0] < w[1]),
            "{}: {:?}",
            task.name(),
            states
        );
        assert_eq!(states.last(), Some(&TaskState::Finished), "{}", task.name());
    }
    // nested has no FAIL flag, so the failure stops there
    assert!(!root.has_error());
}

#[tokio::test]
async fn test_run_until_shutdown_and_priorities() {
    let mut config = config(2);
    config.priority_rebalance_ticks = 1;
    config.long_running_threshold_secs = 0;
    let mut scheduler = Scheduler::new(config).unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let task = held_task("long", release.clone());

    scheduler.register_top_level_task(task.clone()).unwrap();
    tick_until(&mut scheduler, || task.is_running()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    scheduler.tick();
    assert_eq!(
        scheduler.worker_priority(task.id()),
        Some(WorkerPriority::Lowest)
    );

    let shutdown = tokio::time::sleep(Duration::from_millis(30));
    scheduler.run(shutdown).await;
    assert!(task.is_running());

    release.store(true, Ordering::Release);
    run_to_idle(&mut scheduler).await;
    assert!(task.is_finished());
}
