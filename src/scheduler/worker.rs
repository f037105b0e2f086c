//! Dedicated worker threads for running task bodies.
//!
//! A [`TaskThread`] runs its task's `run` once. Tasks flagged
//! `RUN_MESSAGE_LOOP_ONLY` keep the thread alive afterwards and serve
//! [`ThreadEvent`]s: the coordinator relays "a subtask finished, do you have
//! new work?" questions through a small mailbox so `on_subtask_finished` is
//! only ever called on the thread that owns the body.

use crate::scheduler::registry::{TaskThreadHandle, ThreadRegistry};
use crate::task::body::{TaskContext, invoke_guarded};
use crate::task::{Task, TaskFlags};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Relative priority of a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerPriority {
    /// Freshly started background work
    Low = 0,
    /// Work belonging to a long-running top-level task
    Lowest = 1,
}

impl WorkerPriority {
    fn from_u8(value: u8) -> Self {
        if value == WorkerPriority::Lowest as u8 {
            WorkerPriority::Lowest
        } else {
            WorkerPriority::Low
        }
    }
}

/// Events served by a message-loop thread
#[derive(Debug)]
pub(crate) enum ThreadEvent {
    /// Ask the task for new subtasks after `subtask` finished
    GetNewSubtasks(Task),
    TerminateMessageLoop,
    Pause,
}

/// Blocks a worker while it is paused
#[derive(Debug, Default)]
pub(crate) struct PauseGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PauseGate {
    pub(crate) fn request_pause(&self) {
        *self.paused.lock() = true;
    }

    pub(crate) fn resume(&self) {
        let mut paused = self.paused.lock();
        if *paused {
            *paused = false;
            self.resumed.notify_all();
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    pub(crate) fn wait_while_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }
}

/// Answer slot of the relay protocol
#[derive(Debug, Default)]
struct RelayMailbox {
    new_subtasks: Vec<Task>,
    obtained: bool,
    requests_in_flight: usize,
}

/// State shared between a worker thread and the coordinator
#[derive(Debug)]
pub(crate) struct WorkerShared {
    self_run_finished: AtomicBool,
    priority: AtomicU8,
    pause: PauseGate,
    mailbox: Mutex<RelayMailbox>,
    wakeup: Arc<Notify>,
}

impl WorkerShared {
    pub(crate) fn priority(&self) -> WorkerPriority {
        WorkerPriority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    pub(crate) fn pause_gate(&self) -> &PauseGate {
        &self.pause
    }
}

/// A worker thread owned by one active task
#[derive(Debug)]
pub(crate) struct TaskThread {
    task: Task,
    shared: Arc<WorkerShared>,
    events: Option<Sender<ThreadEvent>>,
    handle: Option<JoinHandle<()>>,
}

impl TaskThread {
    pub(crate) fn spawn(
        task: Task,
        registry: Arc<ThreadRegistry>,
        wakeup: Arc<Notify>,
        timer: Duration,
        priority: WorkerPriority,
    ) -> io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            self_run_finished: AtomicBool::new(false),
            priority: AtomicU8::new(priority as u8),
            pause: PauseGate::default(),
            mailbox: Mutex::new(RelayMailbox::default()),
            wakeup,
        });

        let (events, receiver) = if task.has_flags(TaskFlags::RUN_MESSAGE_LOOP_ONLY) {
            let (tx, rx) = mpsc::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let handle = thread::Builder::new()
            .name(format!("cotask-{}", task.id()))
            .spawn({
                let task = task.clone();
                let shared = shared.clone();
                move || thread_main(task, shared, registry, receiver, timer)
            })?;

        debug!("Started worker thread for task {{{}}}", task.name());
        Ok(Self {
            task,
            shared,
            events,
            handle: Some(handle),
        })
    }

    pub(crate) fn self_run_finished(&self) -> bool {
        self.shared.self_run_finished.load(Ordering::Acquire)
    }

    /// The OS thread has not exited yet
    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.shared.pause.is_paused()
    }

    pub(crate) fn pause(&self) {
        self.shared.pause.request_pause();
        self.post(ThreadEvent::Pause);
    }

    pub(crate) fn resume(&self) {
        self.shared.pause.resume();
    }

    pub(crate) fn priority(&self) -> WorkerPriority {
        self.shared.priority()
    }

    pub(crate) fn set_priority(&self, priority: WorkerPriority) {
        self.shared.priority.store(priority as u8, Ordering::Relaxed);
    }

    pub(crate) fn terminate_message_loop(&self) {
        self.post(ThreadEvent::TerminateMessageLoop);
    }

    /// Post a relay request; false if the loop is gone
    pub(crate) fn request_new_subtasks(&self, finished: Task) -> bool {
        self.shared.mailbox.lock().requests_in_flight += 1;
        if self.post(ThreadEvent::GetNewSubtasks(finished)) {
            return true;
        }
        let mut mailbox = self.shared.mailbox.lock();
        mailbox.requests_in_flight = mailbox.requests_in_flight.saturating_sub(1);
        false
    }

    /// Relay answers are outstanding and the loop can still deliver them, or
    /// an answer sits in the mailbox undrained
    pub(crate) fn relay_in_flight(&self) -> bool {
        let mailbox = self.shared.mailbox.lock();
        mailbox.obtained || (mailbox.requests_in_flight > 0 && self.is_running())
    }

    /// Drain relay answers, if any arrived
    pub(crate) fn take_new_subtasks(&self) -> Option<Vec<Task>> {
        let mut mailbox = self.shared.mailbox.lock();
        if !mailbox.obtained {
            return None;
        }
        mailbox.obtained = false;
        Some(std::mem::take(&mut mailbox.new_subtasks))
    }

    fn post(&self, event: ThreadEvent) -> bool {
        self.events
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    /// Resume if paused, stop the message loop, then wait for the thread to exit
    pub(crate) fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !handle.is_finished() {
            trace!("Waiting for the thread of {{{}}} before delete", self.task.name());
            self.shared.pause.resume();
            self.post(ThreadEvent::TerminateMessageLoop);
        }
        if handle.join().is_err() {
            self.task.set_error("Worker thread terminated abnormally");
        }
    }
}

impl Drop for TaskThread {
    fn drop(&mut self) {
        self.join();
    }
}

fn thread_main(
    task: Task,
    shared: Arc<WorkerShared>,
    registry: Arc<ThreadRegistry>,
    events: Option<Receiver<ThreadEvent>>,
    timer: Duration,
) {
    registry.add_thread_id(task.id(), TaskThreadHandle::current());
    let ctx = TaskContext::on_worker(task.clone(), shared.clone());

    {
        let mut body = task.body();
        if let Some(body) = body.as_mut() {
            invoke_guarded(&task, || body.run(&ctx));
        }
    }
    shared.self_run_finished.store(true, Ordering::Release);
    shared.wakeup.notify_one();

    if let Some(events) = events {
        message_loop(&task, &shared, &ctx, events, timer);
    }

    registry.remove_thread_id(task.id());
    shared.wakeup.notify_one();
}

fn message_loop(
    task: &Task,
    shared: &WorkerShared,
    ctx: &TaskContext,
    events: Receiver<ThreadEvent>,
    timer: Duration,
) {
    loop {
        match events.recv_timeout(timer) {
            Ok(ThreadEvent::GetNewSubtasks(finished)) => {
                let new_subtasks = {
                    let mut body = task.body();
                    match body.as_mut() {
                        Some(body) => invoke_guarded(task, || {
                            Ok(body.on_subtask_finished(ctx, &finished))
                        })
                        .unwrap_or_default(),
                        None => Vec::new(),
                    }
                };
                let mut mailbox = shared.mailbox.lock();
                mailbox.new_subtasks.extend(new_subtasks);
                mailbox.obtained = true;
                mailbox.requests_in_flight = mailbox.requests_in_flight.saturating_sub(1);
                drop(mailbox);
                shared.wakeup.notify_one();
            }
            Ok(ThreadEvent::TerminateMessageLoop) => break,
            Ok(ThreadEvent::Pause) => shared.pause.wait_while_paused(),
            Err(RecvTimeoutError::Timeout) => {
                if task.is_stopped() {
                    trace!("Message loop of {{{}}} exits: task stopped", task.name());
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskBody, TaskFlags};

    struct Answering;

    impl TaskBody for Answering {
        fn on_subtask_finished(&mut self, _ctx: &TaskContext, _subtask: &Task) -> Vec<Task> {
            vec![Task::group("answer", TaskFlags::empty()).build()]
        }
    }

    fn relay_thread() -> TaskThread {
        let task = Task::builder("relay", Answering)
            .flags(TaskFlags::RUN_MESSAGE_LOOP_ONLY)
            .build();
        TaskThread::spawn(
            task,
            Arc::new(ThreadRegistry::new()),
            Arc::new(Notify::new()),
            Duration::from_millis(1),
            WorkerPriority::Low,
        )
        .unwrap()
    }

    #[test]
    fn test_undrained_answer_outlives_the_loop() {
        let mut thread = relay_thread();
        let finished = Task::group("done", TaskFlags::empty()).build();
        assert!(thread.request_new_subtasks(finished));
        thread.terminate_message_loop();
        thread.join();

        assert!(!thread.is_running());
        assert!(thread.relay_in_flight());

        let answer = thread.take_new_subtasks().unwrap();
        assert_eq!(answer.len(), 1);
        assert_eq!(answer[0].name(), "answer");
        assert!(!thread.relay_in_flight());
    }

    #[test]
    fn test_request_after_exit_is_rolled_back() {
        let mut thread = relay_thread();
        thread.terminate_message_loop();
        thread.join();

        let finished = Task::group("late", TaskFlags::empty()).build();
        assert!(!thread.request_new_subtasks(finished));
        assert!(!thread.relay_in_flight());
        assert!(thread.take_new_subtasks().is_none());
    }
}
