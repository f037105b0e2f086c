use crate::task::{Task, TaskState};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Notifications emitted by the scheduler
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TopLevelTaskRegistered {
        task: Task,
    },
    TopLevelTaskUnregistered {
        task: Task,
    },
    TaskStateChanged {
        task: Task,
        state: TaskState,
    },
    TaskDescriptionChanged {
        task: Task,
        description: String,
    },
    TaskProgressChanged {
        task: Task,
        progress: i32,
    },
    /// Active, pending and newly registered sets all became empty
    NoTasksInScheduler,
    /// Every top-level task registered during start-up has finished
    ReadyToWork,
}

/// Handler for scheduler events
pub trait SchedulerEventHandler: Send {
    fn handle_event(&self, event: &SchedulerEvent) -> Result<()>;
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

impl SchedulerEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &SchedulerEvent) -> Result<()> {
        match event {
            SchedulerEvent::TopLevelTaskRegistered { task } => {
                debug!("Task registered: {} ({})", task.name(), task.id());
            }
            SchedulerEvent::TopLevelTaskUnregistered { task } => {
                debug!("Task unregistered: {} ({})", task.name(), task.id());
            }
            SchedulerEvent::TaskStateChanged { task, state } => {
                debug!("Task {} state: {}", task.name(), state);
            }
            SchedulerEvent::TaskDescriptionChanged { task, description } => {
                debug!("Task {} description: {}", task.name(), description);
            }
            SchedulerEvent::TaskProgressChanged { task, progress } => {
                debug!("Task {} progress: {}%", task.name(), progress);
            }
            SchedulerEvent::NoTasksInScheduler => {
                debug!("No tasks left in scheduler");
            }
            SchedulerEvent::ReadyToWork => {
                info!("Initial tasks finished, ready to work");
            }
        }
        Ok(())
    }
}

/// Handler that keeps every event, for inspection by tests and tools
#[derive(Clone, Default)]
pub struct RecordingEventHandler {
    events: Arc<Mutex<Vec<SchedulerEvent>>>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, matcher: impl Fn(&SchedulerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| matcher(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl SchedulerEventHandler for RecordingEventHandler {
    fn handle_event(&self, event: &SchedulerEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
