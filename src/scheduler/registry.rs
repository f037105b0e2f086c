use crate::task::TaskId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::{self, ThreadId};

/// OS thread executing a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskThreadHandle {
    pub thread_id: ThreadId,
    pub thread_name: Option<String>,
}

impl TaskThreadHandle {
    pub fn current() -> Self {
        let current = thread::current();
        Self {
            thread_id: current.id(),
            thread_name: current.name().map(str::to_string),
        }
    }
}

/// Task id to OS thread map. Every access goes through the one lock.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<TaskId, TaskThreadHandle>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread_id(&self, task_id: TaskId, handle: TaskThreadHandle) {
        self.threads.lock().insert(task_id, handle);
    }

    pub fn remove_thread_id(&self, task_id: TaskId) -> Option<TaskThreadHandle> {
        self.threads.lock().remove(&task_id)
    }

    pub fn thread_for_task(&self, task_id: TaskId) -> Option<TaskThreadHandle> {
        self.threads.lock().get(&task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }
}
