use crate::task::handle::Task;
use crate::task::types::*;
use serde::Serialize;

/// Counts of a task's direct subtasks per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubtaskStateCounts {
    pub new: usize,
    pub prepared: usize,
    pub running: usize,
    pub finished: usize,
}

impl SubtaskStateCounts {
    pub fn of(task: &Task) -> Self {
        let mut counts = Self::default();
        for sub in task.subtasks() {
            match sub.state() {
                TaskState::New => counts.new += 1,
                TaskState::Prepared => counts.prepared += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Finished => counts.finished += 1,
            }
        }
        counts
    }

    pub fn active(&self) -> usize {
        self.prepared + self.running
    }

    pub fn total(&self) -> usize {
        self.new + self.prepared + self.running + self.finished
    }
}

/// Statistics for a whole task tree
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskTreeStatistics {
    pub total_tasks: u32,
    pub new_tasks: u32,
    pub prepared_tasks: u32,
    pub running_tasks: u32,
    pub finished_tasks: u32,
    pub failed_tasks: u32,
    pub canceled_tasks: u32,
    pub warnings: u32,
}

impl TaskTreeStatistics {
    /// Collect statistics over `root` and all of its descendants
    pub fn collect(root: &Task) -> Self {
        let mut stats = Self::default();
        walk(root, &mut |task| stats.add(task));
        stats
    }

    /// Collect statistics over a flat list of tasks, e.g. members of a tree
    /// captured before it was detached
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self::default();
        for task in tasks {
            stats.add(task);
        }
        stats
    }

    fn add(&mut self, task: &Task) {
        self.total_tasks += 1;
        match task.state() {
            TaskState::New => self.new_tasks += 1,
            TaskState::Prepared => self.prepared_tasks += 1,
            TaskState::Running => self.running_tasks += 1,
            TaskState::Finished => self.finished_tasks += 1,
        }
        if task.is_canceled() {
            self.canceled_tasks += 1;
        } else if task.has_error() {
            self.failed_tasks += 1;
        }
        self.warnings += task.warnings().len() as u32;
    }

    /// Share of finished tasks in percent
    pub fn completion_percentage(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.finished_tasks as f64 / self.total_tasks as f64 * 100.0
        }
    }
}

/// Depth-first pre-order traversal
pub fn walk(root: &Task, visit: &mut dyn FnMut(&Task)) {
    visit(root);
    for sub in root.subtasks() {
        walk(&sub, visit);
    }
}

/// All descendants of `root`, excluding `root` itself
pub fn descendants(root: &Task) -> Vec<Task> {
    let mut result = Vec::new();
    for sub in root.subtasks() {
        walk(&sub, &mut |task| result.push(task.clone()));
    }
    result
}

/// Structural problems in a tree: broken parent links and finished tasks
/// with unfinished children.
pub fn validate_tree(root: &Task) -> Vec<String> {
    let mut issues = Vec::new();
    walk(root, &mut |task| {
        for sub in task.subtasks() {
            if sub.parent().as_ref() != Some(task) {
                issues.push(format!(
                    "Task {} lists {} as subtask but the parent link differs",
                    task.name(),
                    sub.name()
                ));
            }
            if task.is_finished() && !sub.is_finished() {
                issues.push(format!(
                    "Task {} is finished while subtask {} is {}",
                    task.name(),
                    sub.name(),
                    sub.state()
                ));
            }
        }
    });
    issues
}
