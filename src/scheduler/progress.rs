//! Progress and description aggregation for active tasks.

use crate::scheduler::info::TaskInfo;
use crate::task::{ProgressManagement, Task, TaskFlags};

/// Changes detected by [`refresh`]; each is reported once
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct ProgressUpdate {
    pub description: Option<String>,
    pub progress: Option<i32>,
}

/// `round(sum(p_i * w_i) / (epsilon + sum(w_i)))`
pub(crate) fn weighted_progress(subtasks: &[Task], epsilon: f32) -> i32 {
    let (sum, weights) = subtasks.iter().fold((0.0f64, 0.0f64), |(sum, weights), sub| {
        let weight = f64::from(sub.subtask_progress_weight());
        (sum + f64::from(sub.progress()) * weight, weights + weight)
    });
    (sum / (f64::from(epsilon) + weights)).round() as i32
}

/// Recompute description and progress of `ti.task`
pub(crate) fn refresh(ti: &mut TaskInfo, epsilon: f32) -> ProgressUpdate {
    let task = &ti.task;
    let mut update = ProgressUpdate::default();

    if task.has_flags(TaskFlags::DESCRIPTION_FROM_SUBTASK) {
        if let Some(last) = task.last_subtask() {
            task.set_description(last.description());
        }
    }
    let description = task.description();
    if description != ti.prev_description {
        ti.prev_description = description.clone();
        update.description = Some(description);
    }

    let current = task.progress();
    let progress = if task.is_finished() {
        100
    } else {
        match task.progress_management() {
            ProgressManagement::Manual => current,
            ProgressManagement::SubtasksBased => {
                let subtasks = task.subtasks();
                // leaves and canceled tasks keep whatever they last reported
                if subtasks.is_empty() || task.is_canceled() {
                    current
                } else {
                    weighted_progress(&subtasks, epsilon)
                }
            }
        }
    };
    if progress != current {
        task.set_progress(progress);
    }
    if progress != ti.prev_progress {
        ti.prev_progress = progress;
        update.progress = Some(progress);
    }
    update
}
