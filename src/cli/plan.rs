//! Task plans for the `cotask` binary.
//!
//! A plan describes a forest of synthetic tasks that sleep, report progress
//! and optionally fail, so scheduling behavior can be exercised without
//! writing Rust:
//!
//! ```toml
//! [[tasks]]
//! name = "build"
//! flags = ["fail_on_subtask_error"]
//! parallel = 2
//!
//! [[tasks.children]]
//! name = "compile"
//! sleep_ms = 200
//! resources = [{ id = "cpu", amount = 1 }]
//! ```

use crate::scheduler::config::ResourceSpec;
use crate::task::{Task, TaskBody, TaskContext, TaskError, TaskFlags, TaskResourceUsage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    Toml,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Task '{task}' uses unknown flag '{flag}'")]
    UnknownFlag { task: String, flag: String },

    #[error("Plan contains a task without a name")]
    EmptyName,

    #[error("Plan contains no tasks")]
    NoTasks,
}

/// Root of a plan file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// Extra resources registered with the pool before the plan runs
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// One synthetic task and its children
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Total time the body sleeps
    #[serde(default)]
    pub sleep_ms: u64,
    /// Number of progress steps the sleep is split into
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Error text the body fails with after sleeping
    #[serde(default)]
    pub fail: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
    /// Flag names, e.g. `"no_run"` or `"FAIL_ON_SUBTASK_ERROR"`
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceUse>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Cap on concurrently active children
    #[serde(default)]
    pub parallel: Option<usize>,
    #[serde(default)]
    pub weight: Option<f32>,
    #[serde(default)]
    pub children: Vec<TaskSpec>,
}

fn default_steps() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStageSpec {
    Prepare,
    #[default]
    Run,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUse {
    pub id: String,
    #[serde(default = "default_amount")]
    pub amount: usize,
    #[serde(default)]
    pub stage: LockStageSpec,
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_amount() -> usize {
    1
}

impl Plan {
    pub fn load(path: &Path, format: PlanFormat) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read plan {:?}", path))?;
        let plan = match format {
            PlanFormat::Toml => Self::from_toml_str(&content)?,
            PlanFormat::Json => Self::from_json_str(&content)?,
        };
        debug!("Loaded plan {:?} with {} top-level tasks", path, plan.tasks.len());
        Ok(plan)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML plan")
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid JSON plan")
    }

    /// Build one task tree per top-level entry
    pub fn build_tasks(&self) -> Result<Vec<Task>, PlanError> {
        if self.tasks.is_empty() {
            return Err(PlanError::NoTasks);
        }
        self.tasks.iter().map(TaskSpec::build).collect()
    }
}

impl TaskSpec {
    pub fn task_flags(&self) -> Result<TaskFlags, PlanError> {
        let mut flags = TaskFlags::empty();
        for name in &self.flags {
            let normalized = name.trim().to_uppercase().replace('-', "_");
            let flag = TaskFlags::from_name(&normalized).ok_or_else(|| PlanError::UnknownFlag {
                task: self.name.clone(),
                flag: name.clone(),
            })?;
            flags |= flag;
        }
        Ok(flags)
    }

    pub fn build(&self) -> Result<Task, PlanError> {
        if self.name.trim().is_empty() {
            return Err(PlanError::EmptyName);
        }
        let body = SleepBody {
            duration: Duration::from_millis(self.sleep_ms),
            steps: self.steps.max(1),
            fail: self.fail.clone(),
            warning: self.warning.clone(),
        };

        let mut builder = Task::builder(self.name.clone(), body).flags(self.task_flags()?);
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(parallel) = self.parallel {
            builder = builder.parallel_subtasks(parallel);
        }
        if let Some(weight) = self.weight {
            builder = builder.progress_weight(weight);
        }
        for usage in &self.resources {
            let mut entry = match usage.stage {
                LockStageSpec::Prepare => TaskResourceUsage::prepare_stage(&usage.id, usage.amount),
                LockStageSpec::Run => TaskResourceUsage::run_stage(&usage.id, usage.amount),
            };
            if let Some(message) = &usage.error_message {
                entry = entry.with_error_message(message);
            }
            builder = builder.resource(entry);
        }
        for child in &self.children {
            builder = builder.subtask(child.build()?);
        }
        Ok(builder.build())
    }
}

/// Body of a plan task: sleeps in steps, honoring pause and cancellation
struct SleepBody {
    duration: Duration,
    steps: u32,
    fail: Option<String>,
    warning: Option<String>,
}

impl TaskBody for SleepBody {
    fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        let step = self.duration / self.steps;
        for i in 0..self.steps {
            ctx.checkpoint()?;
            ctx.set_description(format!("step {}/{}", i + 1, self.steps));
            thread::sleep(step);
            let done = (i + 1) as i64 * 100 / self.steps as i64;
            ctx.set_progress(done as i32);
        }
        if let Some(warning) = &self.warning {
            ctx.add_warning(warning.clone());
        }
        match &self.fail {
            Some(message) => Err(TaskError::failed(message.clone())),
            None => Ok(()),
        }
    }
}
