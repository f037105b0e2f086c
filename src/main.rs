use anyhow::Result;
use cotask::cli::{Args, ConfigDiscovery, ExecutionMode, Plan, RunConfig};
use cotask::task::{Task, TaskTreeStatistics, descendants, validate_tree};
use cotask::{LoggingEventHandler, Scheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cotask=info")),
        )
        .init();

    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    match mode {
        ExecutionMode::Run(config) => {
            if !run_plan(config).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        ExecutionMode::ShowConfig { config_override } => {
            ConfigDiscovery::show_discovery_info(config_override.as_deref())
        }
    }
}

/// Run a plan to completion; false if any top-level task failed or was canceled
async fn run_plan(config: RunConfig) -> Result<bool> {
    let mut scheduler_config = ConfigDiscovery::discover_config(config.config_override.as_deref())?;
    if let Some(threads) = config.threads {
        scheduler_config.resources.max_threads = Some(threads);
    }

    let plan = Plan::load(&config.plan, config.format)?;
    scheduler_config
        .resources
        .resources
        .extend(plan.resources.iter().cloned());
    let tasks = plan.build_tasks()?;

    let mut valid = true;
    for task in &tasks {
        for issue in validate_tree(task) {
            warn!("Invalid task tree {}: {}", task.name(), issue);
            valid = false;
        }
    }

    if config.dry_run {
        println!("Dry run, {} top-level tasks:", tasks.len());
        for task in &tasks {
            print_tree(task, 1);
        }
        return Ok(valid);
    }

    // finished trees are detached on unregistration, keep the members for the summary
    let members: Vec<Vec<Task>> = tasks.iter().map(descendants).collect();

    let mut scheduler = Scheduler::new(scheduler_config)?;
    if config.verbose {
        scheduler.add_event_handler(Box::new(LoggingEventHandler));
    }
    for task in &tasks {
        scheduler.register_top_level_task(task.clone())?;
    }
    info!("Running {} top-level tasks", tasks.len());

    tokio::select! {
        _ = scheduler.run_until_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, canceling all tasks");
        }
    }
    if !scheduler.is_idle() {
        scheduler.cancel_all_tasks();
        scheduler.run_until_idle().await;
    }

    let mut success = valid;
    println!("Summary:");
    for (task, members) in tasks.iter().zip(&members) {
        success &= print_summary(task, members);
    }
    Ok(success)
}

fn print_tree(task: &Task, depth: usize) {
    println!(
        "{}- {} [{}]",
        "  ".repeat(depth),
        task.name(),
        task.flags()
            .iter_names()
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
            .join(", ")
    );
    for sub in task.subtasks() {
        print_tree(&sub, depth + 1);
    }
}

fn print_summary(task: &Task, members: &[Task]) -> bool {
    let stats = TaskTreeStatistics::from_tasks(members);
    let elapsed = task
        .time_info()
        .start_time
        .zip(task.time_info().finish_time)
        .map(|(start, finish)| (finish - start).num_milliseconds())
        .unwrap_or(0);

    let outcome = if task.is_canceled() {
        "canceled".to_string()
    } else if let Some(error) = task.error() {
        format!("failed: {}", error)
    } else {
        "ok".to_string()
    };
    println!(
        "  {} - {} in {} ms ({} subtasks, {} failed, {} canceled, {:.0}% completed)",
        task.name(),
        outcome,
        elapsed,
        stats.total_tasks,
        stats.failed_tasks,
        stats.canceled_tasks,
        stats.completion_percentage()
    );
    for warning in task.warnings() {
        println!("    warning: {}", warning);
    }
    !task.is_stopped()
}
