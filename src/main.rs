//! # cronhub: cron scheduler for shell commands and HTTP requests
//!
//! Usage:
//!   cronhub run                      # Start the scheduler (Ctrl-C to stop)
//!   cronhub add task.json            # Validate and store a task definition
//!   cronhub list                     # List tasks
//!   cronhub show <id>                # Task details and execution history
//!   cronhub exec <id>                # Run a task now
//!   cronhub enable|disable <id>      # Toggle INACTIVE
//!   cronhub next "*/15 * * * *" -n 5 # Preview fire times

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use cronhub_core::config::{CronHubConfig, expand_path};
use cronhub_core::traits::TaskStore;
use cronhub_core::types::{ExecutionLog, ExecutionResult, Task, TaskState, TaskUpdate};
use cronhub_scheduler::{
    CronSchedule, NotificationDispatcher, SchedulerEngine, TaskRunner, notifier_from_config,
    open_store, spawn_scheduler, tasks,
};

#[derive(Parser)]
#[command(
    name = "cronhub",
    version,
    about = "⏰ cronhub — cron scheduler for shell commands and HTTP requests"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.cronhub/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Add tasks from a JSON file (one task or an array)
    Add { file: PathBuf },
    /// List all tasks
    List,
    /// Show a task and its execution history
    Show {
        id: String,
        /// Number of most recent executions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Execute a task immediately
    Exec { id: String },
    /// Re-enable a disabled task
    Enable { id: String },
    /// Disable a task (it will not be polled)
    Disable { id: String },
    /// Print the next fire times of a cron expression
    Next {
        expression: String,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "cronhub=debug,cronhub_scheduler=debug"
    } else {
        "cronhub=info,cronhub_scheduler=info"
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&str>) -> Result<CronHubConfig> {
    let config = match path {
        Some(p) => CronHubConfig::load_from(&expand_path(p))?,
        None => CronHubConfig::load()?,
    };
    Ok(config)
}

/// Engine plus its notification worker.
fn build_engine(
    config: &CronHubConfig,
    store: Arc<dyn TaskStore>,
) -> Result<(Arc<SchedulerEngine>, JoinHandle<()>)> {
    let notifier = notifier_from_config(&config.notify)?;
    let (dispatcher, worker) = NotificationDispatcher::spawn(
        notifier,
        config.scheduler.notification_queue,
        Duration::from_secs(config.notify.timeout_secs),
    );
    let runner = TaskRunner::from_config(&config.execution);
    let engine = Arc::new(SchedulerEngine::new(
        store,
        runner,
        dispatcher,
        &config.scheduler,
    ));
    Ok((engine, worker))
}

/// Drop the engine and let queued notifications go out.
async fn finish(engine: Arc<SchedulerEngine>, worker: JoinHandle<()>) {
    drop(engine);
    worker.await.ok();
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    if let Commands::Next { expression, count } = &cli.command {
        return print_next(expression, *count);
    }

    let config = load_config(cli.config.as_deref())?;
    let store = open_store(&config.store)?;

    match cli.command {
        Commands::Run => run(&config, store).await,
        Commands::Add { file } => add(&config, store, &file).await,
        Commands::List => list(store.as_ref()).await,
        Commands::Show { id, limit } => show(store.as_ref(), &id, limit).await,
        Commands::Exec { id } => {
            let (engine, worker) = build_engine(&config, store)?;
            let result = engine.run_now(&id).await;
            finish(engine, worker).await;
            print_log(&result?);
            Ok(())
        }
        Commands::Enable { id } => set_state(store.as_ref(), &id, TaskState::Active).await,
        Commands::Disable { id } => set_state(store.as_ref(), &id, TaskState::Inactive).await,
        Commands::Next { .. } => Ok(()),
    }
}

async fn run(config: &CronHubConfig, store: Arc<dyn TaskStore>) -> Result<()> {
    let (engine, worker) = build_engine(config, store)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = tokio::spawn(spawn_scheduler(
        engine.clone(),
        Duration::from_secs(config.scheduler.poll_interval_secs.max(1)),
        shutdown_rx,
    ));

    shutdown_signal().await?;
    tracing::info!("🛑 Shutdown requested");
    shutdown_tx.send(true).ok();
    scheduler.await.context("scheduler loop panicked")?;

    finish(engine, worker).await;
    Ok(())
}

async fn add(config: &CronHubConfig, store: Arc<dyn TaskStore>, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;
    let new_tasks: Vec<Task> = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };

    // validate everything before storing anything
    for task in &new_tasks {
        if let Err(e) = tasks::validate(task) {
            bail!("task '{}' rejected: {e}", task.name);
        }
    }

    let mut launch = Vec::new();
    for task in &new_tasks {
        store.insert(task).await?;
        println!("📅 Task added: '{}' ({})", task.name, task.id);
        if task.launch_on_save {
            launch.push(task.id.clone());
        }
    }

    if !launch.is_empty() {
        let (engine, worker) = build_engine(config, store)?;
        for id in &launch {
            match engine.run_now(id).await {
                Ok(log) => print_log(&log),
                Err(e) => eprintln!("⚠️  Launch of {id} failed: {e}"),
            }
        }
        finish(engine, worker).await;
    }
    Ok(())
}

async fn list(store: &dyn TaskStore) -> Result<()> {
    let all = store.list().await?;
    if all.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<8}  {:<16}  {:<8}  NAME",
        "ID", "STATE", "CRON", "LAST"
    );
    for task in all {
        println!(
            "{:<36}  {:<8}  {:<16}  {:<8}  {}",
            task.id,
            task.state,
            task.cron_expression,
            task.last_execution_result
                .map(|r| r.as_str())
                .unwrap_or("-"),
            task.name
        );
    }
    Ok(())
}

async fn show(store: &dyn TaskStore, id: &str, limit: usize) -> Result<()> {
    let Some(task) = store.get(id).await? else {
        bail!("task not found: {id}");
    };

    println!("📋 {} ({})", task.name, task.id);
    if let Some(description) = &task.description {
        println!("   {description}");
    }
    println!("   State:    {}", task.state);
    println!("   Cron:     {}", task.cron_expression);
    println!(
        "   Action:   {}",
        if task.is_command() { "command" } else { "request" }
    );
    if let Ok(schedule) = CronSchedule::parse(&task.cron_expression) {
        if let Some(next) = schedule.next_after(Utc::now()) {
            println!("   Next run: {}", next.to_rfc3339());
        }
    }
    if !task.tags.is_empty() {
        println!("   Tags:     {}", task.tags.join(", "));
    }

    println!("\n   History ({} executions):", task.execution_logs.len());
    let skip = task.execution_logs.len().saturating_sub(limit);
    for log in task.execution_logs.iter().skip(skip) {
        println!(
            "   {}  {:<7}  {:>7}ms  {}",
            log.executed_at.to_rfc3339(),
            log.result,
            log.duration_ms,
            log.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn set_state(store: &dyn TaskStore, id: &str, state: TaskState) -> Result<()> {
    if store.get(id).await?.is_none() {
        bail!("task not found: {id}");
    }
    store.update(id, TaskUpdate::SetState(state)).await?;
    println!("✅ Task {id} is now {state}");
    Ok(())
}

fn print_next(expression: &str, count: usize) -> Result<()> {
    let schedule = CronSchedule::parse(expression)?;
    for time in schedule.upcoming(Utc::now(), count) {
        println!("{}", time.to_rfc3339());
    }
    Ok(())
}

fn print_log(log: &ExecutionLog) {
    println!(
        "{} {} in {}ms",
        if log.result == ExecutionResult::Success { "✅" } else { "❌" },
        log.result,
        log.duration_ms
    );
    if !log.output.is_empty() {
        print!("{}", log.output);
        if !log.output.ends_with('\n') {
            println!();
        }
    }
    if let Some(error) = &log.error {
        eprintln!("error: {error}");
    }
}
