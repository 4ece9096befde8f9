//! Scheduler Engine: the main loop that polls the store and triggers tasks.
//!
//! Per task: IDLE → CLAIMED → RUNNING → IDLE. The claim lives in the store,
//! so two engines (or two overlapping ticks) never run the same task at once.
//! Executions run on spawned tokio tasks, bounded by a semaphore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};

use cronhub_core::config::SchedulerConfig;
use cronhub_core::error::{CronHubError, Result};
use cronhub_core::traits::TaskStore;
use cronhub_core::types::{ExecutionLog, MAX_TIMEOUT_SECS, Task};

use crate::cron;
use crate::notify::NotificationDispatcher;
use crate::recorder::ExecutionRecorder;
use crate::runner::TaskRunner;

/// Upper bound on a claim lease, whatever the timeout and grace add up to.
const MAX_LEASE: Duration = Duration::from_secs(2 * MAX_TIMEOUT_SECS);

/// Where a task is in its execution cycle, as seen by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Idle,
    Claimed,
    Running,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Non-INACTIVE tasks fetched.
    pub candidates: usize,
    pub due: usize,
    pub started: usize,
    /// Due, but another execution holds the claim.
    pub already_claimed: usize,
    /// Due, but the worker pool is full; picked up on a later tick.
    pub deferred: usize,
    /// Stored with an expression that no longer parses.
    pub invalid: usize,
}

/// The scheduler engine: polls, claims and runs due tasks.
pub struct SchedulerEngine {
    store: Arc<dyn TaskStore>,
    runner: TaskRunner,
    recorder: ExecutionRecorder,
    notifier: NotificationDispatcher,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    instance_id: String,
    organization_id: Option<String>,
    claim_grace: Duration,
    phases: Mutex<HashMap<String, TaskPhase>>,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        runner: TaskRunner,
        notifier: NotificationDispatcher,
        config: &SchedulerConfig,
    ) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            recorder: ExecutionRecorder::new(store.clone()),
            store,
            runner,
            notifier,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            instance_id: config.instance_id.clone(),
            organization_id: config.organization_id.clone(),
            claim_grace: Duration::from_secs(config.claim_grace_secs),
            phases: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn phase(&self, task_id: &str) -> TaskPhase {
        self.phases
            .lock()
            .await
            .get(task_id)
            .copied()
            .unwrap_or(TaskPhase::Idle)
    }

    /// Executions currently claimed or running in this engine.
    pub async fn in_flight(&self) -> usize {
        self.phases.lock().await.len()
    }

    /// Poll once: fetch candidates, claim the due ones and spawn their
    /// executions. Store errors are returned for the caller to log.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Result<TickReport> {
        let tasks = self
            .store
            .fetch_active_tasks(self.organization_id.as_deref())
            .await?;
        let mut report = TickReport {
            candidates: tasks.len(),
            ..Default::default()
        };

        for task in tasks {
            if !task.state.is_schedulable() {
                continue;
            }
            match cron::is_due(&task.cron_expression, task.schedule_anchor(), now) {
                Ok(true) => report.due += 1,
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping '{}' ({}): {e}", task.name, task.id);
                    report.invalid += 1;
                    continue;
                }
            }

            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                tracing::debug!("Worker pool full, deferring '{}'", task.name);
                report.deferred += 1;
                continue;
            };

            match self.claim(&task).await {
                Ok(true) => {
                    report.started += 1;
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.execute(task, permit).await;
                    });
                }
                Ok(false) => {
                    tracing::debug!("🔒 '{}' ({}) already claimed, skipping", task.name, task.id);
                    report.already_claimed += 1;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Claim failed for '{}' ({}): {e}", task.name, task.id);
                }
            }
        }

        Ok(report)
    }

    /// Run one task immediately through the normal claim → run → record →
    /// notify path and return its log.
    pub async fn run_now(self: &Arc<Self>, task_id: &str) -> Result<ExecutionLog> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| CronHubError::NotFound(task_id.to_string()))?;

        if self.phase(task_id).await != TaskPhase::Idle {
            return Err(CronHubError::ClaimConflict(task_id.to_string()));
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CronHubError::Store("worker pool closed".into()))?;
        if !self.claim(&task).await? {
            return Err(CronHubError::ClaimConflict(task_id.to_string()));
        }

        tracing::info!("👆 Manual run of '{}' ({})", task.name, task.id);
        Ok(Arc::clone(self).execute(task, permit).await)
    }

    /// Wait until every in-flight execution has finished.
    pub async fn drain(&self) {
        let in_flight = self.max_concurrency - self.permits.available_permits();
        if in_flight > 0 {
            tracing::info!("⏳ Waiting for {in_flight} running task(s) to finish");
        }
        // never closed, so acquiring cannot fail
        if let Ok(all) = self.permits.acquire_many(self.max_concurrency as u32).await {
            drop(all);
        }
    }

    async fn claim(&self, task: &Task) -> Result<bool> {
        let lease = self
            .runner
            .timeout_for(task)
            .saturating_add(self.claim_grace)
            .min(MAX_LEASE);
        let lease_until = Utc::now()
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut phases = self.phases.lock().await;
        if phases.contains_key(&task.id) {
            return Ok(false);
        }
        let claimed = self
            .store
            .try_claim(&task.id, &self.instance_id, lease_until)
            .await?;
        if claimed {
            phases.insert(task.id.clone(), TaskPhase::Claimed);
        }
        Ok(claimed)
    }

    async fn set_phase(&self, task_id: &str, phase: TaskPhase) {
        let mut phases = self.phases.lock().await;
        match phase {
            TaskPhase::Idle => {
                phases.remove(task_id);
            }
            other => {
                phases.insert(task_id.to_string(), other);
            }
        }
    }

    /// Run a claimed task, record the outcome, queue its notification and
    /// release the claim. The permit is held until the claim is released.
    async fn execute(self: Arc<Self>, task: Task, permit: OwnedSemaphorePermit) -> ExecutionLog {
        self.set_phase(&task.id, TaskPhase::Running).await;
        tracing::info!("▶️ Running '{}' ({})", task.name, task.id);

        let outcome = self.runner.run(&task).await;
        let log = outcome.to_log();

        match self.recorder.record(&task, &outcome).await {
            Ok(updated) => {
                self.notifier.dispatch(&updated, &log);
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ Failed to record execution of '{}' ({}): {e}",
                    task.name,
                    task.id
                );
            }
        }

        if let Err(e) = self.store.release(&task.id, &self.instance_id).await {
            tracing::warn!("⚠️ Failed to release claim on '{}': {e}", task.id);
        }
        self.set_phase(&task.id, TaskPhase::Idle).await;
        drop(permit);

        if outcome.success() {
            tracing::info!(
                "✅ '{}' succeeded in {}ms",
                task.name,
                outcome.duration_ms
            );
        } else {
            tracing::info!(
                "❌ '{}' failed in {}ms: {}",
                task.name,
                outcome.duration_ms,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        log
    }
}

/// Scheduler loop: ticks every `poll_interval` until `shutdown` flips to
/// true, then waits for in-flight executions. Store errors are logged and the
/// loop carries on.
pub async fn spawn_scheduler(
    engine: Arc<SchedulerEngine>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        "⏰ Scheduler {} started (check every {}s)",
        engine.instance_id(),
        poll_interval.as_secs()
    );

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = interval.tick() => {
                match engine.tick(Utc::now()).await {
                    Ok(report) if report.started > 0 || report.deferred > 0 => {
                        tracing::info!(
                            "📣 Tick: {} due, {} started, {} deferred, {} already claimed",
                            report.due,
                            report.started,
                            report.deferred,
                            report.already_claimed
                        );
                    }
                    Ok(report) => tracing::debug!("Tick: {} candidates, none started", report.candidates),
                    Err(e) if e.is_transient() => {
                        tracing::warn!("⚠️ Poll failed, retrying next tick: {e}")
                    }
                    Err(e) => tracing::error!("❌ Poll failed: {e}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!("🛑 Scheduler stopping, no new ticks");
    engine.drain().await;
    tracing::info!("👋 Scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use crate::test_support::RecordingNotifier;
    use cronhub_core::config::ExecutionConfig;
    use cronhub_core::types::{
        Command, ExecutionResult, MailRecipients, NotificationSettings, TaskAction, TaskState,
    };

    struct Harness {
        engine: Arc<SchedulerEngine>,
        store: Arc<MemoryTaskStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(max_concurrency: usize) -> Harness {
        let store = Arc::new(MemoryTaskStore::new());
        let notifier = RecordingNotifier::shared();
        let (dispatcher, _worker) =
            NotificationDispatcher::spawn(notifier.clone(), 16, Duration::from_secs(1));
        let config = SchedulerConfig {
            max_concurrency,
            instance_id: "test-instance".into(),
            ..Default::default()
        };
        let engine = Arc::new(SchedulerEngine::new(
            store.clone(),
            TaskRunner::from_config(&ExecutionConfig::default()),
            dispatcher,
            &config,
        ));
        Harness {
            engine,
            store,
            notifier,
        }
    }

    /// Daily at midnight, created three days ago: due now, with missed runs.
    fn overdue(name: &str, script: &str) -> Task {
        let mut task = Task::command(name, "0 0 * * *", Command::bash(script));
        task.created_at = Utc::now() - chrono::Duration::days(3);
        task
    }

    #[tokio::test]
    async fn test_due_task_runs_and_records() {
        let h = harness(4);
        let task = overdue("hello", "echo hi");
        h.store.insert(&task).await.unwrap();

        let report = h.engine.tick(Utc::now()).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.started, 1);
        h.engine.drain().await;

        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.execution_logs.len(), 1);
        let log = &stored.execution_logs[0];
        assert_eq!(log.result, ExecutionResult::Success);
        assert_eq!(log.output, "hi\n");
        assert_eq!(log.error, None);
        assert_eq!(stored.state, TaskState::Active);
        assert_eq!(h.engine.phase(&task.id).await, TaskPhase::Idle);
    }

    #[tokio::test]
    async fn test_single_catch_up_after_downtime() {
        let h = harness(4);
        let task = overdue("nightly", "true");
        h.store.insert(&task).await.unwrap();

        assert_eq!(h.engine.tick(Utc::now()).await.unwrap().started, 1);
        h.engine.drain().await;
        let second = h.engine.tick(Utc::now()).await.unwrap();
        assert_eq!(second.due, 0);
        assert_eq!(second.started, 0);

        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.execution_logs.len(), 1);
    }

    #[tokio::test]
    async fn test_not_due_is_skipped() {
        let h = harness(4);
        let task = Task::command("yearly", "0 0 1 1 *", Command::bash("true"));
        h.store.insert(&task).await.unwrap();

        let now = task.created_at + chrono::Duration::minutes(1);
        let report = h.engine.tick(now).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn test_failure_then_recovery() {
        let h = harness(4);
        let mut task = overdue("flaky", "exit 1");
        h.store.insert(&task).await.unwrap();

        h.engine.tick(Utc::now()).await.unwrap();
        h.engine.drain().await;
        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Error);
        assert_eq!(stored.execution_logs[0].error.as_deref(), Some("exit status 1"));

        // ERROR tasks are still polled; a fixed script brings it back
        task = stored;
        task.action = TaskAction::Command(Command::bash("true"));
        task.last_execution_date = Some(Utc::now() - chrono::Duration::days(2));
        h.store.insert(&task).await.unwrap();

        assert_eq!(h.engine.tick(Utc::now()).await.unwrap().started, 1);
        h.engine.drain().await;
        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Active);
        assert_eq!(stored.execution_logs.len(), 2);
    }

    #[tokio::test]
    async fn test_inactive_never_polled() {
        let h = harness(4);
        let mut task = overdue("paused", "true");
        task.state = TaskState::Inactive;
        h.store.insert(&task).await.unwrap();

        let report = h.engine.tick(Utc::now()).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(report.started, 0);
    }

    #[tokio::test]
    async fn test_claimed_elsewhere_is_skipped() {
        let h = harness(4);
        let task = overdue("shared", "true");
        h.store.insert(&task).await.unwrap();
        let lease = Utc::now() + chrono::Duration::minutes(5);
        assert!(h.store.try_claim(&task.id, "other-instance", lease).await.unwrap());

        let report = h.engine.tick(Utc::now()).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.already_claimed, 1);
        assert_eq!(report.started, 0);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_run_once() {
        let h = harness(4);
        let task = overdue("slow", "sleep 0.5");
        h.store.insert(&task).await.unwrap();

        let ticks = futures::future::join_all((0..4).map(|_| h.engine.tick(Utc::now()))).await;
        let started: usize = ticks.into_iter().map(|r| r.unwrap().started).sum();
        assert_eq!(started, 1);
        h.engine.drain().await;

        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.execution_logs.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let h = harness(1);
        for name in ["a", "b"] {
            h.store.insert(&overdue(name, "sleep 0.3")).await.unwrap();
        }

        let report = h.engine.tick(Utc::now()).await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.started, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(h.engine.in_flight().await, 1);

        h.engine.drain().await;
        let report = h.engine.tick(Utc::now()).await.unwrap();
        assert_eq!(report.started, 1);
        h.engine.drain().await;
    }

    #[tokio::test]
    async fn test_run_now_conflicts_while_in_flight() {
        let h = harness(4);
        let task = overdue("long", "sleep 1");
        h.store.insert(&task).await.unwrap();

        assert_eq!(h.engine.tick(Utc::now()).await.unwrap().started, 1);
        assert!(matches!(
            h.engine.run_now(&task.id).await,
            Err(CronHubError::ClaimConflict(_))
        ));
        h.engine.drain().await;

        let log = h.engine.run_now(&task.id).await.unwrap();
        assert_eq!(log.result, ExecutionResult::Success);
        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.execution_logs.len(), 2);
    }

    #[tokio::test]
    async fn test_run_now_unknown_task() {
        let h = harness(4);
        assert!(matches!(
            h.engine.run_now("missing").await,
            Err(CronHubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_stored_expression_skipped() {
        let h = harness(4);
        let mut task = overdue("broken", "true");
        task.cron_expression = "61 * * * *".into();
        h.store.insert(&task).await.unwrap();

        let report = h.engine.tick(Utc::now()).await.unwrap();
        assert_eq!(report.invalid, 1);
        assert_eq!(report.started, 0);
    }

    #[tokio::test]
    async fn test_huge_stored_timeout_does_not_break_tick() {
        let h = harness(4);
        let mut task = overdue("forever", "true");
        task.action = TaskAction::Command(Command::bash("true").with_timeout(u64::MAX));
        h.store.insert(&task).await.unwrap();

        let engine = h.engine.clone();
        let report = tokio::spawn(async move { engine.tick(Utc::now()).await })
            .await
            .expect("tick panicked")
            .unwrap();
        assert_eq!(report.started, 1);
        h.engine.drain().await;

        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.execution_logs[0].result, ExecutionResult::Success);
    }

    #[tokio::test]
    async fn test_failure_notification_sent() {
        let h = harness(4);
        let mut task = overdue("alerting", "echo oops >&2; exit 2");
        task.notification_settings = Some(NotificationSettings {
            on_failure: true,
            include_output: true,
            ..Default::default()
        });
        task.mail_recipients = Some(MailRecipients {
            to: "ops@example.com".into(),
            ..Default::default()
        });
        h.store.insert(&task).await.unwrap();

        h.engine.tick(Utc::now()).await.unwrap();
        h.engine.drain().await;

        let mut delivered = Vec::new();
        for _ in 0..50 {
            delivered = h.notifier.sent.lock().await.clone();
            if !delivered.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].log.result, ExecutionResult::Failure);
        assert!(delivered[0].body.contains("oops"));
    }

    #[tokio::test]
    async fn test_loop_stops_cooperatively() {
        let h = harness(2);
        let task = overdue("finisher", "sleep 0.5; echo done");
        h.store.insert(&task).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let looping = tokio::spawn(spawn_scheduler(
            h.engine.clone(),
            Duration::from_secs(60),
            rx,
        ));

        // first interval tick fires immediately
        for _ in 0..50 {
            if h.engine.in_flight().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        looping.await.unwrap();

        // the in-flight execution was allowed to finish
        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.execution_logs.len(), 1);
        assert_eq!(stored.execution_logs[0].output, "done\n");
    }
}
