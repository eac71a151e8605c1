//! Orchestrator: the supervision loop that turns queued tasks into work and
//! failures into repairs.
//!
//! One iteration claims at most one task and processes it to a terminal
//! resolution. Task handler errors are contained: they fail the task (which
//! recycles it through the retry budget) and feed the health tracker, they
//! never abort the loop. When the queue is idle the loop sweeps source
//! health and queues repair tasks for anything the breaker still allows.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::breaker::{BreakerDecision, CircuitBreaker};
use crate::config::MenderConfig;
use crate::doctor::{Collaborators, Doctor, RepairOutcome};
use crate::domain::{
    ExpectedSchema, SourceSpec, SourceState, Task, TaskKind, TaskState, priority,
    validate_records,
};
use crate::error::MenderError;
use crate::health::HealthTracker;
use crate::ports::{Clock, IdGenerator};
use crate::queue::{RecoveryReport, TaskOutcome, TaskQueue};
use crate::status::{HealthSummary, StatusView};
use crate::store::SqliteStore;

pub struct Orchestrator {
    store: Arc<SqliteStore>,
    queue: TaskQueue,
    health: HealthTracker,
    breaker: CircuitBreaker,
    doctor: Doctor,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    config: MenderConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: MenderConfig,
    ) -> Self {
        let queue = TaskQueue::new(store.clone(), clock.clone(), ids.clone(), config.clone());
        let health = HealthTracker::new(store.clone(), clock.clone(), config.clone());
        let breaker = CircuitBreaker::new(store.clone(), config.clone());
        let doctor = Doctor::new(
            store.clone(),
            health.clone(),
            breaker.clone(),
            collaborators.clone(),
            clock.clone(),
            ids,
            config.clone(),
        );
        Self {
            store,
            queue,
            health,
            breaker,
            doctor,
            collaborators,
            clock,
            config,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Startup recovery: reclaim tasks a previous process left in flight.
    /// Call once before `run`.
    pub fn recover(&self) -> Result<RecoveryReport, MenderError> {
        let report = self.queue.recover()?;
        if report != RecoveryReport::default() {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                "startup recovery reclaimed in-flight tasks"
            );
        }
        Ok(report)
    }

    /// Main loop. Runs until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MenderError> {
        info!("orchestrator running");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let worked = self.run_once().await?;
            if !worked {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        info!("orchestrator stopped");
        Ok(())
    }

    /// One scheduling iteration. Returns true when a task was processed.
    pub async fn run_once(&self) -> Result<bool, MenderError> {
        self.queue.reclaim_stale()?;

        let Some(task) = self.queue.claim_next()? else {
            self.sweep_health()?;
            return Ok(false);
        };

        debug!(task = %task.id, kind = task.kind.as_str(), target = task.target, "processing task");
        let target = task.target.clone();
        let kind = task.kind;

        let result = match kind {
            TaskKind::Ingest => self.handle_ingest(&task).await,
            TaskKind::Refresh => self.handle_refresh(&task).await,
            TaskKind::Repair => self.handle_repair(&task).await,
        };

        match result {
            Ok(outcome) => {
                self.resolve_tolerant(&task, outcome)?;
            }
            Err(err) => {
                // Contain the failure: fail the task, strike the source, and
                // keep the loop alive.
                error!(task = %task.id, target, "task handler failed: {err}");
                self.resolve_tolerant(&task, TaskOutcome::Failed(err.to_string()))?;
                if kind != TaskKind::Repair {
                    self.report_scrape_failure(&target, &err.to_string())?;
                }
            }
        }
        Ok(true)
    }

    // -- commands -------------------------------------------------------------

    /// Register a source and queue its initial ingestion.
    pub fn add_source(
        &self,
        name: &str,
        url: &str,
        schema: ExpectedSchema,
    ) -> Result<Task, MenderError> {
        let spec = SourceSpec::new(name, url, schema, self.clock.now());
        self.store.upsert_source(&spec)?;
        self.queue.enqueue(TaskKind::Ingest, name, priority::DEFAULT)
    }

    /// Queue a refresh scrape for an existing source.
    pub fn refresh_source(&self, name: &str) -> Result<Task, MenderError> {
        self.require_source(name)?;
        self.queue.enqueue(TaskKind::Refresh, name, priority::REFRESH)
    }

    /// Operator override: queue a repair at urgent priority, bypassing the
    /// health sweep (the breaker still applies when the task runs).
    pub fn force_repair(&self, name: &str) -> Result<Task, MenderError> {
        self.require_source(name)?;
        self.queue.enqueue(TaskKind::Repair, name, priority::URGENT)
    }

    pub fn status(&self) -> Result<StatusView, MenderError> {
        Ok(StatusView {
            tasks: self.queue.counts()?,
            health: HealthSummary::from_sources(self.health.all()?),
        })
    }

    // -- task handlers --------------------------------------------------------

    /// Initial ingestion: fetch the target, scaffold a scraper for it,
    /// validate its sample output, and deploy straight to production.
    async fn handle_ingest(&self, task: &Task) -> Result<TaskOutcome, MenderError> {
        let name = &task.target;
        let spec = self.require_source(name)?;

        let snapshot = self.collaborators.fetcher.fetch(&spec.url).await?;
        let artifact = self
            .collaborators
            .generator
            .scaffold(name, &spec.url, &snapshot, &spec.schema)
            .await?;
        if artifact.is_empty() || !self.collaborators.generator.syntax_check(&artifact) {
            return self.scrape_failed(name, "scaffolded artifact failed syntax check");
        }

        let records = self
            .collaborators
            .runner
            .run_sample(name, &artifact)
            .await?;
        let report = validate_records(&spec.schema, &records);
        if !report.passed() {
            return self.scrape_failed(
                name,
                &format!("initial scrape failed validation: {}", report.errors.join("; ")),
            );
        }

        self.collaborators.artifacts.write_production(&artifact).await?;
        self.store.set_snapshot_hash(name, &snapshot.content_hash)?;
        self.health.record_success(name)?;

        // First full scrape jumps the queue entirely.
        match self.queue.enqueue(TaskKind::Refresh, name, priority::URGENT) {
            Ok(_) | Err(MenderError::DuplicateTask { .. }) => {}
            Err(err) => return Err(err),
        }
        info!(source = name, records = report.record_count, "source ingested");
        Ok(TaskOutcome::Completed)
    }

    /// Re-scrape an existing source with its production artifact.
    async fn handle_refresh(&self, task: &Task) -> Result<TaskOutcome, MenderError> {
        let name = &task.target;
        let spec = self.require_source(name)?;

        if let Some(health) = self.health.get(name)? {
            if matches!(health.state, SourceState::Quarantined | SourceState::Dead) {
                // A sweep or repair got here first; do not scrape through it.
                return Ok(TaskOutcome::Quarantined);
            }
        }

        let Some(artifact) = self.collaborators.artifacts.production(name).await? else {
            return self.scrape_failed(name, "no production artifact; source never ingested");
        };

        let records = self
            .collaborators
            .runner
            .run_sample(name, &artifact)
            .await?;
        let report = validate_records(&spec.schema, &records);
        if !report.passed() {
            return self.scrape_failed(
                name,
                &format!("refresh failed validation: {}", report.errors.join("; ")),
            );
        }

        let snapshot = self.collaborators.fetcher.fetch(&spec.url).await?;
        self.store.set_snapshot_hash(name, &snapshot.content_hash)?;
        self.health.record_success(name)?;
        debug!(source = name, records = report.record_count, "source refreshed");
        Ok(TaskOutcome::Completed)
    }

    async fn handle_repair(&self, task: &Task) -> Result<TaskOutcome, MenderError> {
        let name = &task.target;
        match self.doctor.repair(name).await? {
            RepairOutcome::Promoted => {
                // Prove the fix on real traffic as soon as the queue drains.
                match self.queue.enqueue(TaskKind::Refresh, name, priority::REFRESH) {
                    Ok(_) | Err(MenderError::DuplicateTask { .. }) => {}
                    Err(err) => return Err(err),
                }
                Ok(TaskOutcome::Completed)
            }
            RepairOutcome::Rejected(kind) => {
                // The attempt ran and was recorded; the task itself is done.
                warn!(source = name, kind = kind.as_str(), "repair attempt rejected");
                Ok(TaskOutcome::Completed)
            }
            RepairOutcome::Skipped(reason) => {
                info!(source = name, reason = reason.as_str(), "repair task skipped by breaker");
                Ok(TaskOutcome::Completed)
            }
        }
    }

    // -- health plumbing ------------------------------------------------------

    /// Record a scrape failure whose handler otherwise succeeded (validation
    /// or syntax problems rather than infrastructure errors).
    fn scrape_failed(&self, name: &str, error: &str) -> Result<TaskOutcome, MenderError> {
        self.report_scrape_failure(name, error)?;
        Ok(TaskOutcome::Failed(error.to_string()))
    }

    fn report_scrape_failure(&self, name: &str, error: &str) -> Result<(), MenderError> {
        let report = self.health.record_failure(name, error)?;
        if report.newly_quarantined {
            self.queue.quarantine_tasks(name)?;
            self.enqueue_repair(name)?;
        }
        Ok(())
    }

    /// Queue repairs for every source that needs one and may still have one.
    fn sweep_health(&self) -> Result<(), MenderError> {
        let now = self.clock.now();
        for health in self.health.needing_fix()? {
            match self.breaker.evaluate(&health, now)? {
                BreakerDecision::Allow { .. } => {
                    self.enqueue_repair(&health.source_name)?;
                }
                BreakerDecision::Deny(_) => {}
            }
        }
        Ok(())
    }

    fn enqueue_repair(&self, name: &str) -> Result<(), MenderError> {
        match self.queue.enqueue(TaskKind::Repair, name, priority::REPAIR) {
            Ok(task) => {
                info!(source = name, task = %task.id, "repair task queued");
                Ok(())
            }
            // One repair in flight per source is enough.
            Err(MenderError::DuplicateTask { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn require_source(&self, name: &str) -> Result<SourceSpec, MenderError> {
        self.store
            .get_source(name)?
            .ok_or_else(|| MenderError::SourceNotFound(name.to_string()))
    }

    /// Resolve a task, tolerating the race where a quarantine sweep already
    /// moved it to a terminal state underneath us.
    fn resolve_tolerant(&self, task: &Task, outcome: TaskOutcome) -> Result<(), MenderError> {
        match self.queue.resolve(task.id, outcome) {
            Ok(_) => Ok(()),
            Err(MenderError::InvalidTransition { .. }) => {
                let current = self.queue.get(task.id)?;
                if current.is_some_and(|t| t.state == TaskState::Quarantined) {
                    Ok(())
                } else {
                    Err(MenderError::InvalidTransition {
                        task: task.id,
                        from: "unknown",
                        to: "resolved",
                    })
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldKind;
    use crate::impls::{DevFetcher, DevGenerator, DevRunner, MemoryArtifactStore};
    use crate::ports::{
        ArtifactStore, CandidateArtifact, CandidateRunner, FixedClock, HashDiff, UlidGenerator,
    };
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    /// Runner that can be flipped into a failing mode mid-test.
    #[derive(Default)]
    struct FlakyRunner {
        failing: Mutex<bool>,
    }

    impl FlakyRunner {
        fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }
    }

    #[async_trait]
    impl CandidateRunner for FlakyRunner {
        async fn run_sample(
            &self,
            _source_name: &str,
            _artifact: &CandidateArtifact,
        ) -> Result<Vec<serde_json::Value>, crate::error::CollaboratorError> {
            if *self.failing.lock().unwrap() {
                return Err(crate::error::CollaboratorError::Failed(
                    "selector no longer matches".to_string(),
                ));
            }
            Ok(vec![serde_json::json!({"title": "x", "price": 1})])
        }
    }

    fn schema() -> ExpectedSchema {
        ExpectedSchema::new([
            ("title".to_string(), FieldKind::String),
            ("price".to_string(), FieldKind::Number),
        ])
    }

    fn orchestrator_with_runner(
        runner: Arc<dyn CandidateRunner>,
    ) -> (Orchestrator, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let collaborators = Collaborators {
            fetcher: Arc::new(DevFetcher::new(clock.clone())),
            differ: Arc::new(HashDiff),
            generator: Arc::new(DevGenerator::new(clock.clone())),
            artifacts: Arc::new(MemoryArtifactStore::new()),
            runner,
        };
        let orchestrator = Orchestrator::new(
            store,
            collaborators,
            clock.clone(),
            ids,
            MenderConfig::default(),
        );
        (orchestrator, clock)
    }

    fn orchestrator() -> (Orchestrator, Arc<FixedClock>) {
        orchestrator_with_runner(Arc::new(DevRunner))
    }

    #[tokio::test]
    async fn ingest_deploys_to_production_and_marks_healthy() {
        let (orch, _clock) = orchestrator();
        orch.add_source("widgets", "https://example.test", schema())
            .unwrap();

        assert!(orch.run_once().await.unwrap());

        let production = orch
            .collaborators
            .artifacts
            .production("widgets")
            .await
            .unwrap();
        assert!(production.is_some());

        let health = orch.health().get("widgets").unwrap().unwrap();
        assert!(health.is_healthy());
        assert_eq!(orch.queue().counts().unwrap().completed, 1);

        // Ingestion queues the first full scrape ahead of everything else.
        let refresh = orch
            .queue()
            .recent(10)
            .unwrap()
            .into_iter()
            .find(|t| t.kind == TaskKind::Refresh)
            .expect("follow-up refresh queued");
        assert_eq!(refresh.state, TaskState::Pending);
        assert_eq!(refresh.priority, priority::URGENT);
    }

    #[tokio::test]
    async fn refresh_requires_prior_ingest() {
        let (orch, _clock) = orchestrator();
        orch.add_source("widgets", "https://example.test", schema())
            .unwrap();
        // Second source registered but never ingested.
        let spec = SourceSpec::new("ghost", "https://ghost.test", schema(), Utc::now());
        orch.store.upsert_source(&spec).unwrap();
        orch.refresh_source("ghost").unwrap();

        // Widgets' ingest and follow-up refresh outrank the ghost refresh.
        orch.run_once().await.unwrap();
        orch.run_once().await.unwrap();
        // The ghost refresh fails and strikes its health record.
        orch.run_once().await.unwrap();

        let health = orch.health().get("ghost").unwrap().unwrap();
        assert_eq!(health.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn repeated_refresh_failures_quarantine_and_queue_repair() {
        let runner = Arc::new(FlakyRunner::default());
        let (orch, clock) = orchestrator_with_runner(runner.clone());
        orch.add_source("widgets", "https://example.test", schema())
            .unwrap();
        orch.run_once().await.unwrap(); // ingest succeeds

        // The page breaks: every scrape now fails. The follow-up refresh
        // queued by ingestion gets recycled through its retry budget,
        // striking health each time.
        runner.set_failing(true);
        for _ in 0..3 {
            assert!(orch.run_once().await.unwrap());
            // Skip past the retry backoff.
            clock.advance(chrono::Duration::seconds(64));
        }

        let health = orch.health().get("widgets").unwrap().unwrap();
        assert_eq!(health.state, SourceState::Quarantined);

        // A repair task was queued at elevated priority.
        let repair = orch
            .queue()
            .recent(20)
            .unwrap()
            .into_iter()
            .find(|t| t.kind == TaskKind::Repair)
            .expect("repair task queued");
        assert_eq!(repair.priority, priority::REPAIR);
        assert!(repair.priority > priority::DEFAULT);
    }

    #[tokio::test]
    async fn repair_task_promotes_and_reopens_source() {
        let (orch, _clock) = orchestrator();
        orch.add_source("widgets", "https://example.test", schema())
            .unwrap();
        orch.run_once().await.unwrap(); // ingest
        orch.run_once().await.unwrap(); // drain the follow-up refresh

        // Quarantine by hand, then force a repair through the queue.
        for _ in 0..3 {
            orch.health().record_failure("widgets", "boom").unwrap();
        }
        orch.force_repair("widgets").unwrap();

        assert!(orch.run_once().await.unwrap());

        let health = orch.health().get("widgets").unwrap().unwrap();
        assert_eq!(health.state, SourceState::Active);

        // Promotion queues a follow-up refresh.
        let has_refresh = orch
            .queue()
            .recent(20)
            .unwrap()
            .iter()
            .any(|t| t.kind == TaskKind::Refresh && t.state == TaskState::Pending);
        assert!(has_refresh);
    }

    #[tokio::test]
    async fn handler_errors_do_not_kill_the_loop() {
        let (orch, _clock) = orchestrator();
        // Refresh for a source that is not registered at all.
        orch.queue()
            .enqueue(TaskKind::Refresh, "nowhere", priority::REFRESH)
            .unwrap();

        assert!(orch.run_once().await.unwrap());

        // The task failed but the orchestrator is still usable.
        orch.add_source("widgets", "https://example.test", schema())
            .unwrap();
        assert!(orch.run_once().await.unwrap());
        assert_eq!(orch.queue().counts().unwrap().completed, 1);
    }

    #[tokio::test]
    async fn idle_sweep_queues_repairs_for_quarantined_sources() {
        let (orch, _clock) = orchestrator();
        orch.add_source("widgets", "https://example.test", schema())
            .unwrap();
        orch.run_once().await.unwrap(); // ingest
        for _ in 0..3 {
            orch.health().record_failure("widgets", "boom").unwrap();
        }

        // The pending follow-up refresh is abandoned (source quarantined),
        // then the idle iteration sweeps health and queues a repair.
        assert!(orch.run_once().await.unwrap());
        assert!(!orch.run_once().await.unwrap());
        let repair_pending = orch
            .queue()
            .recent(10)
            .unwrap()
            .iter()
            .any(|t| t.kind == TaskKind::Repair);
        assert!(repair_pending);

        // A second sweep does not duplicate the repair task.
        assert!(orch.run_once().await.unwrap()); // processes the repair
    }

    #[tokio::test]
    async fn status_reports_tasks_and_health() {
        let (orch, _clock) = orchestrator();
        orch.add_source("widgets", "https://example.test", schema())
            .unwrap();
        orch.run_once().await.unwrap();

        let status = orch.status().unwrap();
        assert_eq!(status.tasks.completed, 1);
        assert_eq!(status.health.total_sources, 1);
        assert_eq!(status.health.active, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let (orch, _clock) = orchestrator();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { orch.run(rx).await });

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
