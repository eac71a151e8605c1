//! Durable task queue: FIFO within priority, restart-safe.
//!
//! The queue is the single owner of the task lifecycle. Claims are
//! conditional UPDATEs, so even with N workers sharing the database no two
//! can claim the same task. Retry backoff pushes `created_at` forward, which
//! keeps the claim query a plain "oldest eligible first" scan.

use std::sync::Arc;

use chrono::Duration;
use rusqlite::{Row, params};
use tracing::{debug, info, warn};

use crate::config::MenderConfig;
use crate::domain::{Task, TaskId, TaskKind, TaskState};
use crate::error::MenderError;
use crate::ports::{Clock, IdGenerator};
use crate::status::TaskCounts;
use crate::store::{SqliteStore, bad_column};

/// How a claimed task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    /// The owning source was quarantined mid-flight; abandon without retry.
    Quarantined,
}

/// What startup recovery did with the tasks it found in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: MenderConfig,
}

impl TaskQueue {
    pub fn new(
        store: Arc<SqliteStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: MenderConfig,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            config,
        }
    }

    /// Enqueue a task. Idempotent per `(kind, target)`: if an equivalent
    /// non-terminal task already exists this fails with `DuplicateTask`.
    pub fn enqueue(
        &self,
        kind: TaskKind,
        target: &str,
        priority: i32,
    ) -> Result<Task, MenderError> {
        self.enqueue_with_context(kind, target, priority, serde_json::json!({}))
    }

    pub fn enqueue_with_context(
        &self,
        kind: TaskKind,
        target: &str,
        priority: i32,
        context: serde_json::Value,
    ) -> Result<Task, MenderError> {
        let now = self.clock.now();
        let task = Task {
            id: self.ids.task_id(),
            kind,
            target: target.to_string(),
            state: TaskState::Pending,
            priority,
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: self.config.max_task_retries,
            error_message: None,
            context,
        };

        let mut conn = self.store.lock();
        let tx = conn.transaction()?;

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE kind = ?1 AND target = ?2 AND state IN ('PENDING', 'IN_PROGRESS')",
            params![kind.as_str(), target],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(MenderError::DuplicateTask {
                kind: kind.as_str().to_string(),
                target: target.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO tasks
                 (id, kind, target, state, priority, created_at,
                  retry_count, max_retries, context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id.storage_key(),
                kind.as_str(),
                task.target,
                task.state.as_str(),
                task.priority,
                task.created_at,
                task.retry_count,
                task.max_retries,
                task.context.to_string(),
            ],
        )?;
        tx.commit()?;

        info!(task = %task.id, kind = kind.as_str(), target, priority, "task enqueued");
        Ok(task)
    }

    /// Atomically claim the oldest eligible pending task, ordered by
    /// `(priority DESC, created_at ASC)`. Tasks whose `created_at` is in
    /// the future are still serving their retry backoff and are skipped.
    pub fn claim_next(&self) -> Result<Option<Task>, MenderError> {
        let now = self.clock.now();
        loop {
            let candidate = {
                let conn = self.store.lock();
                let mut stmt = conn.prepare(
                    "SELECT id, kind, target, state, priority, created_at, started_at,
                            completed_at, retry_count, max_retries, error_message, context
                     FROM tasks
                     WHERE state = 'PENDING' AND created_at <= ?1
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1",
                )?;
                let mut rows = stmt.query_map(params![now], map_task_row)?;
                match rows.next() {
                    None => None,
                    Some(row) => Some(row?),
                }
            };

            let Some(mut task) = candidate else {
                return Ok(None);
            };

            // Conditional update: only wins if the task is still PENDING.
            let claimed = self.store.lock().execute(
                "UPDATE tasks SET state = 'IN_PROGRESS', started_at = ?2
                 WHERE id = ?1 AND state = 'PENDING'",
                params![task.id.storage_key(), now],
            )?;
            if claimed == 0 {
                // Another worker got there first; try the next candidate.
                continue;
            }

            task.state = TaskState::InProgress;
            task.started_at = Some(now);
            debug!(task = %task.id, kind = task.kind.as_str(), target = task.target, "task claimed");
            return Ok(Some(task));
        }
    }

    /// Resolve an in-progress task. Failures are recycled to PENDING with
    /// exponential backoff until the retry budget runs out, then become
    /// terminal FAILED.
    pub fn resolve(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<Task, MenderError> {
        let now = self.clock.now();
        let mut task = self
            .get(task_id)?
            .ok_or(MenderError::TaskNotFound(task_id))?;

        if task.state != TaskState::InProgress {
            return Err(MenderError::InvalidTransition {
                task: task_id,
                from: task.state.as_str(),
                to: "resolved",
            });
        }

        match outcome {
            TaskOutcome::Completed => {
                task.state = TaskState::Completed;
                task.completed_at = Some(now);
            }
            TaskOutcome::Quarantined => {
                task.state = TaskState::Quarantined;
                task.completed_at = Some(now);
                task.error_message = Some("source quarantined mid-flight".to_string());
            }
            TaskOutcome::Failed(error) => {
                task.error_message = Some(error);
                if task.retry_count < task.max_retries {
                    task.retry_count += 1;
                    task.state = TaskState::Pending;
                    task.started_at = None;
                    // Backoff falls out of claim ordering: the task is not
                    // eligible again until its pushed-forward created_at.
                    task.created_at =
                        now + Duration::seconds(Task::backoff_secs(task.retry_count));
                    debug!(
                        task = %task.id,
                        retry = task.retry_count,
                        "task recycled with backoff"
                    );
                } else {
                    task.state = TaskState::Failed;
                    task.completed_at = Some(now);
                    warn!(task = %task.id, target = task.target, "task failed terminally");
                }
            }
        }

        self.write_back(&task)?;
        Ok(task)
    }

    /// Startup recovery: any task left IN_PROGRESS by a crash is abandoned.
    /// It goes back to PENDING with `retry_count + 1`, or to FAILED when the
    /// retry budget is already spent. Never leaves a task IN_PROGRESS.
    pub fn recover(&self) -> Result<RecoveryReport, MenderError> {
        let in_flight = self.tasks_in_state(TaskState::InProgress, None)?;
        self.reclaim(in_flight, "abandoned by restart")
    }

    /// Reclaim in-progress tasks older than the stale threshold. The same
    /// rules as `recover`, for long-running processes.
    pub fn reclaim_stale(&self) -> Result<RecoveryReport, MenderError> {
        let cutoff = self.clock.now()
            - Duration::from_std(self.config.stale_task_threshold)
                .unwrap_or_else(|_| Duration::hours(24));
        let stale = self.tasks_in_state(TaskState::InProgress, Some(cutoff))?;
        self.reclaim(stale, "stale in-progress task")
    }

    fn reclaim(&self, tasks: Vec<Task>, reason: &str) -> Result<RecoveryReport, MenderError> {
        let now = self.clock.now();
        let mut report = RecoveryReport::default();
        for mut task in tasks {
            task.error_message = Some(reason.to_string());
            task.started_at = None;
            task.retry_count += 1;
            if task.retry_count <= task.max_retries {
                task.state = TaskState::Pending;
                task.created_at = now;
                report.requeued += 1;
                warn!(task = %task.id, target = task.target, "in-progress task requeued: {reason}");
            } else {
                task.state = TaskState::Failed;
                task.completed_at = Some(now);
                report.failed += 1;
                warn!(task = %task.id, target = task.target, "in-progress task failed: {reason}");
            }
            self.write_back(&task)?;
        }
        Ok(report)
    }

    /// Abandon non-terminal ingest/refresh tasks for a source that was just
    /// quarantined. Repair tasks survive; they are the way out of
    /// quarantine.
    pub fn quarantine_tasks(&self, source_name: &str) -> Result<usize, MenderError> {
        let now = self.clock.now();
        let changed = self.store.lock().execute(
            "UPDATE tasks
             SET state = 'QUARANTINED', completed_at = ?2,
                 error_message = 'owning source quarantined'
             WHERE target = ?1 AND kind IN ('INGEST', 'REFRESH')
               AND state IN ('PENDING', 'IN_PROGRESS')",
            params![source_name, now],
        )?;
        if changed > 0 {
            info!(source = source_name, count = changed, "tasks quarantined with source");
        }
        Ok(changed)
    }

    pub fn get(&self, task_id: TaskId) -> Result<Option<Task>, MenderError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, target, state, priority, created_at, started_at,
                    completed_at, retry_count, max_retries, error_message, context
             FROM tasks WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![task_id.storage_key()], map_task_row)?;
        match rows.next() {
            None => Ok(None),
            Some(row) => Ok(Some(row?)),
        }
    }

    pub fn counts(&self) -> Result<TaskCounts, MenderError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = TaskCounts::default();
        for row in rows {
            let (state, count) = row?;
            let count = count as usize;
            match TaskState::parse(&state) {
                Some(TaskState::Pending) => counts.pending = count,
                Some(TaskState::InProgress) => counts.in_progress = count,
                Some(TaskState::Completed) => counts.completed = count,
                Some(TaskState::Failed) => counts.failed = count,
                Some(TaskState::Quarantined) => counts.quarantined = count,
                None => {}
            }
        }
        Ok(counts)
    }

    pub fn pending_count(&self) -> Result<usize, MenderError> {
        Ok(self.counts()?.pending)
    }

    /// Recent tasks, newest first, for dashboards.
    pub fn recent(&self, limit: usize) -> Result<Vec<Task>, MenderError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, target, state, priority, created_at, started_at,
                    completed_at, retry_count, max_retries, error_message, context
             FROM tasks ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], map_task_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn tasks_in_state(
        &self,
        state: TaskState,
        started_before: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<Task>, MenderError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, target, state, priority, created_at, started_at,
                    completed_at, retry_count, max_retries, error_message, context
             FROM tasks
             WHERE state = ?1 AND (?2 IS NULL OR started_at < ?2)",
        )?;
        let rows = stmt.query_map(params![state.as_str(), started_before], map_task_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn write_back(&self, task: &Task) -> Result<(), MenderError> {
        self.store.lock().execute(
            "UPDATE tasks
             SET state = ?2, priority = ?3, created_at = ?4, started_at = ?5,
                 completed_at = ?6, retry_count = ?7, error_message = ?8
             WHERE id = ?1",
            params![
                task.id.storage_key(),
                task.state.as_str(),
                task.priority,
                task.created_at,
                task.started_at,
                task.completed_at,
                task.retry_count,
                task.error_message,
            ],
        )?;
        Ok(())
    }
}

fn map_task_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let state: String = row.get(3)?;
    let context: String = row.get(11)?;
    Ok(Task {
        id: TaskId::parse(&id).map_err(|e| bad_column(0, format!("task id: {e}")))?,
        kind: TaskKind::parse(&kind)
            .ok_or_else(|| bad_column(1, format!("task kind '{kind}'")))?,
        target: row.get(2)?,
        state: TaskState::parse(&state)
            .ok_or_else(|| bad_column(3, format!("task state '{state}'")))?,
        priority: row.get(4)?,
        created_at: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        error_message: row.get(10)?,
        context: serde_json::from_str(&context)
            .map_err(|e| bad_column(11, format!("context json: {e}")))?,
    })
}
