//! Task queue implementation.
//!
//! Provides atomic task claiming via conditional UPDATE so concurrent
//! claimers see a single winner, dedup-aware enqueue, exponential-backoff
//! retry, and stale-task reaping. The queue emits a domain event after each
//! committed transition; per-task order follows from the committer being
//! the emitter.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use engram_db::EngramDb;
use engram_protocol::defaults::{
    DEFAULT_MAX_RETRIES, RETRY_BACKOFF_BASE, RETRY_BACKOFF_CAP, TASK_RETENTION,
};
use engram_protocol::http::{DomainEvent, QueueStatsResponse};
use engram_protocol::{TaskId, TaskStatus, TaskType, TraceContext, WorkerId};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::models::{row_to_task, TaskRecord};
use crate::events::EventBus;

/// Input to `enqueue`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub required_capability: String,
    pub fallback_capabilities: Vec<String>,
    pub priority: i64,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
    pub max_retries: i64,
    pub trace: Option<TraceContext>,
}

impl NewTask {
    pub fn new(task_type: TaskType, capability: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type,
            required_capability: capability.into(),
            fallback_capabilities: Vec::new(),
            priority: 0,
            payload,
            dedup_key: None,
            max_retries: DEFAULT_MAX_RETRIES,
            trace: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallback_capabilities = fallbacks;
        self
    }

    pub fn trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// Outcome of `fail`.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Returned to pending; eligible again at the contained time.
    Retrying { retry_after: DateTime<Utc> },
    /// Terminal failure.
    Failed,
    /// The task was not in flight (already terminal or unknown).
    NotInFlight,
}

/// Exponential backoff with jitter: min(cap, base * 2^n) + uniform[0, base).
pub fn retry_backoff(retry_count: i64) -> Duration {
    let base = RETRY_BACKOFF_BASE;
    let exp = retry_count.clamp(0, 30) as u32;
    let scaled = base
        .checked_mul(2u32.saturating_pow(exp))
        .unwrap_or(RETRY_BACKOFF_CAP);
    let capped = scaled.min(RETRY_BACKOFF_CAP);
    let jitter_ms = rand::thread_rng().gen_range(0..base.as_millis().max(1) as u64);
    capped + Duration::from_millis(jitter_ms)
}

#[derive(Debug, Clone)]
pub struct TaskQueue {
    db: EngramDb,
    bus: EventBus,
}

impl TaskQueue {
    pub fn new(db: EngramDb, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Enqueue a task, collapsing onto an existing non-terminal task when
    /// the dedup key matches. Returns `(id, was_new)`.
    pub async fn enqueue(&self, task: NewTask) -> Result<(TaskId, bool)> {
        let id = TaskId::new();
        let now = Utc::now().to_rfc3339();
        let fallbacks = serde_json::to_string(&task.fallback_capabilities)?;
        let payload = serde_json::to_string(&task.payload)?;
        let trace = task
            .trace
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        // INSERT OR IGNORE + the partial unique index on live dedup keys
        // makes the dedup race-free: the second inserter affects 0 rows.
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO engram_tasks
                (id, task_type, status, required_capability, fallback_capabilities,
                 priority, payload, retry_count, max_retries, created_at, dedup_key, trace)
            VALUES (?, ?, 'pending', ?, ?, ?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(task.task_type.as_str())
        .bind(&task.required_capability)
        .bind(&fallbacks)
        .bind(task.priority)
        .bind(&payload)
        .bind(task.max_retries)
        .bind(&now)
        .bind(&task.dedup_key)
        .bind(&trace)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if inserted == 0 {
            let dedup_key = task
                .dedup_key
                .as_deref()
                .context("Task insert affected no rows without a dedup key")?;
            let existing: String = sqlx::query_scalar(
                r#"
                SELECT id FROM engram_tasks
                WHERE dedup_key = ? AND status IN ('pending','assigned','processing')
                "#,
            )
            .bind(dedup_key)
            .fetch_one(self.db.pool())
            .await
            .context("Dedup hit but no live task row found")?;

            debug!("Dedup hit for key {}: task {}", dedup_key, existing);
            return Ok((TaskId::from_raw(existing), false));
        }

        info!(
            task_id = %id,
            task_type = %task.task_type,
            capability = %task.required_capability,
            priority = task.priority,
            "Task enqueued"
        );
        self.bus.emit(DomainEvent::TaskQueued {
            task_id: id.clone(),
            task_type: task.task_type,
        });
        Ok((id, true))
    }

    /// Atomically claim the next ready task matching one of `capabilities`.
    ///
    /// Uses UPDATE ... WHERE status = 'pending' keyed on id to claim; if
    /// another claimer wins the race the conditional update affects 0 rows
    /// and we loop.
    pub async fn claim_next(
        &self,
        capabilities: &[String],
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>> {
        if capabilities.is_empty() {
            return Ok(None);
        }

        loop {
            let placeholders = vec!["?"; capabilities.len()].join(",");
            let select = format!(
                r#"
                SELECT id FROM engram_tasks
                WHERE status = 'pending'
                  AND (retry_after IS NULL OR retry_after <= ?)
                  AND required_capability IN ({placeholders})
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                "#,
            );

            let mut query = sqlx::query_scalar::<_, String>(&select).bind(now.to_rfc3339());
            for cap in capabilities {
                query = query.bind(cap);
            }
            let Some(task_id) = query.fetch_optional(self.db.pool()).await? else {
                return Ok(None);
            };

            if self.claim(&TaskId::from_raw(task_id.clone()), worker_id, now).await? {
                let task = self
                    .get(&TaskId::from_raw(task_id))
                    .await?
                    .context("Claimed task row disappeared")?;
                return Ok(Some(task));
            }
            // Another claimer won; try the next candidate.
        }
    }

    /// Conditional claim of a specific pending task for a worker.
    pub async fn claim(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let claimed = sqlx::query(
            r#"
            UPDATE engram_tasks
            SET status = 'assigned',
                assigned_worker_id = ?,
                assigned_at = ?
            WHERE id = ? AND status = 'pending' AND assigned_worker_id IS NULL
            "#,
        )
        .bind(worker_id.as_str())
        .bind(now.to_rfc3339())
        .bind(task_id.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected()
            == 1;

        if claimed {
            self.bus.emit(DomainEvent::TaskAssigned {
                task_id: task_id.clone(),
                worker_id: worker_id.clone(),
            });
        }
        Ok(claimed)
    }

    /// Flip assigned -> processing once the worker acknowledges the task.
    pub async fn mark_processing(&self, task_id: &TaskId, worker_id: &WorkerId) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE engram_tasks
            SET status = 'processing'
            WHERE id = ? AND status = 'assigned' AND assigned_worker_id = ?
            "#,
        )
        .bind(task_id.as_str())
        .bind(worker_id.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// Terminal success.
    pub async fn complete(&self, task_id: &TaskId, result: &serde_json::Value) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let completed = sqlx::query(
            r#"
            UPDATE engram_tasks
            SET status = 'completed', result = ?, completed_at = ?
            WHERE id = ? AND status IN ('assigned','processing')
            "#,
        )
        .bind(serde_json::to_string(result)?)
        .bind(&now)
        .bind(task_id.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected()
            == 1;

        if completed {
            info!(task_id = %task_id, "Task completed");
            self.bus.emit(DomainEvent::TaskCompleted {
                task_id: task_id.clone(),
            });
        }
        Ok(completed)
    }

    /// Failure path. Retryable failures with budget left return to pending
    /// with an absolute `retry_after`; everything else is terminal.
    pub async fn fail(&self, task_id: &TaskId, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut tx = self.db.pool().begin().await?;

        let row: Option<(i64, i64, String)> = sqlx::query_as(
            "SELECT retry_count, max_retries, status FROM engram_tasks WHERE id = ?",
        )
        .bind(task_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((retry_count, max_retries, status)) = row else {
            return Ok(FailOutcome::NotInFlight);
        };
        if !TaskStatus::is_in_flight(&status.parse().map_err(|e: String| anyhow::anyhow!(e))?) {
            return Ok(FailOutcome::NotInFlight);
        }

        let now = Utc::now();
        let outcome = if retryable && retry_count < max_retries {
            let backoff = retry_backoff(retry_count);
            let retry_after = now
                + ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::seconds(1));
            sqlx::query(
                r#"
                UPDATE engram_tasks
                SET status = 'pending',
                    retry_count = retry_count + 1,
                    retry_after = ?,
                    assigned_worker_id = NULL,
                    assigned_at = NULL,
                    error = ?
                WHERE id = ? AND status IN ('assigned','processing')
                "#,
            )
            .bind(retry_after.to_rfc3339())
            .bind(error)
            .bind(task_id.as_str())
            .execute(&mut *tx)
            .await?;
            FailOutcome::Retrying { retry_after }
        } else {
            sqlx::query(
                r#"
                UPDATE engram_tasks
                SET status = 'failed', error = ?, completed_at = ?
                WHERE id = ? AND status IN ('assigned','processing')
                "#,
            )
            .bind(error)
            .bind(now.to_rfc3339())
            .bind(task_id.as_str())
            .execute(&mut *tx)
            .await?;
            FailOutcome::Failed
        };

        tx.commit().await?;

        let will_retry = matches!(outcome, FailOutcome::Retrying { .. });
        warn!(task_id = %task_id, will_retry, "Task failed: {}", error);
        self.bus.emit(DomainEvent::TaskFailed {
            task_id: task_id.clone(),
            error: error.to_string(),
            will_retry,
        });
        Ok(outcome)
    }

    /// Fast reap on worker disconnect: the in-flight task goes straight
    /// back to pending (or terminal timeout when retries are exhausted).
    pub async fn release(&self, task_id: &TaskId, worker_id: &WorkerId) -> Result<()> {
        let now = Utc::now();
        let released = sqlx::query(
            r#"
            UPDATE engram_tasks
            SET status = 'pending',
                retry_count = retry_count + 1,
                retry_after = NULL,
                assigned_worker_id = NULL,
                assigned_at = NULL
            WHERE id = ? AND assigned_worker_id = ?
              AND status IN ('assigned','processing')
              AND retry_count < max_retries
            "#,
        )
        .bind(task_id.as_str())
        .bind(worker_id.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if released == 0 {
            let timed_out = sqlx::query(
                r#"
                UPDATE engram_tasks
                SET status = 'timeout', completed_at = ?,
                    error = 'worker disconnected with retries exhausted'
                WHERE id = ? AND assigned_worker_id = ?
                  AND status IN ('assigned','processing')
                "#,
            )
            .bind(now.to_rfc3339())
            .bind(task_id.as_str())
            .bind(worker_id.as_str())
            .execute(self.db.pool())
            .await?
            .rows_affected();
            if timed_out == 1 {
                self.bus.emit(DomainEvent::TaskFailed {
                    task_id: task_id.clone(),
                    error: "worker disconnected with retries exhausted".into(),
                    will_retry: false,
                });
            }
        } else {
            info!(task_id = %task_id, worker_id = %worker_id, "Task released after worker disconnect");
        }
        Ok(())
    }

    /// Return in-flight tasks that exceeded their per-type deadline to the
    /// queue, or to terminal `timeout` when retries are exhausted.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM engram_tasks
            WHERE status IN ('assigned','processing') AND assigned_at IS NOT NULL
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut reaped = 0;
        for row in &rows {
            let task = row_to_task(row)?;
            let Some(assigned_at) = task.assigned_at else {
                continue;
            };
            let deadline = ChronoDuration::from_std(task.task_type.timeout())
                .unwrap_or_else(|_| ChronoDuration::minutes(5));
            if now - assigned_at <= deadline {
                continue;
            }

            if task.retry_count < task.max_retries {
                let updated = sqlx::query(
                    r#"
                    UPDATE engram_tasks
                    SET status = 'pending',
                        retry_count = retry_count + 1,
                        retry_after = NULL,
                        assigned_worker_id = NULL,
                        assigned_at = NULL,
                        error = 'task deadline exceeded'
                    WHERE id = ? AND status IN ('assigned','processing')
                    "#,
                )
                .bind(task.id.as_str())
                .execute(self.db.pool())
                .await?
                .rows_affected();
                if updated == 1 {
                    warn!(task_id = %task.id, task_type = %task.task_type, "Reaped stale task back to pending");
                    reaped += 1;
                }
            } else {
                let updated = sqlx::query(
                    r#"
                    UPDATE engram_tasks
                    SET status = 'timeout', completed_at = ?, error = 'task deadline exceeded'
                    WHERE id = ? AND status IN ('assigned','processing')
                    "#,
                )
                .bind(now.to_rfc3339())
                .bind(task.id.as_str())
                .execute(self.db.pool())
                .await?
                .rows_affected();
                if updated == 1 {
                    warn!(task_id = %task.id, "Stale task exhausted retries; marked timeout");
                    self.bus.emit(DomainEvent::TaskFailed {
                        task_id: task.id.clone(),
                        error: "task deadline exceeded".into(),
                        will_retry: false,
                    });
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }

    /// Cancel a task that has not been handed to a worker yet.
    pub async fn cancel_pending(&self, task_id: &TaskId, reason: Option<&str>) -> Result<bool> {
        let error = reason.unwrap_or("cancelled");
        let cancelled = sqlx::query(
            r#"
            UPDATE engram_tasks
            SET status = 'failed', error = ?, completed_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected()
            == 1;

        if cancelled {
            info!(task_id = %task_id, "Pending task cancelled");
            self.bus.emit(DomainEvent::TaskFailed {
                task_id: task_id.clone(),
                error: error.to_string(),
                will_retry: false,
            });
        }
        Ok(cancelled)
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM engram_tasks WHERE id = ?")
            .bind(task_id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    /// Ready tasks in dispatch order, for the dispatcher to walk past
    /// head-of-line tasks that no connected worker can serve.
    pub async fn next_ready_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM engram_tasks
            WHERE status = 'pending' AND (retry_after IS NULL OR retry_after <= ?)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Distinct capabilities demanded by pending tasks. Feeds the local
    /// hub's health derivation: a demanded capability no worker covers
    /// degrades the hub.
    pub async fn pending_capabilities(&self) -> Result<Vec<String>> {
        let caps: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT required_capability FROM engram_tasks
            WHERE status = 'pending'
            ORDER BY required_capability
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(caps)
    }

    /// Earliest pending retry_after still in the future, to arm the
    /// dispatcher's retry timer.
    pub async fn next_retry_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT MIN(retry_after) FROM engram_tasks
            WHERE status = 'pending' AND retry_after > ?
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_one(self.db.pool())
        .await?;
        Ok(value.as_deref().map(super::models::ts).transpose()?)
    }

    pub async fn count_by_status(&self) -> Result<QueueStatsResponse> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM engram_tasks GROUP BY status")
                .fetch_all(self.db.pool())
                .await?;

        let mut stats = QueueStatsResponse::default();
        for (status, count) in rows {
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::Pending) => stats.pending = count,
                Ok(TaskStatus::Assigned) => stats.assigned = count,
                Ok(TaskStatus::Processing) => stats.processing = count,
                Ok(TaskStatus::Completed) => stats.completed = count,
                Ok(TaskStatus::Failed) => stats.failed = count,
                Ok(TaskStatus::Timeout) => stats.timeout = count,
                Err(e) => warn!("Unknown status in queue stats: {}", e),
            }
        }
        Ok(stats)
    }

    /// Delete terminal rows older than the retention window.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64> {
        let retention =
            ChronoDuration::from_std(TASK_RETENTION).unwrap_or_else(|_| ChronoDuration::hours(24));
        let cutoff = (now - retention).to_rfc3339();
        let deleted = sqlx::query(
            r#"
            DELETE FROM engram_tasks
            WHERE status IN ('completed','failed','timeout') AND completed_at < ?
            "#,
        )
        .bind(&cutoff)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        if deleted > 0 {
            info!("Cleaned up {} terminal tasks older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }
}
