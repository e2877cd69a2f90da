//! Durable task queue between the request path and update workers.
//!
//! Tasks live in the `update_tasks` table. Delivery is at-least-once: a leased
//! task whose worker dies becomes visible again once its lease expires.

pub mod worker;

pub use worker::{ExtractorLoader, TaskOutcome, Worker, WorkerPool};

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::Db;
use crate::error::{FactgraphError, Result};
use crate::graph::{encode_ts, ts_column, ExtractedEntity};
use crate::tenant::TenantId;

/// Redelivery and deduplication policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Lease length; a task not completed within it is redelivered.
    pub visibility_timeout: Duration,
    /// Identical text for one tenant within a window collapses to one task.
    pub dedup_window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(60),
            dedup_window: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivering after failed attempt number `attempt` (1-based):
    /// `backoff_base * 2^(attempt-1)`, capped at `backoff_max`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InFlight => "in_flight",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TaskStatus::Pending),
            "in_flight" => Some(TaskStatus::InFlight),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: String,
    pub tenant_id: String,
    pub raw_text: String,
    pub enqueued_at: DateTime<Utc>,
    /// Pre-extracted entities; when present the worker skips extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<ExtractedEntity>>,
}

/// A queued unit of update work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateTask {
    pub task_id: String,
    pub tenant_id: TenantId,
    pub raw_text: String,
    pub candidates: Option<Vec<ExtractedEntity>>,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed: u64,
}

/// SHA256 of the message text.
pub fn content_hash(raw_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic task id from `(tenant, content hash, enqueue epoch)`, where
/// the epoch is the dedup window the enqueue time falls in.
pub fn derive_task_id(tenant: &TenantId, raw_text: &str, enqueued_at: DateTime<Utc>, dedup_window: Duration) -> String {
    let window = dedup_window.as_secs().max(1) as i64;
    let epoch = enqueued_at.timestamp().div_euclid(window);
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash(raw_text).as_bytes());
    hasher.update([0u8]);
    hasher.update(epoch.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

const TASK_COLUMNS: &str =
    "task_id, tenant_id, raw_text, candidates_json, enqueued_at, attempt_count, status, last_error";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<UpdateTask> {
    let conversion = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(FactgraphError::InvalidInput(msg)),
        )
    };
    let tenant_raw: String = row.get(1)?;
    let tenant_id = TenantId::new(&tenant_raw).map_err(|e| conversion(1, e.to_string()))?;
    let candidates_json: Option<String> = row.get(3)?;
    let candidates = candidates_json
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| conversion(3, e.to_string()))?;
    let status_raw: String = row.get(6)?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| conversion(6, format!("unknown status {}", status_raw)))?;

    Ok(UpdateTask {
        task_id: row.get(0)?,
        tenant_id,
        raw_text: row.get(2)?,
        candidates,
        enqueued_at: ts_column(row, 4)?,
        attempt_count: row.get(5)?,
        status,
        last_error: row.get(7)?,
    })
}

fn select_task(conn: &Connection, task_id: &str) -> Result<Option<UpdateTask>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM update_tasks WHERE task_id = ?1");
    Ok(conn.query_row(&sql, [task_id], task_from_row).optional()?)
}

fn task_exists(conn: &Connection, task_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM update_tasks WHERE task_id = ?1", [task_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// SQLite-backed task queue.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    db: Db,
    policy: RetryPolicy,
}

impl TaskDispatcher {
    pub fn new(db: Db, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a message for knowledge extraction. Returns once the task is
    /// durable; a duplicate within the dedup window returns the existing id.
    pub async fn enqueue(&self, tenant: &TenantId, raw_text: &str) -> Result<String> {
        let enqueued_at = Utc::now();
        let payload = TaskPayload {
            task_id: derive_task_id(tenant, raw_text, enqueued_at, self.policy.dedup_window),
            tenant_id: tenant.as_str().to_string(),
            raw_text: raw_text.to_string(),
            enqueued_at,
            candidates: None,
        };
        self.enqueue_payload(payload).await
    }

    /// Queue a wire payload as-is, including any pre-extracted candidates.
    pub async fn enqueue_payload(&self, payload: TaskPayload) -> Result<String> {
        let tenant = TenantId::new(&payload.tenant_id)?;
        if payload.task_id.trim().is_empty() {
            return Err(FactgraphError::InvalidInput("task_id must not be empty".to_string()));
        }
        if payload.raw_text.trim().is_empty() && payload.candidates.is_none() {
            return Err(FactgraphError::InvalidInput("task has neither text nor candidates".to_string()));
        }
        let candidates_json = payload.candidates.as_ref().map(serde_json::to_string).transpose()?;
        let task_id = payload.task_id.clone();
        let now = Utc::now();

        let inserted = self
            .db
            .with_connection(move |conn| {
                let rows = conn.execute(
                    "INSERT OR IGNORE INTO update_tasks \
                     (task_id, tenant_id, raw_text, candidates_json, enqueued_at, attempt_count, status, visible_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending', ?6, ?7)",
                    params![
                        payload.task_id,
                        tenant.as_str(),
                        payload.raw_text,
                        candidates_json,
                        encode_ts(&payload.enqueued_at),
                        now.timestamp_millis(),
                        encode_ts(&now),
                    ],
                )?;
                Ok(rows > 0)
            })
            .await?;

        if inserted {
            log::debug!("enqueued task {}", task_id);
        } else {
            log::debug!("task {} already queued; duplicate enqueue ignored", task_id);
        }
        Ok(task_id)
    }

    /// Lease the oldest visible task for `worker_id`.
    ///
    /// Visible means pending with its backoff elapsed, or in flight with an
    /// expired lease. Expired leases that already used the last attempt are
    /// moved to `failed` instead.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<UpdateTask>> {
        let worker_id = worker_id.to_string();
        let max_attempts = self.policy.max_attempts;
        let lease = millis(self.policy.visibility_timeout);

        let (task, expired) = self
            .db
            .with_connection(move |conn| {
                let now = Utc::now();
                let now_ms = now.timestamp_millis();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let expired: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT task_id FROM update_tasks \
                         WHERE status = 'in_flight' AND visible_at <= ?1 AND attempt_count >= ?2",
                    )?;
                    let rows = stmt.query_map(params![now_ms, max_attempts], |row| row.get(0))?;
                    rows.collect::<std::result::Result<_, _>>()?
                };
                for task_id in &expired {
                    tx.execute(
                        "UPDATE update_tasks SET status = 'failed', lease_owner = NULL, \
                         last_error = COALESCE(last_error, 'lease expired on final attempt'), updated_at = ?1 \
                         WHERE task_id = ?2",
                        params![encode_ts(&now), task_id],
                    )?;
                }

                let next: Option<String> = tx
                    .query_row(
                        "SELECT task_id FROM update_tasks \
                         WHERE status IN ('pending', 'in_flight') AND visible_at <= ?1 \
                         ORDER BY enqueued_at, task_id LIMIT 1",
                        [now_ms],
                        |row| row.get(0),
                    )
                    .optional()?;

                let task = match next {
                    Some(task_id) => {
                        tx.execute(
                            "UPDATE update_tasks SET status = 'in_flight', attempt_count = attempt_count + 1, \
                             visible_at = ?1, lease_owner = ?2, updated_at = ?3 WHERE task_id = ?4",
                            params![now_ms.saturating_add(lease), worker_id, encode_ts(&now), task_id],
                        )?;
                        select_task(&tx, &task_id)?
                    }
                    None => None,
                };
                tx.commit()?;
                Ok((task, expired))
            })
            .await?;

        for task_id in expired {
            log::error!("task {} lease expired on its final attempt; marked failed", task_id);
        }
        if let Some(task) = &task {
            log::debug!("leased task {} (attempt {})", task.task_id, task.attempt_count);
        }
        Ok(task)
    }

    /// Retire a task after a successful attempt by `worker_id`.
    ///
    /// Returns `false` when the worker no longer holds the lease (it expired
    /// and the task was re-leased or finished elsewhere); the task is left
    /// untouched in that case.
    pub async fn complete(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let id = task_id.to_string();
        let owner = worker_id.to_string();
        let retired = self
            .db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let rows = tx.execute(
                    "UPDATE update_tasks SET status = 'done', lease_owner = NULL, last_error = NULL, updated_at = ?1 \
                     WHERE task_id = ?2 AND status = 'in_flight' AND lease_owner = ?3",
                    params![encode_ts(&Utc::now()), id, owner],
                )?;
                if rows == 0 && !task_exists(&tx, &id)? {
                    return Err(FactgraphError::TaskNotFound(id));
                }
                tx.commit()?;
                Ok(rows > 0)
            })
            .await?;
        if !retired {
            log::warn!(
                "worker {} lost the lease on task {} before completing it; result discarded",
                worker_id,
                task_id
            );
        }
        Ok(retired)
    }

    /// Record a failed attempt by `worker_id`. Permanent errors and exhausted
    /// attempts are terminal; anything else goes back to `pending` after a
    /// backoff.
    ///
    /// Returns the task's new status, or `None` when the worker no longer
    /// holds the lease, in which case nothing changes.
    pub async fn fail(&self, task_id: &str, worker_id: &str, error: &FactgraphError) -> Result<Option<TaskStatus>> {
        let id = task_id.to_string();
        let owner = worker_id.to_string();
        let message = error.to_string();
        let retryable = error.is_retryable();
        let policy = self.policy.clone();

        let outcome = self
            .db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let attempt: Option<u32> = tx
                    .query_row(
                        "SELECT attempt_count FROM update_tasks \
                         WHERE task_id = ?1 AND status = 'in_flight' AND lease_owner = ?2",
                        params![id, owner],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(attempt) = attempt else {
                    if !task_exists(&tx, &id)? {
                        return Err(FactgraphError::TaskNotFound(id));
                    }
                    return Ok(None);
                };

                let now = Utc::now();
                let status = if !retryable || attempt >= policy.max_attempts {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Pending
                };
                let visible_at = now.timestamp_millis().saturating_add(millis(policy.backoff_for(attempt)));
                tx.execute(
                    "UPDATE update_tasks SET status = ?1, visible_at = ?2, lease_owner = NULL, last_error = ?3, \
                     updated_at = ?4 WHERE task_id = ?5",
                    params![status.as_str(), visible_at, message, encode_ts(&now), id],
                )?;
                tx.commit()?;
                Ok(Some((status, attempt)))
            })
            .await?;

        let Some((status, attempt)) = outcome else {
            log::warn!(
                "worker {} lost the lease on task {}; failure ignored: {}",
                worker_id,
                task_id,
                error
            );
            return Ok(None);
        };
        match status {
            TaskStatus::Failed => log::error!(
                "task {} failed permanently after {} attempt(s): {}",
                task_id,
                attempt,
                error
            ),
            _ => log::warn!("task {} attempt {} failed, will retry: {}", task_id, attempt, error),
        }
        Ok(Some(status))
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<UpdateTask>> {
        let id = task_id.to_string();
        self.db.with_connection(move |conn| select_task(conn, &id)).await
    }

    /// Terminally failed tasks, most recently failed first.
    pub async fn failed_tasks(&self, limit: usize) -> Result<Vec<UpdateTask>> {
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM update_tasks WHERE status = 'failed' \
                     ORDER BY updated_at DESC, task_id LIMIT ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([limit as i64], task_from_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.db
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM update_tasks GROUP BY status")?;
                let mut rows = stmt.query([])?;
                let mut stats = QueueStats::default();
                while let Some(row) = rows.next()? {
                    let status: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    let count = count.max(0) as u64;
                    match TaskStatus::parse(&status) {
                        Some(TaskStatus::Pending) => stats.pending = count,
                        Some(TaskStatus::InFlight) => stats.in_flight = count,
                        Some(TaskStatus::Done) => stats.done = count,
                        Some(TaskStatus::Failed) => stats.failed = count,
                        None => log::warn!("unknown task status {} in queue", status),
                    }
                }
                Ok(stats)
            })
            .await
    }
}
