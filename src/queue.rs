//! Durable queue of deferred mutating API calls.
//!
//! A request is written to `offline_queue` when the terminal cannot deliver
//! it right away. The sync engine later claims due rows in enqueue order,
//! replays them with their original idempotency key, and deletes them on
//! confirmed success. Failures are rescheduled with exponential backoff;
//! requests that exhaust their attempts (or that the server rejects outright)
//! land in `failed` until an operator requeues or discards them.
//!
//! Delivery order is strict: a pending row still waiting out its backoff
//! holds back every row enqueued after it. Only a dead-lettered row stops
//! blocking, because it has left the pending set.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{Error, Result};
use crate::notify::{Notification, Notifier};

// ---------------------------------------------------------------------------
// Closed tags
// ---------------------------------------------------------------------------

/// Business operation a queued request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    SaleCreate,
    TableOrderSubmit,
    TableOrderPay,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::SaleCreate => "SALE_CREATE",
            RequestType::TableOrderSubmit => "TABLE_ORDER_SUBMIT",
            RequestType::TableOrderPay => "TABLE_ORDER_PAY",
        }
    }
}

impl FromStr for RequestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SALE_CREATE" => Ok(RequestType::SaleCreate),
            "TABLE_ORDER_SUBMIT" => Ok(RequestType::TableOrderSubmit),
            "TABLE_ORDER_PAY" => Ok(RequestType::TableOrderPay),
            other => Err(Error::DatabaseState(format!("unknown request type {other:?}"))),
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(Error::DatabaseState(format!("unsupported method {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    /// Claimed by a sync pass; outcome not yet confirmed.
    Sent,
    /// Dead letter.
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "sent" => Ok(QueueStatus::Sent),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(Error::DatabaseState(format!("unknown queue status {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedRequest {
    pub id: String,
    pub seq: i64,
    pub request_type: RequestType,
    pub url: String,
    pub method: HttpMethod,
    pub payload: Value,
    /// Generated once at enqueue; reused on every retry.
    pub idempotency_key: String,
    /// Unix ms, strictly increasing within one database.
    pub created_at: i64,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub claimed_at: Option<i64>,
}

const SELECT_COLUMNS: &str = "seq, id, request_type, url, method, payload, idempotency_key,
     created_at, status, retry_count, next_retry_at, last_error, claimed_at";

fn parse_column<T: FromStr<Err = Error>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<QueuedRequest> {
    let payload_raw: String = row.get(5)?;
    let payload = serde_json::from_str(&payload_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(QueuedRequest {
        seq: row.get(0)?,
        id: row.get(1)?,
        request_type: parse_column(row, 2)?,
        url: row.get(3)?,
        method: parse_column(row, 4)?,
        payload,
        idempotency_key: row.get(6)?,
        created_at: row.get(7)?,
        status: parse_column(row, 8)?,
        retry_count: row.get(9)?,
        next_retry_at: row.get(10)?,
        last_error: row.get(11)?,
        claimed_at: row.get(12)?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub oldest_pending_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    /// Delivery attempts before a request is dead-lettered.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` failures happened.
    pub fn backoff_delay_ms(&self, attempt: u32) -> i64 {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay_ms
            .saturating_mul(1_i64 << exp)
            .min(self.max_delay_ms)
    }

    pub fn next_retry_at(&self, now_ms: i64, delay_ms: i64, seed: i64) -> i64 {
        let bounded = delay_ms.clamp(1_000, self.max_delay_ms.max(1_000));
        now_ms + bounded + deterministic_jitter_ms(seed)
    }
}

/// 50..=749 ms, derived from the row so concurrent terminals spread out.
fn deterministic_jitter_ms(seed: i64) -> i64 {
    (seed.unsigned_abs() % 700) as i64 + 50
}

/// What happened to a request after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled { next_retry_at: i64 },
    DeadLettered,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct OfflineQueue {
    db: Arc<DbState>,
    notifier: Notifier,
    retry: RetryPolicy,
}

impl OfflineQueue {
    pub fn new(db: Arc<DbState>, notifier: Notifier, retry: RetryPolicy) -> Self {
        Self {
            db,
            notifier,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Store a mutating call for later delivery.
    pub fn enqueue(
        &self,
        request_type: RequestType,
        url: &str,
        payload: Value,
        method: HttpMethod,
    ) -> Result<QueuedRequest> {
        let id = Uuid::new_v4().to_string();
        let idempotency_key = Uuid::new_v4().to_string();
        let payload_text = serde_json::to_string(&payload)?;

        let (seq, created_at) = {
            let conn = self.db.lock()?;
            let last: Option<i64> =
                conn.query_row("SELECT MAX(created_at) FROM offline_queue", [], |row| {
                    row.get(0)
                })?;
            let now = now_ms();
            let created_at = match last {
                Some(last) if last >= now => last + 1,
                _ => now,
            };
            conn.execute(
                "INSERT INTO offline_queue (
                     id, request_type, url, method, payload, idempotency_key,
                     created_at, status, retry_count, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?7)",
                params![
                    id,
                    request_type.as_str(),
                    url,
                    method.as_str(),
                    payload_text,
                    idempotency_key,
                    created_at
                ],
            )?;
            (conn.last_insert_rowid(), created_at)
        };

        info!(%id, %request_type, url, "Request queued for offline delivery");
        self.notifier.emit(Notification::RequestQueued {
            id: id.clone(),
            request_type,
        });

        Ok(QueuedRequest {
            id,
            seq,
            request_type,
            url: url.to_string(),
            method,
            payload,
            idempotency_key,
            created_at,
            status: QueueStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            claimed_at: None,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedRequest>> {
        let conn = self.db.lock()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM offline_queue WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], row_to_request).optional()?)
    }

    /// Pending rows ready to send, oldest first, up to the first row whose
    /// backoff has not elapsed yet.
    pub fn due_pending(&self) -> Result<Vec<QueuedRequest>> {
        self.due_pending_at(now_ms())
    }

    pub(crate) fn due_pending_at(&self, now: i64) -> Result<Vec<QueuedRequest>> {
        let conn = self.db.lock()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM offline_queue
             WHERE status = 'pending'
             ORDER BY created_at ASC, seq ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut due = Vec::new();
        for row in stmt.query_map([], row_to_request)? {
            let request = row?;
            if request.next_retry_at.is_some_and(|at| at > now) {
                break;
            }
            due.push(request);
        }
        Ok(due)
    }

    /// Move a row from `pending` to `sent`. Returns `false` when another
    /// pass (possibly in another process) already claimed it.
    pub fn claim(&self, id: &str) -> Result<bool> {
        let now = now_ms();
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE offline_queue
             SET status = 'sent', claimed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        Ok(changed == 1)
    }

    /// Confirmed delivery: the row is removed.
    pub fn complete(&self, id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
        debug!(%id, "Queued request delivered");
        Ok(())
    }

    /// Reschedule or dead-letter a request after a failed delivery.
    pub fn record_failure(&self, request: &QueuedRequest, err: &Error) -> Result<FailureOutcome> {
        self.record_failure_at(request, err, now_ms())
    }

    pub(crate) fn record_failure_at(
        &self,
        request: &QueuedRequest,
        err: &Error,
        now: i64,
    ) -> Result<FailureOutcome> {
        let message = err.to_string();

        let (retry_count, outcome) = if matches!(err, Error::Transport(_)) {
            // Never reached the server. The sync engine stops the pass and
            // waits for the network, so the row stays due and keeps its
            // place at the head of the queue.
            (
                request.retry_count,
                FailureOutcome::Rescheduled { next_retry_at: now },
            )
        } else if err.is_backpressure() {
            let delay_ms = err
                .retry_after_secs()
                .map(|s| (s as i64).saturating_mul(1_000))
                .unwrap_or(self.retry.base_delay_ms);
            let next = self.retry.next_retry_at(now, delay_ms, request.seq);
            (
                request.retry_count,
                FailureOutcome::Rescheduled {
                    next_retry_at: next,
                },
            )
        } else {
            let attempts = request.retry_count + 1;
            if !err.is_retryable() || attempts >= self.retry.max_attempts {
                (attempts, FailureOutcome::DeadLettered)
            } else {
                let delay_ms = self.retry.backoff_delay_ms(attempts);
                let next = self.retry.next_retry_at(now, delay_ms, request.seq);
                (
                    attempts,
                    FailureOutcome::Rescheduled {
                        next_retry_at: next,
                    },
                )
            }
        };

        {
            let conn = self.db.lock()?;
            match outcome {
                FailureOutcome::Rescheduled { next_retry_at } => {
                    conn.execute(
                        "UPDATE offline_queue
                         SET status = 'pending', retry_count = ?2, next_retry_at = ?3,
                             last_error = ?4, claimed_at = NULL, updated_at = ?5
                         WHERE id = ?1",
                        params![request.id, retry_count, next_retry_at, message, now],
                    )?;
                }
                FailureOutcome::DeadLettered => {
                    conn.execute(
                        "UPDATE offline_queue
                         SET status = 'failed', retry_count = ?2, next_retry_at = NULL,
                             last_error = ?3, claimed_at = NULL, updated_at = ?4
                         WHERE id = ?1",
                        params![request.id, retry_count, message, now],
                    )?;
                }
            }
        }

        match outcome {
            FailureOutcome::Rescheduled { next_retry_at } => {
                warn!(
                    id = %request.id,
                    retry_count,
                    next_retry_at,
                    error = %message,
                    "Queued request failed; rescheduled"
                );
            }
            FailureOutcome::DeadLettered => {
                warn!(
                    id = %request.id,
                    retry_count,
                    error = %message,
                    "Queued request dead-lettered"
                );
                self.notifier.emit(Notification::RequestDeadLettered {
                    id: request.id.clone(),
                    request_type: request.request_type,
                    error: message,
                });
            }
        }

        Ok(outcome)
    }

    /// Return `sent` rows claimed longer than `lease` ago to `pending`.
    pub fn recover_stale_claims(&self, lease: Duration) -> Result<usize> {
        self.recover_stale_claims_at(lease, now_ms())
    }

    pub(crate) fn recover_stale_claims_at(&self, lease: Duration, now: i64) -> Result<usize> {
        let cutoff = now - lease.as_millis() as i64;
        let conn = self.db.lock()?;
        let recovered = conn.execute(
            "UPDATE offline_queue
             SET status = 'pending', claimed_at = NULL, updated_at = ?2
             WHERE status = 'sent' AND (claimed_at IS NULL OR claimed_at <= ?1)",
            params![cutoff, now],
        )?;
        if recovered > 0 {
            info!(recovered, "Recovered stale queue claims");
        }
        Ok(recovered)
    }

    pub fn dead_letters(&self) -> Result<Vec<QueuedRequest>> {
        let conn = self.db.lock()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM offline_queue
             WHERE status = 'failed'
             ORDER BY created_at ASC, seq ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_request)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Put a dead letter back in line. The idempotency key is kept.
    pub fn requeue(&self, id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE offline_queue
             SET status = 'pending', retry_count = 0, next_retry_at = NULL,
                 last_error = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![id, now_ms()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("dead-lettered request {id}")));
        }
        info!(%id, "Dead-lettered request requeued");
        Ok(())
    }

    pub fn discard(&self, id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "DELETE FROM offline_queue WHERE id = ?1 AND status = 'failed'",
            params![id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("dead-lettered request {id}")));
        }
        info!(%id, "Dead-lettered request discarded");
        Ok(())
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.db.lock()?;
        let mut stats = QueueStats::default();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM offline_queue GROUP BY status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match status.as_str() {
                "pending" => stats.pending = count,
                "sent" => stats.sent = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        stats.oldest_pending_at = conn.query_row(
            "SELECT MIN(created_at) FROM offline_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(stats)
    }
}
