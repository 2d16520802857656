use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use super::{StoreError, decode_opt_ts, decode_ts, encode_ts};
use crate::models::Evaluation;

pub const LAST_SYNC_KEY: &str = "last_sync_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOperation {
    Create,
    Delete,
}

impl QueueOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueOperation::Create => "create",
            QueueOperation::Delete => "delete",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "create" => Ok(QueueOperation::Create),
            "delete" => Ok(QueueOperation::Delete),
            other => Err(StoreError::Corrupt(format!("unknown queue operation {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    Dead,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Dead => "dead",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "queued" => Ok(QueueStatus::Queued),
            "dead" => Ok(QueueStatus::Dead),
            other => Err(StoreError::Corrupt(format!("unknown queue status {other}"))),
        }
    }
}

/// A remote write waiting to be replayed. `seq` gives the replay order.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub seq: i64,
    pub operation: QueueOperation,
    pub evaluation_id: String,
    pub payload: Option<Evaluation>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: QueueStatus,
}

impl QueueEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, FromRow)]
struct QueueRow {
    seq: i64,
    operation: String,
    evaluation_id: String,
    payload: Option<String>,
    enqueued_at: String,
    attempts: i64,
    next_attempt_at: Option<String>,
    last_error: Option<String>,
    status: String,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = StoreError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(QueueEntry {
            seq: row.seq,
            operation: QueueOperation::parse(&row.operation)?,
            payload: row
                .payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            enqueued_at: decode_ts(&row.enqueued_at)?,
            attempts: u32::try_from(row.attempts)
                .map_err(|_| StoreError::Corrupt(format!("attempts out of range: {}", row.attempts)))?,
            next_attempt_at: decode_opt_ts(row.next_attempt_at.as_deref())?,
            last_error: row.last_error,
            status: QueueStatus::parse(&row.status)?,
            evaluation_id: row.evaluation_id,
        })
    }
}

const SELECT_SQL: &str = r#"
    SELECT seq, operation, evaluation_id, payload, enqueued_at, attempts,
        next_attempt_at, last_error, status
    FROM sync_queue
"#;

fn into_entries(rows: Vec<QueueRow>) -> Result<Vec<QueueEntry>, StoreError> {
    rows.into_iter().map(QueueEntry::try_from).collect()
}

pub async fn enqueue(
    db: &SqlitePool,
    operation: QueueOperation,
    evaluation_id: &str,
    payload: Option<&Evaluation>,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let payload = payload.map(serde_json::to_string).transpose()?;
    let result = sqlx::query(
        r#"
        INSERT INTO sync_queue (operation, evaluation_id, payload, enqueued_at, attempts, status)
        VALUES (?1, ?2, ?3, ?4, 0, 'queued')
        "#,
    )
    .bind(operation.as_str())
    .bind(evaluation_id)
    .bind(payload)
    .bind(encode_ts(&now))
    .execute(db)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn fetch_entries(
    db: &SqlitePool,
    status: QueueStatus,
) -> Result<Vec<QueueEntry>, StoreError> {
    let sql = format!("{SELECT_SQL} WHERE status = ?1 ORDER BY seq ASC");
    let rows = sqlx::query_as::<_, QueueRow>(&sql)
        .bind(status.as_str())
        .fetch_all(db)
        .await?;
    into_entries(rows)
}

pub async fn remove(db: &SqlitePool, seq: i64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM sync_queue WHERE seq = ?1")
        .bind(seq)
        .execute(db)
        .await?;
    Ok(())
}

/// Removes every create entry for `evaluation_id`, whatever its status, and
/// returns what was removed.
pub async fn take_creates(db: &SqlitePool, evaluation_id: &str) -> Result<Vec<QueueEntry>, StoreError> {
    let mut tx = db.begin().await?;
    let sql = format!("{SELECT_SQL} WHERE operation = 'create' AND evaluation_id = ?1 ORDER BY seq ASC");
    let rows = sqlx::query_as::<_, QueueRow>(&sql)
        .bind(evaluation_id)
        .fetch_all(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM sync_queue WHERE operation = 'create' AND evaluation_id = ?1")
        .bind(evaluation_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    into_entries(rows)
}

/// Ids with at least one entry of `operation`, optionally only in `status`.
pub async fn evaluation_ids(
    db: &SqlitePool,
    operation: QueueOperation,
    status: Option<QueueStatus>,
) -> Result<HashSet<String>, StoreError> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT evaluation_id FROM sync_queue
        WHERE operation = ?1 AND (?2 IS NULL OR status = ?2)
        "#,
    )
    .bind(operation.as_str())
    .bind(status.map(QueueStatus::as_str))
    .fetch_all(db)
    .await?;
    Ok(ids.into_iter().collect())
}

/// Drops queued (not dead) creates for records the remote store now holds.
pub async fn drop_queued_creates(db: &SqlitePool, evaluation_ids: &[String]) -> Result<u64, StoreError> {
    let mut tx = db.begin().await?;
    let mut dropped = 0;
    for id in evaluation_ids {
        let result = sqlx::query(
            "DELETE FROM sync_queue WHERE operation = 'create' AND status = 'queued' AND evaluation_id = ?1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        dropped += result.rows_affected();
    }
    tx.commit().await?;
    Ok(dropped)
}

pub async fn record_failure(
    db: &SqlitePool,
    seq: i64,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE sync_queue SET attempts = ?2, next_attempt_at = ?3, last_error = ?4 WHERE seq = ?1",
    )
    .bind(seq)
    .bind(i64::from(attempts))
    .bind(encode_ts(&next_attempt_at))
    .bind(error)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn mark_dead(db: &SqlitePool, seq: i64, attempts: u32, error: &str) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE sync_queue
        SET status = 'dead', attempts = ?2, next_attempt_at = NULL, last_error = ?3
        WHERE seq = ?1
        "#,
    )
    .bind(seq)
    .bind(i64::from(attempts))
    .bind(error)
    .execute(db)
    .await?;
    Ok(())
}

/// Puts dead letters back in line with a clean attempt count.
pub async fn requeue_dead(db: &SqlitePool) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_queue
        SET status = 'queued', attempts = 0, next_attempt_at = NULL
        WHERE status = 'dead'
        "#,
    )
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}

pub async fn count(db: &SqlitePool, status: QueueStatus) -> Result<u64, StoreError> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE status = ?1")
        .bind(status.as_str())
        .fetch_one(db)
        .await?;
    Ok(n.max(0) as u64)
}

pub async fn get_meta(db: &SqlitePool, key: &str) -> Result<Option<String>, StoreError> {
    let value = sqlx::query_scalar("SELECT value FROM sync_meta WHERE key = ?1")
        .bind(key)
        .fetch_optional(db)
        .await?;
    Ok(value)
}

pub async fn set_meta(db: &SqlitePool, key: &str, value: &str) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO sync_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn last_sync_at(db: &SqlitePool) -> Result<Option<DateTime<Utc>>, StoreError> {
    decode_opt_ts(get_meta(db, LAST_SYNC_KEY).await?.as_deref())
}

pub async fn set_last_sync_at(db: &SqlitePool, at: DateTime<Utc>) -> Result<(), StoreError> {
    set_meta(db, LAST_SYNC_KEY, &encode_ts(&at)).await
}
