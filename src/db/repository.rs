use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool};

use super::{StoreError, SyncState, decode_opt_ts, decode_ts, encode_ts};
use crate::models::{Evaluation, EvaluationFilter};

/// Upper bound on list queries served to clients.
pub const LIST_LIMIT: i64 = 100;

const INSERT_SQL: &str = r#"
    INSERT INTO evaluations
        (id, teacher_name, coordinator_name, class_label, subject, visit_date,
        session_number, visit_number, rubric, ratings, category_totals, grand_total,
        strengths, to_improve, recommendations, created_at, updated_at, synced_at, sync_state)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
    ON CONFLICT(id) DO NOTHING
"#;

const UPSERT_SQL: &str = r#"
    INSERT INTO evaluations
        (id, teacher_name, coordinator_name, class_label, subject, visit_date,
        session_number, visit_number, rubric, ratings, category_totals, grand_total,
        strengths, to_improve, recommendations, created_at, updated_at, synced_at, sync_state)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
    ON CONFLICT(id) DO UPDATE SET
        teacher_name = excluded.teacher_name,
        coordinator_name = excluded.coordinator_name,
        class_label = excluded.class_label,
        subject = excluded.subject,
        visit_date = excluded.visit_date,
        session_number = excluded.session_number,
        visit_number = excluded.visit_number,
        rubric = excluded.rubric,
        ratings = excluded.ratings,
        category_totals = excluded.category_totals,
        grand_total = excluded.grand_total,
        strengths = excluded.strengths,
        to_improve = excluded.to_improve,
        recommendations = excluded.recommendations,
        created_at = excluded.created_at,
        updated_at = excluded.updated_at,
        synced_at = excluded.synced_at,
        sync_state = excluded.sync_state
"#;

const SELECT_SQL: &str = r#"
    SELECT id, teacher_name, coordinator_name, class_label, subject, visit_date,
        session_number, visit_number, rubric, ratings, category_totals, grand_total,
        strengths, to_improve, recommendations, created_at, updated_at, synced_at, sync_state
    FROM evaluations
"#;

#[derive(Debug, FromRow)]
struct EvaluationRow {
    id: String,
    teacher_name: String,
    coordinator_name: String,
    class_label: String,
    subject: String,
    visit_date: String,
    session_number: i64,
    visit_number: i64,
    rubric: String,
    ratings: String,
    category_totals: String,
    grand_total: i64,
    strengths: String,
    to_improve: String,
    recommendations: String,
    created_at: String,
    updated_at: Option<String>,
    synced_at: Option<String>,
    sync_state: String,
}

impl EvaluationRow {
    fn into_evaluation(self) -> Result<Evaluation, StoreError> {
        // rejects unknown states early
        let _: SyncState = self.sync_state.parse()?;
        let visit_date = self
            .visit_date
            .parse::<NaiveDate>()
            .map_err(|e| StoreError::Corrupt(format!("bad visit_date {}: {e}", self.visit_date)))?;

        Ok(Evaluation {
            visit_date,
            session_number: narrow(self.session_number, "session_number")?,
            visit_number: narrow(self.visit_number, "visit_number")?,
            rubric: serde_json::from_str(&self.rubric)?,
            ratings: serde_json::from_str(&self.ratings)?,
            category_totals: serde_json::from_str(&self.category_totals)?,
            grand_total: narrow(self.grand_total, "grand_total")?,
            created_at: decode_ts(&self.created_at)?,
            updated_at: decode_opt_ts(self.updated_at.as_deref())?,
            synced_at: decode_opt_ts(self.synced_at.as_deref())?,
            id: self.id,
            teacher_name: self.teacher_name,
            coordinator_name: self.coordinator_name,
            class_label: self.class_label,
            subject: self.subject,
            strengths: self.strengths,
            to_improve: self.to_improve,
            recommendations: self.recommendations,
        })
    }
}

fn narrow<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn rows_into_evaluations(rows: Vec<EvaluationRow>) -> Result<Vec<Evaluation>, StoreError> {
    rows.into_iter().map(EvaluationRow::into_evaluation).collect()
}

async fn upsert_with<'e, E>(
    executor: E,
    sql: &str,
    evaluation: &Evaluation,
    state: SyncState,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(sql)
        .bind(&evaluation.id)
        .bind(&evaluation.teacher_name)
        .bind(&evaluation.coordinator_name)
        .bind(&evaluation.class_label)
        .bind(&evaluation.subject)
        .bind(evaluation.visit_date.to_string())
        .bind(i64::from(evaluation.session_number))
        .bind(i64::from(evaluation.visit_number))
        .bind(serde_json::to_string(&evaluation.rubric)?)
        .bind(serde_json::to_string(&evaluation.ratings)?)
        .bind(serde_json::to_string(&evaluation.category_totals)?)
        .bind(i64::from(evaluation.grand_total))
        .bind(&evaluation.strengths)
        .bind(&evaluation.to_improve)
        .bind(&evaluation.recommendations)
        .bind(encode_ts(&evaluation.created_at))
        .bind(evaluation.updated_at.as_ref().map(encode_ts))
        .bind(evaluation.synced_at.as_ref().map(encode_ts))
        .bind(state.as_str())
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

async fn fetch_where(
    db: &SqlitePool,
    filter: &EvaluationFilter,
    state: Option<SyncState>,
    limit: Option<i64>,
) -> Result<Vec<Evaluation>, StoreError> {
    let sql = format!(
        "{SELECT_SQL}
        WHERE (?1 IS NULL OR teacher_name = ?1)
            AND (?2 IS NULL OR coordinator_name = ?2)
            AND (?3 IS NULL OR sync_state = ?3)
        ORDER BY created_at DESC, id DESC
        LIMIT ?4"
    );
    let rows = sqlx::query_as::<_, EvaluationRow>(&sql)
        .bind(filter.teacher_name.as_deref())
        .bind(filter.coordinator_name.as_deref())
        .bind(state.map(SyncState::as_str))
        .bind(limit.unwrap_or(-1))
        .fetch_all(db)
        .await?;
    rows_into_evaluations(rows)
}

/// Newest first. `limit` of `None` returns everything.
pub async fn fetch_evaluations(
    db: &SqlitePool,
    filter: &EvaluationFilter,
    limit: Option<i64>,
) -> Result<Vec<Evaluation>, StoreError> {
    fetch_where(db, filter, None, limit).await
}

/// Records written locally that the remote store has not confirmed yet.
pub async fn fetch_pending(
    db: &SqlitePool,
    filter: &EvaluationFilter,
) -> Result<Vec<Evaluation>, StoreError> {
    fetch_where(db, filter, Some(SyncState::Pending), None).await
}

pub async fn find_evaluation(db: &SqlitePool, id: &str) -> Result<Option<Evaluation>, StoreError> {
    let sql = format!("{SELECT_SQL} WHERE id = ?1");
    sqlx::query_as::<_, EvaluationRow>(&sql)
        .bind(id)
        .fetch_optional(db)
        .await?
        .map(EvaluationRow::into_evaluation)
        .transpose()
}

pub async fn find_sync_state(db: &SqlitePool, id: &str) -> Result<Option<SyncState>, StoreError> {
    let state: Option<String> = sqlx::query_scalar("SELECT sync_state FROM evaluations WHERE id = ?1")
        .bind(id)
        .fetch_optional(db)
        .await?;
    state.map(|s| s.parse()).transpose()
}

/// Inserts a new record. Returns `false` when the id is already taken.
pub async fn insert_evaluation(
    db: &SqlitePool,
    evaluation: &Evaluation,
    state: SyncState,
) -> Result<bool, StoreError> {
    let affected = upsert_with(db, INSERT_SQL, evaluation, state).await?;
    Ok(affected == 1)
}

pub async fn upsert_evaluation(
    db: &SqlitePool,
    evaluation: &Evaluation,
    state: SyncState,
) -> Result<(), StoreError> {
    upsert_with(db, UPSERT_SQL, evaluation, state).await?;
    Ok(())
}

/// Upserts a batch in one transaction, stamping each record with `synced_at`.
pub async fn upsert_batch(
    db: &SqlitePool,
    evaluations: &[Evaluation],
    synced_at: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let mut tx = db.begin().await?;
    for evaluation in evaluations {
        let mut record = evaluation.clone();
        record.synced_at = Some(synced_at);
        upsert_with(&mut *tx, UPSERT_SQL, &record, SyncState::Synced).await?;
    }
    tx.commit().await?;
    Ok(evaluations.len())
}

/// Replaces the synced part of the local cache within `scope` by `fresh`.
///
/// Rows still pending locally are left alone, even when `fresh` carries the
/// same id. With `prune` unset, synced rows absent from `fresh` survive.
pub async fn refresh_synced(
    db: &SqlitePool,
    scope: &EvaluationFilter,
    fresh: &[Evaluation],
    prune: bool,
) -> Result<(), StoreError> {
    let mut tx = db.begin().await?;

    if prune {
        let keep: HashSet<&str> = fresh.iter().map(|e| e.id.as_str()).collect();
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM evaluations
            WHERE sync_state = 'synced'
                AND (?1 IS NULL OR teacher_name = ?1)
                AND (?2 IS NULL OR coordinator_name = ?2)
            "#,
        )
        .bind(scope.teacher_name.as_deref())
        .bind(scope.coordinator_name.as_deref())
        .fetch_all(&mut *tx)
        .await?;

        for id in ids.iter().filter(|id| !keep.contains(id.as_str())) {
            sqlx::query("DELETE FROM evaluations WHERE id = ?1 AND sync_state = 'synced'")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
    }

    let sql = format!("{UPSERT_SQL} WHERE evaluations.sync_state = 'synced'");
    for evaluation in fresh {
        upsert_with(&mut *tx, &sql, evaluation, SyncState::Synced).await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn mark_synced(
    db: &SqlitePool,
    id: &str,
    synced_at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE evaluations SET sync_state = 'synced', synced_at = ?2 WHERE id = ?1",
    )
    .bind(id)
    .bind(encode_ts(&synced_at))
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Marks the given records synced in one transaction.
pub async fn mark_batch_synced(
    db: &SqlitePool,
    ids: &[String],
    synced_at: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let stamp = encode_ts(&synced_at);
    let mut tx = db.begin().await?;
    let mut marked = 0;
    for id in ids {
        let result = sqlx::query(
            "UPDATE evaluations SET sync_state = 'synced', synced_at = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(&stamp)
        .execute(&mut *tx)
        .await?;
        marked += result.rows_affected();
    }
    tx.commit().await?;
    Ok(marked)
}

pub async fn delete_evaluation(db: &SqlitePool, id: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM evaluations WHERE id = ?1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_for_teacher(db: &SqlitePool, teacher_name: &str) -> Result<u32, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM evaluations WHERE teacher_name = ?1")
        .bind(teacher_name)
        .fetch_one(db)
        .await?;
    narrow(count, "count")
}
