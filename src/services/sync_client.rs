use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{RetryPolicy, SyncConfig};
use crate::db::queue::{self, QueueEntry, QueueOperation, QueueStatus};
use crate::db::repository::{self, LIST_LIMIT};
use crate::db::{self, StoreError, SyncState};
use crate::models::{self, Evaluation, EvaluationDraft, EvaluationFilter, ValidationError};
use crate::remote::{RemoteError, RemoteStore};
use crate::services::Connectivity;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Evaluation {0} not found")]
    NotFound(String),

    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Whether a write reached the remote store or waits in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Synced,
    Queued,
    /// The record never left this device; its queued create was dropped.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Remote,
    Cache,
}

#[derive(Debug, Clone, Serialize)]
pub struct Created {
    pub evaluation: Evaluation,
    pub outcome: WriteOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct Loaded {
    pub evaluations: Vec<Evaluation>,
    pub source: Source,
    /// Set when the remote store could not be reached and the cache was used.
    pub stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub succeeded: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    /// Not yet due, or held back behind a failed entry for the same record.
    pub deferred: usize,
    pub reconciled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub replaying: bool,
    pub queued: u64,
    pub dead: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Offline-first evaluation store: a local SQLite cache mirrored to a
/// [`RemoteStore`] whenever it can be reached.
pub struct SyncClient {
    db: SqlitePool,
    remote: Arc<dyn RemoteStore>,
    connectivity: Connectivity,
    retry: RetryPolicy,
    replaying: AtomicBool,
}

impl SyncClient {
    pub async fn open(
        config: &SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
    ) -> Result<Self, SyncError> {
        let db = db::connect(&config.database_url).await?;
        let client = Self::with_pool(db, remote, connectivity, config.retry);
        let queued = queue::count(&client.db, QueueStatus::Queued).await?;
        info!("sync client opened, {} operations waiting", queued);
        Ok(client)
    }

    pub fn with_pool(
        db: SqlitePool,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            remote,
            connectivity,
            retry,
            replaying: AtomicBool::new(false),
        }
    }

    pub async fn close(&self) {
        self.db.close().await;
        info!("sync client closed");
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Probes the remote store and updates the online flag accordingly.
    pub async fn check_connectivity(&self) -> bool {
        let online = match self.remote.health().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Remote store unreachable, working from the local cache: {}", e);
                false
            }
        };
        self.connectivity.set_online(online);
        online
    }

    pub async fn create(&self, draft: EvaluationDraft) -> Result<Created, SyncError> {
        draft.validate()?;
        let next_visit = repository::count_for_teacher(&self.db, draft.teacher_name.trim()).await? + 1;
        let mut evaluation = draft.into_evaluation(models::new_evaluation_id(), next_visit, models::now())?;

        repository::upsert_evaluation(&self.db, &evaluation, SyncState::Pending).await?;
        info!(id = %evaluation.id, grand_total = evaluation.grand_total, "evaluation saved locally");

        if !self.connectivity.is_online() {
            self.enqueue(QueueOperation::Create, &evaluation.id, Some(&evaluation)).await?;
            return Ok(Created {
                evaluation,
                outcome: WriteOutcome::Queued,
            });
        }

        match self.remote.create(&evaluation).await {
            Ok(_) | Err(RemoteError::Conflict(_)) => {
                let synced_at = models::now();
                repository::mark_synced(&self.db, &evaluation.id, synced_at).await?;
                evaluation.synced_at = Some(synced_at);
                Ok(Created {
                    evaluation,
                    outcome: WriteOutcome::Synced,
                })
            }
            Err(e) => {
                warn!("Remote create failed for {}, queueing: {}", evaluation.id, e);
                self.enqueue(QueueOperation::Create, &evaluation.id, Some(&evaluation)).await?;
                Ok(Created {
                    evaluation,
                    outcome: WriteOutcome::Queued,
                })
            }
        }
    }

    pub async fn delete(&self, id: &str) -> Result<WriteOutcome, SyncError> {
        let state = repository::find_sync_state(&self.db, id).await?;
        let known_locally = repository::delete_evaluation(&self.db, id).await?;
        let dropped = queue::take_creates(&self.db, id).await?;
        if !dropped.is_empty() {
            // a synced row or an attempted send may already be on the remote store
            let maybe_sent = state == Some(SyncState::Synced) || dropped.iter().any(|e| e.attempts > 0);
            if !maybe_sent {
                info!(id, "dropped queued create, remote store never saw the record");
                return Ok(WriteOutcome::Discarded);
            }
            debug!(id, "dropped queued create, deleting remotely as well");
        }

        if !self.connectivity.is_online() {
            if !known_locally {
                return Err(SyncError::NotFound(id.to_string()));
            }
            self.enqueue(QueueOperation::Delete, id, None).await?;
            return Ok(WriteOutcome::Queued);
        }

        match self.remote.delete(id).await {
            Ok(()) => Ok(WriteOutcome::Synced),
            Err(RemoteError::NotFound(_)) if known_locally => Ok(WriteOutcome::Synced),
            Err(RemoteError::NotFound(_)) => Err(SyncError::NotFound(id.to_string())),
            Err(e) => {
                warn!("Remote delete failed for {}, queueing: {}", id, e);
                self.enqueue(QueueOperation::Delete, id, None).await?;
                Ok(WriteOutcome::Queued)
            }
        }
    }

    pub async fn load(&self, filter: &EvaluationFilter) -> Result<Loaded, SyncError> {
        if self.connectivity.is_online() {
            match self.remote.list(filter).await {
                Ok(fresh) => return self.merge_remote(filter, fresh).await,
                Err(e) => warn!("Remote list failed, serving cached evaluations: {}", e),
            }
        } else {
            debug!("offline, serving cached evaluations");
        }

        let evaluations = repository::fetch_evaluations(&self.db, filter, None).await?;
        Ok(Loaded {
            evaluations,
            source: Source::Cache,
            stale: true,
        })
    }

    async fn merge_remote(
        &self,
        filter: &EvaluationFilter,
        fresh: Vec<Evaluation>,
    ) -> Result<Loaded, SyncError> {
        // a full page may be truncated; keep what it does not mention
        let prune = (fresh.len() as i64) < LIST_LIMIT;
        let deleting = queue::evaluation_ids(&self.db, QueueOperation::Delete, None).await?;
        let fresh: Vec<Evaluation> = fresh
            .into_iter()
            .filter(|e| !deleting.contains(&e.id))
            .collect();
        repository::refresh_synced(&self.db, filter, &fresh, prune).await?;

        let mut by_id: HashMap<String, Evaluation> =
            fresh.into_iter().map(|e| (e.id.clone(), e)).collect();
        for pending in repository::fetch_pending(&self.db, filter).await? {
            by_id.insert(pending.id.clone(), pending);
        }

        let mut evaluations: Vec<Evaluation> = by_id.into_values().collect();
        evaluations.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(Loaded {
            evaluations,
            source: Source::Remote,
            stale: false,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Evaluation, SyncError> {
        let deleting = queue::evaluation_ids(&self.db, QueueOperation::Delete, None).await?;
        if deleting.contains(id) {
            return Err(SyncError::NotFound(id.to_string()));
        }
        if self.connectivity.is_online() {
            match self.remote.get(id).await {
                Ok(evaluation) => return Ok(evaluation),
                Err(RemoteError::NotFound(_)) => {}
                Err(e) => warn!("Remote get failed for {}, trying the cache: {}", id, e),
            }
        }
        repository::find_evaluation(&self.db, id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    /// Replays due queue entries in order. Returns `None` when offline or
    /// when another pass is already running.
    pub async fn replay_queue(&self) -> Result<Option<ReplayStats>, SyncError> {
        if !self.connectivity.is_online() {
            debug!("offline, replay skipped");
            return Ok(None);
        }
        if self.replaying.swap(true, Ordering::SeqCst) {
            debug!("replay already running");
            return Ok(None);
        }
        let _guard = ReplayGuard(&self.replaying);

        let mut stats = self.replay_pass().await?;
        if stats.succeeded > 0 {
            info!("Replayed {} queued operations, reconciling", stats.succeeded);
            match self.reconcile().await {
                Ok(_) => stats.reconciled = true,
                Err(e) => warn!("Full reconciliation failed: {}", e),
            }
        }
        Ok(Some(stats))
    }

    async fn replay_pass(&self) -> Result<ReplayStats, SyncError> {
        let entries = queue::fetch_entries(&self.db, QueueStatus::Queued).await?;
        if entries.is_empty() {
            return Ok(ReplayStats::default());
        }
        info!("Processing sync queue: {} operations", entries.len());

        let now = models::now();
        let mut stats = ReplayStats::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in entries {
            if blocked.contains(&entry.evaluation_id) || !entry.is_due(now) {
                blocked.insert(entry.evaluation_id.clone());
                stats.deferred += 1;
                continue;
            }

            match self.apply(&entry).await {
                Ok(()) => {
                    queue::remove(&self.db, entry.seq).await?;
                    if entry.operation == QueueOperation::Create {
                        repository::mark_synced(&self.db, &entry.evaluation_id, models::now()).await?;
                    }
                    debug!(seq = entry.seq, id = %entry.evaluation_id, "replayed {}", entry.operation.as_str());
                    stats.succeeded += 1;
                }
                Err(error) => {
                    blocked.insert(entry.evaluation_id.clone());
                    let attempts = entry.attempts + 1;
                    let message = error.to_string();
                    if error.is_transient() && !self.retry.exhausted(attempts) {
                        let delay = chrono::Duration::from_std(self.retry.delay(attempts))
                            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
                        queue::record_failure(&self.db, entry.seq, attempts, now + delay, &message).await?;
                        warn!(
                            "Replay of {} {} failed (attempt {}), retrying later: {}",
                            entry.operation.as_str(),
                            entry.evaluation_id,
                            attempts,
                            message
                        );
                        stats.retrying += 1;
                    } else {
                        queue::mark_dead(&self.db, entry.seq, attempts, &message).await?;
                        warn!(
                            "Replay of {} {} dead-lettered after {} attempts: {}",
                            entry.operation.as_str(),
                            entry.evaluation_id,
                            attempts,
                            message
                        );
                        stats.dead_lettered += 1;
                    }
                }
            }
        }

        info!("Sync queue pass finished: {:?}", stats);
        Ok(stats)
    }

    async fn apply(&self, entry: &QueueEntry) -> Result<(), RemoteError> {
        match entry.operation {
            QueueOperation::Create => {
                let payload = entry.payload.as_ref().ok_or_else(|| RemoteError::Rejected {
                    status: 0,
                    message: "queued create has no payload".to_string(),
                })?;
                match self.remote.create(payload).await {
                    Ok(_) | Err(RemoteError::Conflict(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            QueueOperation::Delete => match self.remote.delete(&entry.evaluation_id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    /// Pushes the local cache as an upsert batch, marks what was pushed
    /// synced, records the sync time and reloads from the remote store.
    ///
    /// Rows whose create is dead-lettered stay behind, as do rows that fail
    /// validation, so one bad record cannot block every later sync.
    pub async fn reconcile(&self) -> Result<Loaded, SyncError> {
        let local = repository::fetch_evaluations(&self.db, &EvaluationFilter::default(), None).await?;
        let dead = queue::evaluation_ids(&self.db, QueueOperation::Create, Some(QueueStatus::Dead)).await?;

        let mut batch = Vec::with_capacity(local.len());
        for evaluation in local {
            if dead.contains(&evaluation.id) {
                debug!(id = %evaluation.id, "create is dead-lettered, left out of full sync");
                continue;
            }
            let mut checked = evaluation.clone();
            if let Err(e) = checked.seal() {
                warn!("Leaving {} out of full sync: {}", evaluation.id, e);
                continue;
            }
            batch.push(evaluation);
        }

        let upserted = self.remote.bulk_upsert(&batch).await?;
        let ids: Vec<String> = batch.into_iter().map(|e| e.id).collect();

        let now = models::now();
        repository::mark_batch_synced(&self.db, &ids, now).await?;
        let superseded = queue::drop_queued_creates(&self.db, &ids).await?;
        queue::set_last_sync_at(&self.db, now).await?;
        info!(
            "Full sync pushed {} evaluations, {} queued creates superseded",
            upserted, superseded
        );

        self.load(&EvaluationFilter::default()).await
    }

    pub async fn requeue_dead(&self) -> Result<u64, SyncError> {
        let n = queue::requeue_dead(&self.db).await?;
        if n > 0 {
            info!("Requeued {} dead-lettered operations", n);
        }
        Ok(n)
    }

    pub async fn queued_entries(&self, status: QueueStatus) -> Result<Vec<QueueEntry>, SyncError> {
        Ok(queue::fetch_entries(&self.db, status).await?)
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            online: self.connectivity.is_online(),
            replaying: self.replaying.load(Ordering::SeqCst),
            queued: queue::count(&self.db, QueueStatus::Queued).await?,
            dead: queue::count(&self.db, QueueStatus::Dead).await?,
            last_sync_at: queue::last_sync_at(&self.db).await?,
        })
    }

    async fn enqueue(
        &self,
        operation: QueueOperation,
        id: &str,
        payload: Option<&Evaluation>,
    ) -> Result<(), SyncError> {
        let seq = queue::enqueue(&self.db, operation, id, payload, models::now()).await?;
        info!(seq, id, "queued {} for replay", operation.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::remote::MemoryRemoteStore;
    use crate::scoring::{Ratings, Rubric};

    fn draft(teacher: &str) -> EvaluationDraft {
        EvaluationDraft {
            teacher_name: teacher.to_string(),
            coordinator_name: "Zohra".to_string(),
            class_label: "4C".to_string(),
            subject: "English".to_string(),
            visit_date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
            session_number: 1,
            visit_number: None,
            rubric: None,
            ratings: Ratings::uniform(&Rubric::standard(), 4).unwrap(),
            strengths: "Warm climate".to_string(),
            to_improve: "Differentiation".to_string(),
            recommendations: "Tiered tasks".to_string(),
        }
    }

    async fn client(online: bool) -> (SyncClient, Arc<MemoryRemoteStore>) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let client = SyncClient::with_pool(
            pool,
            remote.clone(),
            Connectivity::new(online),
            RetryPolicy::default(),
        );
        (client, remote)
    }

    #[tokio::test]
    async fn create_online_reaches_remote() {
        let (client, remote) = client(true).await;

        let created = client.create(draft("Inas")).await.unwrap();
        assert_eq!(created.outcome, WriteOutcome::Synced);
        assert!(created.evaluation.synced_at.is_some());
        assert!(remote.contains(&created.evaluation.id).await);
        assert_eq!(client.status().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn visit_numbers_follow_local_count() {
        let (client, _remote) = client(false).await;

        let first = client.create(draft("Inas")).await.unwrap();
        let second = client.create(draft("Inas")).await.unwrap();
        let other = client.create(draft("Hiba")).await.unwrap();
        assert_eq!(first.evaluation.visit_number, 1);
        assert_eq!(second.evaluation.visit_number, 2);
        assert_eq!(other.evaluation.visit_number, 1);
    }

    #[tokio::test]
    async fn invalid_draft_is_never_queued() {
        let (client, _remote) = client(false).await;
        let mut bad = draft("Inas");
        bad.strengths = " ".to_string();

        let err = client.create(bad).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(ValidationError::MissingField("strengths"))));
        assert_eq!(client.status().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn delete_of_unknown_id_is_not_found() {
        let (client, _remote) = client(true).await;
        assert!(matches!(client.delete("missing").await, Err(SyncError::NotFound(_))));

        client.connectivity().set_online(false);
        assert!(matches!(client.delete("missing").await, Err(SyncError::NotFound(_))));
        assert_eq!(client.status().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn get_falls_back_to_cache() {
        let (client, remote) = client(true).await;
        let created = client.create(draft("Inas")).await.unwrap();

        remote.set_online(false);
        let found = client.get(&created.evaluation.id).await.unwrap();
        assert_eq!(found.id, created.evaluation.id);
        assert!(matches!(client.get("nope").await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn concurrent_replay_is_skipped() {
        let (client, _remote) = client(true).await;
        client.replaying.store(true, Ordering::SeqCst);

        assert_eq!(client.replay_queue().await.unwrap(), None);
        assert!(client.status().await.unwrap().replaying);
    }
}
