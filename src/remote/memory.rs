use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RemoteError, RemoteStore};
use crate::db::repository::LIST_LIMIT;
use crate::models::{self, Evaluation, EvaluationFilter};

/// In-process remote store for demos and tests.
///
/// Behaves like the HTTP API (conflict on duplicate create, not-found on
/// unknown delete) and can be switched offline or told to fail the next
/// calls with a chosen error.
#[derive(Default)]
pub struct MemoryRemoteStore {
    records: Mutex<HashMap<String, Evaluation>>,
    offline: AtomicBool,
    scripted: Mutex<VecDeque<RemoteError>>,
    calls: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Number of calls that got past the online check.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The next call fails with `error` instead of running.
    pub async fn fail_next(&self, error: RemoteError) {
        self.scripted.lock().await.push_back(error);
    }

    pub async fn insert(&self, evaluation: Evaluation) {
        self.records
            .lock()
            .await
            .insert(evaluation.id.clone(), evaluation);
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.records.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("connection refused".to_string()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.scripted.lock().await.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn health(&self) -> Result<(), RemoteError> {
        self.enter().await
    }

    async fn list(&self, filter: &EvaluationFilter) -> Result<Vec<Evaluation>, RemoteError> {
        self.enter().await?;
        let records = self.records.lock().await;
        let mut found: Vec<Evaluation> = records
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        found.truncate(LIST_LIMIT as usize);
        Ok(found)
    }

    async fn get(&self, id: &str) -> Result<Evaluation, RemoteError> {
        self.enter().await?;
        self.records
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("Evaluation {id} not found")))
    }

    async fn create(&self, evaluation: &Evaluation) -> Result<Evaluation, RemoteError> {
        self.enter().await?;
        let mut stored = evaluation.clone();
        stored
            .seal()
            .map_err(|e| RemoteError::Rejected {
                status: 400,
                message: e.to_string(),
            })?;

        let mut records = self.records.lock().await;
        if records.contains_key(&stored.id) {
            return Err(RemoteError::Conflict(format!(
                "Evaluation {} already exists",
                stored.id
            )));
        }
        records.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.enter().await?;
        match self.records.lock().await.remove(id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(format!("Evaluation {id} not found"))),
        }
    }

    async fn bulk_upsert(&self, evaluations: &[Evaluation]) -> Result<usize, RemoteError> {
        self.enter().await?;
        let synced_at = models::now();
        let mut batch = Vec::with_capacity(evaluations.len());
        for evaluation in evaluations {
            let mut record = evaluation.clone();
            record.seal().map_err(|e| RemoteError::Rejected {
                status: 400,
                message: format!("{}: {}", record.id, e),
            })?;
            record.synced_at = Some(synced_at);
            batch.push(record);
        }

        let mut records = self.records.lock().await;
        for record in batch {
            records.insert(record.id.clone(), record);
        }
        Ok(evaluations.len())
    }
}
