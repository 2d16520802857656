mod common;

use evalboard::config::RetryPolicy;
use evalboard::db::queue::{self, QueueOperation, QueueStatus};
use evalboard::db::repository;
use evalboard::db::SyncState;
use evalboard::models::{self, EvaluationFilter};
use evalboard::remote::{RemoteError, RemoteStore};
use evalboard::scoring::Ratings;
use evalboard::services::{Source, SyncError, WriteOutcome};

#[tokio::test]
async fn test_offline_create_is_replayed_when_back_online() {
    let (client, remote) = common::memory_client(false, RetryPolicy::default()).await;

    let created = client.create(common::draft("Morched", 5)).await.unwrap();
    assert_eq!(created.outcome, WriteOutcome::Queued);
    assert_eq!(created.evaluation.grand_total, 100);
    assert_eq!(client.status().await.unwrap().queued, 1);
    assert_eq!(remote.calls(), 0);

    // still offline: nothing happens
    assert!(client.replay_queue().await.unwrap().is_none());

    client.connectivity().set_online(true);
    let stats = client.replay_queue().await.unwrap().expect("replay ran");
    assert_eq!(stats.succeeded, 1);
    assert!(stats.reconciled);

    let status = client.status().await.unwrap();
    assert_eq!(status.queued, 0);
    assert!(status.last_sync_at.is_some());
    assert!(remote.contains(&created.evaluation.id).await);
    assert_eq!(
        repository::find_sync_state(client.pool(), &created.evaluation.id).await.unwrap(),
        Some(SyncState::Synced)
    );
}

#[tokio::test]
async fn test_failed_remote_create_is_queued() {
    let (client, remote) = common::memory_client(true, RetryPolicy::default()).await;
    remote
        .fail_next(RemoteError::Unavailable("timeout".to_string()))
        .await;

    let created = client.create(common::draft("Kamel", 4)).await.unwrap();
    assert_eq!(created.outcome, WriteOutcome::Queued);
    assert!(!remote.contains(&created.evaluation.id).await);
    assert_eq!(client.status().await.unwrap().queued, 1);

    // the local copy is there regardless
    let local = client.get(&created.evaluation.id).await.unwrap();
    assert_eq!(local.id, created.evaluation.id);
}

#[tokio::test]
async fn test_delete_of_unsent_record_never_reaches_remote() {
    let (client, remote) = common::memory_client(false, RetryPolicy::default()).await;
    let created = client.create(common::draft("Abas", 3)).await.unwrap();

    client.connectivity().set_online(true);
    let outcome = client.delete(&created.evaluation.id).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Discarded);

    let status = client.status().await.unwrap();
    assert_eq!(status.queued, 0);
    assert_eq!(remote.calls(), 0);
    assert!(remote.is_empty().await);
}

#[tokio::test]
async fn test_offline_delete_is_replayed() {
    let (client, remote) = common::memory_client(true, RetryPolicy::default()).await;
    let created = client.create(common::draft("Zine", 4)).await.unwrap();
    assert_eq!(created.outcome, WriteOutcome::Synced);

    client.connectivity().set_online(false);
    let outcome = client.delete(&created.evaluation.id).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Queued);
    assert!(remote.contains(&created.evaluation.id).await);

    client.connectivity().set_online(true);
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.succeeded, 1);
    assert!(!remote.contains(&created.evaluation.id).await);
}

#[tokio::test]
async fn test_replay_treats_already_applied_operations_as_done() {
    let (client, remote) = common::memory_client(false, RetryPolicy::default()).await;
    let created = client.create(common::draft("Sylvano", 4)).await.unwrap();
    // the create already landed, e.g. the reply was lost
    remote.insert(created.evaluation.clone()).await;

    let mut gone = created.evaluation.clone();
    gone.id = models::new_evaluation_id();
    repository::upsert_evaluation(client.pool(), &gone, SyncState::Synced).await.unwrap();
    client.delete(&gone.id).await.unwrap();

    client.connectivity().set_online(true);
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.retrying + stats.dead_lettered, 0);
    assert_eq!(client.status().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_backoff_defers_failed_entries() {
    let policy = RetryPolicy {
        max_attempts: 5,
        base: std::time::Duration::from_secs(60),
        max_backoff: std::time::Duration::from_secs(600),
    };
    let (client, remote) = common::memory_client(false, policy).await;
    client.create(common::draft("Oumarou", 4)).await.unwrap();
    client.connectivity().set_online(true);

    remote
        .fail_next(RemoteError::Unavailable("502".to_string()))
        .await;
    let first = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(first.retrying, 1);
    let calls = remote.calls();

    let second = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(second.deferred, 1);
    assert_eq!(second.succeeded, 0);
    assert_eq!(remote.calls(), calls);

    let entry = client
        .queued_entries(QueueStatus::Queued)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(entry.attempts, 1);
    assert!(entry.next_attempt_at.is_some());
    assert_eq!(entry.last_error.as_deref(), Some("remote store unavailable: 502"));
}

#[tokio::test]
async fn test_exhausted_entries_are_dead_lettered_and_can_be_requeued() {
    let policy = RetryPolicy {
        max_attempts: 2,
        ..common::fast_retry()
    };
    let (client, remote) = common::memory_client(false, policy).await;
    let created = client.create(common::draft("Youssef", 3)).await.unwrap();
    client.connectivity().set_online(true);

    for _ in 0..2 {
        remote
            .fail_next(RemoteError::Unavailable("down".to_string()))
            .await;
    }
    let first = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(first.retrying, 1);
    let second = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(second.dead_lettered, 1);

    let status = client.status().await.unwrap();
    assert_eq!((status.queued, status.dead), (0, 1));
    // dead letters are not replayed
    let idle = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(idle, Default::default());

    assert_eq!(client.requeue_dead().await.unwrap(), 1);
    let third = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(third.succeeded, 1);
    assert!(remote.contains(&created.evaluation.id).await);
}

#[tokio::test]
async fn test_permanent_rejection_is_dead_lettered_at_once() {
    let (client, remote) = common::memory_client(false, RetryPolicy::default()).await;
    client.create(common::draft("Tonga", 2)).await.unwrap();
    client.connectivity().set_online(true);

    remote
        .fail_next(RemoteError::Rejected {
            status: 400,
            message: "bad record".to_string(),
        })
        .await;
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(client.status().await.unwrap().dead, 1);
}

#[tokio::test]
async fn test_failure_holds_back_later_entries_for_same_record() {
    let (client, remote) = common::memory_client(false, common::fast_retry()).await;
    let a = client.create(common::draft("Sami", 4)).await.unwrap().evaluation;
    let b = client.create(common::draft("Zine", 4)).await.unwrap().evaluation;
    // a create followed by a delete for the same record
    repository::delete_evaluation(client.pool(), &a.id).await.unwrap();
    queue::enqueue(client.pool(), QueueOperation::Delete, &a.id, None, models::now())
        .await
        .unwrap();
    client.connectivity().set_online(true);

    remote
        .fail_next(RemoteError::Unavailable("flaky".to_string()))
        .await;
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.retrying, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.deferred, 1);
    assert!(remote.contains(&b.id).await);

    // next pass runs the create, then the delete, in order
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.succeeded, 2);
    assert!(!remote.contains(&a.id).await);
}

#[tokio::test]
async fn test_load_merges_pending_and_prunes_stale() {
    let (client, remote) = common::memory_client(false, RetryPolicy::default()).await;
    let pending = client.create(common::draft("Kamel", 3)).await.unwrap().evaluation;

    let mut on_remote = pending.clone();
    on_remote.id = models::new_evaluation_id();
    remote.insert(on_remote.clone()).await;

    let mut stale = pending.clone();
    stale.id = models::new_evaluation_id();
    repository::upsert_evaluation(client.pool(), &stale, SyncState::Synced).await.unwrap();

    let offline = client.load(&EvaluationFilter::teacher("Kamel")).await.unwrap();
    assert_eq!(offline.source, Source::Cache);
    assert!(offline.stale);
    assert_eq!(offline.evaluations.len(), 2);

    client.connectivity().set_online(true);
    let online = client.load(&EvaluationFilter::teacher("Kamel")).await.unwrap();
    assert_eq!(online.source, Source::Remote);
    assert!(!online.stale);
    let mut ids: Vec<_> = online.evaluations.iter().map(|e| e.id.clone()).collect();
    ids.sort();
    let mut expected = vec![pending.id.clone(), on_remote.id.clone()];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(repository::find_evaluation(client.pool(), &stale.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_load_does_not_prune_when_remote_page_is_full() {
    let (client, remote) = common::memory_client(true, RetryPolicy::default()).await;
    let template = client.create(common::draft("Nour", 4)).await.unwrap().evaluation;
    remote.delete(&template.id).await.unwrap();

    for _ in 0..repository::LIST_LIMIT {
        let mut e = template.clone();
        e.id = models::new_evaluation_id();
        e.created_at = models::now();
        remote.insert(e).await;
    }

    let loaded = client.load(&EvaluationFilter::teacher("Nour")).await.unwrap();
    assert_eq!(loaded.evaluations.len(), repository::LIST_LIMIT as usize);
    // absent from the capped page but kept locally
    assert!(repository::find_evaluation(client.pool(), &template.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_load_falls_back_when_remote_fails() {
    let (client, remote) = common::memory_client(true, RetryPolicy::default()).await;
    client.create(common::draft("Imane", 5)).await.unwrap();
    remote
        .fail_next(RemoteError::Unavailable("timeout".to_string()))
        .await;

    let loaded = client.load(&EvaluationFilter::default()).await.unwrap();
    assert_eq!(loaded.source, Source::Cache);
    assert!(loaded.stale);
    assert_eq!(loaded.evaluations.len(), 1);
}

#[tokio::test]
async fn test_load_hides_record_whose_remote_delete_is_queued() {
    let (client, remote) = common::memory_client(true, common::fast_retry()).await;
    let id = client.create(common::draft("Kamel", 4)).await.unwrap().evaluation.id;

    remote
        .fail_next(RemoteError::Unavailable("timeout".to_string()))
        .await;
    assert_eq!(client.delete(&id).await.unwrap(), WriteOutcome::Queued);
    assert!(remote.contains(&id).await);

    // the remote copy is still there, but the local delete wins
    let loaded = client.load(&EvaluationFilter::default()).await.unwrap();
    assert_eq!(loaded.source, Source::Remote);
    assert!(loaded.evaluations.iter().all(|e| e.id != id));
    assert!(repository::find_evaluation(client.pool(), &id).await.unwrap().is_none());
    assert!(matches!(client.get(&id).await, Err(SyncError::NotFound(_))));

    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.succeeded, 1);
    assert!(stats.reconciled);
    assert!(!remote.contains(&id).await);

    let loaded = client.load(&EvaluationFilter::default()).await.unwrap();
    assert!(loaded.evaluations.iter().all(|e| e.id != id));
}

#[tokio::test]
async fn test_delete_after_partial_replay_reaches_remote() {
    let (client, remote) = common::memory_client(false, common::fast_retry()).await;
    let a = client.create(common::draft("Sami", 4)).await.unwrap().evaluation;
    let b = client.create(common::draft("Zine", 4)).await.unwrap().evaluation;
    client.connectivity().set_online(true);

    remote
        .fail_next(RemoteError::Unavailable("flaky".to_string()))
        .await;
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!((stats.succeeded, stats.retrying), (1, 1));
    assert!(stats.reconciled);
    // the full sync carried a along with b
    assert!(remote.contains(&a.id).await);
    assert!(remote.contains(&b.id).await);
    assert_eq!(client.status().await.unwrap().queued, 0);

    assert_eq!(client.delete(&a.id).await.unwrap(), WriteOutcome::Synced);
    assert!(!remote.contains(&a.id).await);

    let loaded = client.load(&EvaluationFilter::default()).await.unwrap();
    let ids: Vec<_> = loaded.evaluations.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, [b.id.as_str()]);
}

#[tokio::test]
async fn test_delete_after_failed_send_still_contacts_remote() {
    let (client, remote) = common::memory_client(false, common::fast_retry()).await;
    let created = client.create(common::draft("Imane", 3)).await.unwrap().evaluation;
    client.connectivity().set_online(true);

    remote
        .fail_next(RemoteError::Unavailable("reply lost".to_string()))
        .await;
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.retrying, 1);
    // the failed request landed after all
    remote.insert(created.clone()).await;

    assert_eq!(client.delete(&created.id).await.unwrap(), WriteOutcome::Synced);
    assert!(!remote.contains(&created.id).await);
    assert_eq!(client.status().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_full_sync_skips_rows_the_server_would_reject() {
    let (client, remote) = common::memory_client(false, RetryPolicy::default()).await;
    let good = client.create(common::draft("Nour", 4)).await.unwrap().evaluation;

    let mut broken = good.clone();
    broken.id = models::new_evaluation_id();
    broken.ratings = Ratings::from_pairs([("planning.objectives", 5)]).unwrap();
    repository::upsert_evaluation(client.pool(), &broken, SyncState::Pending).await.unwrap();

    client.connectivity().set_online(true);
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.succeeded, 1);
    assert!(stats.reconciled);

    assert!(remote.contains(&good.id).await);
    assert!(!remote.contains(&broken.id).await);
    assert_eq!(
        repository::find_sync_state(client.pool(), &broken.id).await.unwrap(),
        Some(SyncState::Pending)
    );
    assert!(client.status().await.unwrap().last_sync_at.is_some());
}

#[tokio::test]
async fn test_full_sync_leaves_dead_lettered_creates_behind() {
    let (client, remote) = common::memory_client(false, RetryPolicy::default()).await;
    let rejected = client.create(common::draft("Tonga", 2)).await.unwrap().evaluation;
    client.connectivity().set_online(true);
    remote
        .fail_next(RemoteError::Rejected {
            status: 400,
            message: "bad record".to_string(),
        })
        .await;
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.dead_lettered, 1);

    client.connectivity().set_online(false);
    let accepted = client.create(common::draft("Tonga", 4)).await.unwrap().evaluation;
    client.connectivity().set_online(true);
    let stats = client.replay_queue().await.unwrap().unwrap();
    assert_eq!(stats.succeeded, 1);
    assert!(stats.reconciled);

    assert!(remote.contains(&accepted.id).await);
    assert!(!remote.contains(&rejected.id).await);
    assert_eq!(
        repository::find_sync_state(client.pool(), &rejected.id).await.unwrap(),
        Some(SyncState::Pending)
    );
    assert_eq!(client.status().await.unwrap().dead, 1);
}
