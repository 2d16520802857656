#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::{Value, json};

use evalboard::config::RetryPolicy;
use evalboard::db;
use evalboard::models::EvaluationDraft;
use evalboard::remote::MemoryRemoteStore;
use evalboard::scoring::{Ratings, Rubric};
use evalboard::services::{Connectivity, SyncClient};

pub fn draft(teacher: &str, rating: u8) -> EvaluationDraft {
    EvaluationDraft {
        teacher_name: teacher.to_string(),
        coordinator_name: "Mohamed".to_string(),
        class_label: "6A".to_string(),
        subject: "Mathematics".to_string(),
        visit_date: NaiveDate::from_ymd_opt(2026, 10, 12).unwrap(),
        session_number: 3,
        visit_number: None,
        rubric: None,
        ratings: Ratings::uniform(&Rubric::standard(), rating).unwrap(),
        strengths: "Clear explanations".to_string(),
        to_improve: "Pace of the second activity".to_string(),
        recommendations: "Use exit tickets".to_string(),
    }
}

/// Request body for `POST /evaluations` without an id.
pub fn evaluation_body(teacher: &str, rating: u8) -> Value {
    json!({
        "teacherName": teacher,
        "coordinatorName": "Mohamed",
        "class": "6A",
        "subject": "Mathematics",
        "visitDate": "2026-10-12",
        "sessionNumber": 3,
        "ratings": Ratings::uniform(&Rubric::standard(), rating).unwrap(),
        "strengths": "Clear explanations",
        "toImprove": "Pace of the second activity",
        "recommendations": "Use exit tickets",
    })
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base: Duration::ZERO,
        max_backoff: Duration::ZERO,
    }
}

pub async fn memory_client(online: bool, retry: RetryPolicy) -> (Arc<SyncClient>, Arc<MemoryRemoteStore>) {
    let remote = Arc::new(MemoryRemoteStore::new());
    let pool = db::connect("sqlite::memory:")
        .await
        .expect("Failed to create test db");
    let client = SyncClient::with_pool(pool, remote.clone(), Connectivity::new(online), retry);
    (Arc::new(client), remote)
}

pub async fn wait_for_empty_queue(client: &SyncClient) {
    for _ in 0..100 {
        if client.status().await.unwrap().queued == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("sync queue never drained");
}
