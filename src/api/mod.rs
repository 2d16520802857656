use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query};
use axum::routing::post;
use axum::{Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::db::SyncState;
use crate::db::repository::{self, LIST_LIMIT};
use crate::error::AppError;
use crate::models::{self, Evaluation, EvaluationFilter, EvaluationUpdate, User};
use crate::remote::dto::{Envelope, LoginRequest, SyncDataRequest, SyncDataResult};
use crate::state::AppState;

type ApiResult<T> = Result<Json<Envelope<T>>, AppError>;

const ENDPOINTS: &[&str] = &[
    "GET /health",
    "GET /evaluations",
    "POST /evaluations",
    "GET /evaluations/{id}",
    "PUT /evaluations/{id}",
    "DELETE /evaluations/{id}",
    "POST /sync-data",
    "GET /users",
    "POST /login",
];

/// Every route is served at the root and again under `/api`.
pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/", get(info))
        .route("/health", get(health))
        .route("/evaluations", get(list_evaluations).post(create_evaluation))
        .route(
            "/evaluations/{id}",
            get(get_evaluation)
                .put(update_evaluation)
                .delete(delete_evaluation),
        )
        .route("/sync-data", post(sync_data))
        .route("/users", get(list_users))
        .route("/login", post(login));

    Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

#[derive(Serialize)]
struct ApiInfo {
    name: &'static str,
    version: &'static str,
    endpoints: &'static [&'static str],
}

async fn info() -> Json<Envelope<ApiInfo>> {
    Json(Envelope::ok(ApiInfo {
        name: "evalboard",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: ENDPOINTS,
    }))
}

async fn health(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    match sqlx::query("select 1").execute(&state.db).await {
        Ok(_) => Ok(Json(
            Envelope::ok(json!({ "status": "ok", "timestamp": models::now() }))
                .with_message("API operational"),
        )),
        Err(err) => {
            error!("health check failed: {}", err);
            Err(AppError::Unavailable("database unreachable".to_string()))
        }
    }
}

async fn list_evaluations(
    State(state): State<AppState>,
    Query(filter): Query<EvaluationFilter>,
) -> ApiResult<Vec<Evaluation>> {
    let evaluations = repository::fetch_evaluations(&state.db, &filter, Some(LIST_LIMIT)).await?;
    let count = evaluations.len();
    Ok(Json(Envelope::ok(evaluations).with_count(count)))
}

async fn create_evaluation(
    State(state): State<AppState>,
    payload: Result<Json<Evaluation>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<Evaluation>>), AppError> {
    let mut evaluation = body(payload)?;
    if evaluation.id.trim().is_empty() {
        evaluation.id = models::new_evaluation_id();
    }
    if evaluation.visit_number == 0 {
        let teacher = evaluation.teacher_name.trim();
        evaluation.visit_number = repository::count_for_teacher(&state.db, teacher).await? + 1;
    }
    evaluation.synced_at = None;
    evaluation.seal()?;

    let inserted = repository::insert_evaluation(&state.db, &evaluation, SyncState::Synced).await?;
    if !inserted {
        return Err(AppError::Conflict(format!(
            "Evaluation {} already exists",
            evaluation.id
        )));
    }

    info!(id = %evaluation.id, teacher = %evaluation.teacher_name, "evaluation created");
    Ok((
        StatusCode::CREATED,
        Json(Envelope::ok(evaluation).with_message("Evaluation saved")),
    ))
}

async fn get_evaluation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Evaluation> {
    let evaluation = repository::find_evaluation(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Evaluation {id} not found")))?;
    Ok(Json(Envelope::ok(evaluation)))
}

async fn update_evaluation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<EvaluationUpdate>, JsonRejection>,
) -> ApiResult<Evaluation> {
    let update = body(payload)?;
    let mut evaluation = repository::find_evaluation(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Evaluation {id} not found")))?;

    update.apply(&mut evaluation, models::now())?;
    repository::upsert_evaluation(&state.db, &evaluation, SyncState::Synced).await?;

    info!(id = %evaluation.id, "evaluation updated");
    Ok(Json(Envelope::ok(evaluation).with_message("Evaluation updated")))
}

async fn delete_evaluation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    if !repository::delete_evaluation(&state.db, &id).await? {
        return Err(AppError::NotFound(format!("Evaluation {id} not found")));
    }
    info!(id = %id, "evaluation deleted");
    Ok(Json(
        Envelope::ok(json!({ "id": id })).with_message("Evaluation deleted"),
    ))
}

async fn sync_data(
    State(state): State<AppState>,
    payload: Result<Json<SyncDataRequest>, JsonRejection>,
) -> ApiResult<SyncDataResult> {
    let SyncDataRequest { mut evaluations } = body(payload)?;

    for evaluation in &mut evaluations {
        evaluation.seal().map_err(|e| {
            AppError::BadRequest(format!("evaluation {:?} is invalid: {}", evaluation.id, e))
        })?;
    }

    let upserted = repository::upsert_batch(&state.db, &evaluations, models::now()).await?;
    info!("sync-data upserted {} evaluations", upserted);
    Ok(Json(
        Envelope::ok(SyncDataResult { upserted })
            .with_message(format!("{upserted} evaluations synchronized")),
    ))
}

async fn list_users(State(state): State<AppState>) -> ApiResult<Vec<User>> {
    let users = state.users.users().to_vec();
    let count = users.len();
    Ok(Json(Envelope::ok(users).with_count(count)))
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<User> {
    let request = body(payload)?;
    let user = state
        .users
        .authenticate(&request.username, &request.password)
        .ok_or(AppError::Unauthorized)?;
    info!(username = %user.username, "login");
    Ok(Json(Envelope::ok(user.clone())))
}
