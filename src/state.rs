use std::sync::Arc;

use sqlx::SqlitePool;

use crate::models::UserDirectory;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub users: Arc<UserDirectory>,
}
