use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evalboard::api::router;
use evalboard::config::ServerConfig;
use evalboard::db;
use evalboard::models::UserDirectory;
use evalboard::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "evalboard=debug,tower_http=debug".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    let pool = db::connect(&config.database_url).await?;

    let users = match &config.users_file {
        Some(path) => {
            info!("loading users from {}", path.display());
            UserDirectory::from_file(path)?
        }
        None => {
            info!("USERS_FILE not set, using the built-in user directory");
            UserDirectory::builtin()
        }
    };

    let state = AppState {
        db: pool.clone(),
        users: Arc::new(users),
    };

    let app = router(state);

    info!("listening on http://{}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
