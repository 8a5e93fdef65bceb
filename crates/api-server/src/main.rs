//! Identity service entrypoint.

use anyhow::Context;
use api_server::{ApiServer, ServerConfig};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "api_server=debug,identity=debug,tower_http=debug,axum=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting identity service");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .context("Failed to connect to the database")?;

    // SKIP_MIGRATIONS=true hands schema management to the deploy pipeline.
    let skip_migrations = std::env::var("SKIP_MIGRATIONS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if skip_migrations {
        info!("Skipping migrations (SKIP_MIGRATIONS is set)");
    } else {
        info!("Running database migrations");
        sqlx::migrate!("../../migrations").run(&pool).await?;
    }

    let server = ApiServer::new(ServerConfig::from_env(), pool);
    server.run().await
}
