//! API Server
//!
//! REST API for the identity backend.
//!
//! # Features
//!
//! - **REST API**: account, role, group and audit-trail administration
//! - **Authentication**: JWT access/refresh tokens with authority checks
//! - **Lifecycle**: soft delete, restore and purge with a last-admin guard
//! - **OpenAPI**: auto-generated Swagger documentation
//!
//! # Example
//!
//! ```ignore
//! use api_server::{ApiServer, ServerConfig};
//!
//! let config = ServerConfig::from_env();
//! let server = ApiServer::new(config, pool);
//! server.run().await?;
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod seed;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use seed::seed_identity;
pub use state::AppState;

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::Request;
use identity::JwtConfig;
use sqlx::PgPool;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

/// Request bodies above this size are rejected outright.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Network and CORS settings for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind, `0.0.0.0` by default.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Allow any origin. Useful in development; keep off behind a gateway
    /// that terminates browser traffic.
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_permissive: true,
        }
    }
}

impl ServerConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        // PORT wins (PaaS convention), then API_PORT, then the default.
        let port = std::env::var("PORT")
            .or_else(|_| std::env::var("API_PORT"))
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        Self {
            host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            cors_permissive: std::env::var("CORS_PERMISSIVE")
                .map(|v| v == "true")
                .unwrap_or(true),
        }
    }

    /// Bind address built from host and port.
    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid socket address")
    }
}

/// The API server.
pub struct ApiServer {
    config: ServerConfig,
    pool: PgPool,
}

impl ApiServer {
    /// Create a new API server.
    pub fn new(config: ServerConfig, pool: PgPool) -> Self {
        Self { config, pool }
    }

    /// Seed built-in data and run the server until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let state = AppState::new(self.pool, JwtConfig::from_env()).into_arc();

        seed::seed_identity(&state.users, &state.roles).await?;

        let trace = TraceLayer::new_for_http()
            .on_request(|req: &Request<_>, _: &tracing::Span| {
                tracing::info!(method = %req.method(), uri = %req.uri(), "Request received");
            })
            .on_response(DefaultOnResponse::new().level(Level::DEBUG))
            .on_failure(
                |class: ServerErrorsFailureClass, latency: Duration, _: &tracing::Span| {
                    tracing::error!(
                        error = %class,
                        latency_ms = latency.as_millis(),
                        "Request failed"
                    );
                },
            );
        // Without the opt-in, cross-origin requests stay blocked.
        let cors = if self.config.cors_permissive {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        };

        let router = create_router(state)
            .layer(trace)
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(cors);

        let addr = self.config.socket_addr();
        info!(address = %addr, "Identity service listening");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        // Connect info feeds the per-request client address used for rate
        // limiting and audit attribution.
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert!(config.cors_permissive);
        assert_eq!(config.socket_addr().port(), 3000);
    }
}
