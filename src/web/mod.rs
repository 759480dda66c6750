//! Web server module.

mod auth;
mod handlers;
mod ratelimit;

pub use handlers::*;
pub use ratelimit::RateLimiter;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::logging::LogBuffer;
use crate::monitor::Monitor;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub monitor: Arc<Monitor>,
    pub logs: Arc<LogBuffer>,
    pub jwt_secret: Arc<Vec<u8>>,
    pub login_limiter: Arc<RateLimiter>,
}

/// API server for RouteSight.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        monitor: Arc<Monitor>,
        logs: Arc<LogBuffer>,
    ) -> Self {
        let jwt_secret = Arc::new(auth::load_or_generate_secret(config.jwt_secret.as_deref()));
        let login_limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(60)));

        Self {
            state: AppState {
                config,
                store,
                monitor,
                logs,
                jwt_secret,
                login_limiter,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let protected = Router::new()
            .route("/status", get(handlers::handle_status))
            .route("/history", get(handlers::handle_history))
            .route("/trace", get(handlers::handle_trace))
            .route("/probe", post(handlers::handle_probe))
            .route(
                "/targets",
                get(handlers::handle_get_targets).post(handlers::handle_save_target),
            )
            .route("/targets/{id}", delete(handlers::handle_delete_target))
            .route("/user/password", post(handlers::handle_update_password))
            .route("/logs", get(handlers::handle_get_logs))
            .route(
                "/system/database/stats",
                get(handlers::handle_database_stats),
            )
            .route(
                "/system/database/clean",
                post(handlers::handle_clean_database),
            )
            .route(
                "/system/database/vacuum",
                post(handlers::handle_vacuum_database),
            )
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::require_auth,
            ));

        let api_v1 = Router::new()
            .route("/need-setup", get(handlers::handle_need_setup))
            .route("/setup", post(handlers::handle_setup))
            .merge(protected);

        Router::new()
            .route("/login", post(handlers::handle_login))
            .nest("/api/v1", api_v1)
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::setup_gate,
            ))
            .layer(middleware::from_fn(auth::security_headers))
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024))
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}
