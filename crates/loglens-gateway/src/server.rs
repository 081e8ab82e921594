use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use loglens_agent::ForensicTeam;
use loglens_core::config::GatewayConfig;
use loglens_store::{SqliteStore, StagedLogSource};

use crate::routes;
use crate::state::AppState;

/// Log bundles are posted whole.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    team: Arc<ForensicTeam>,
    store: Arc<SqliteStore>,
    staged: Arc<StagedLogSource>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        team: Arc<ForensicTeam>,
        store: Arc<SqliteStore>,
        staged: Arc<StagedLogSource>,
    ) -> Self {
        Self {
            config,
            team,
            store,
            staged,
        }
    }

    /// The full route table. Jobs started by requests are cancelled with `shutdown`.
    pub fn router(&self, shutdown: CancellationToken) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            team: self.team.clone(),
            store: self.store.clone(),
            staged: self.staged.clone(),
            shutdown,
        });

        Router::new()
            .route("/api/health", get(routes::health))
            // Accounts
            .route("/api/users/signup", post(routes::signup))
            .route("/api/users/signin", post(routes::signin))
            // Computers
            .route(
                "/api/computers",
                get(routes::list_computers).post(routes::create_computer),
            )
            .route(
                "/api/computers/{id}",
                get(routes::get_computer)
                    .put(routes::update_computer)
                    .delete(routes::delete_computer),
            )
            .route("/api/computers/{id}/tasks", get(routes::computer_tasks))
            // Tasks
            .route("/api/tasks", post(routes::create_task))
            .route(
                "/api/tasks/{id}",
                get(routes::get_task)
                    .put(routes::update_task)
                    .delete(routes::delete_task),
            )
            .route("/api/search", get(routes::search))
            // Staged logs
            .route("/api/logs", post(routes::stage_logs))
            .route("/api/logs/query", post(routes::query_logs))
            .route("/api/graph", get(routes::graph))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router(shutdown.clone());

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
