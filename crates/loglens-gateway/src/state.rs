use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use loglens_agent::ForensicTeam;
use loglens_core::config::GatewayConfig;
use loglens_store::{SqliteStore, StagedLogSource};

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub team: Arc<ForensicTeam>,
    pub store: Arc<SqliteStore>,
    pub staged: Arc<StagedLogSource>,
    /// Parent of every job's cancellation token.
    pub shutdown: CancellationToken,
}
