mod auth;
mod middleware;
mod routes;
mod server;
mod state;

pub use auth::{has_operator_access, has_viewer_access, validate_auth, AuthResult};
pub use server::GatewayServer;
pub use state::AppState;
