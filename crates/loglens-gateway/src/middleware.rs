use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use tracing::warn;

use crate::auth::{self, AuthResult};
use crate::state::AppState;

/// Extractor that validates authentication via the Bearer header.
pub struct Authenticated(pub AuthResult);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = StatusCode;

    fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let bearer = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(auth::bearer_from_header)
            .map(|s| s.to_string());

        let result = auth::validate_auth(&state.config, bearer.as_deref(), |token| {
            match state.store.resolve_token(token) {
                Ok(user) => user,
                Err(e) => {
                    warn!(error = %e, "Token lookup failed");
                    None
                }
            }
        });

        async move {
            match result {
                Some(auth) => Ok(Authenticated(auth)),
                None => Err(StatusCode::UNAUTHORIZED),
            }
        }
    }
}
