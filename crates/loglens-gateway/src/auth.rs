use loglens_core::config::{ApiKeyRole, GatewayConfig};

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResult {
    pub name: String,
    pub role: ApiKeyRole,
    /// Set when the caller signed in as a user.
    pub user_id: Option<i64>,
}

impl AuthResult {
    fn admin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: ApiKeyRole::Admin,
            user_id: None,
        }
    }
}

/// Full validation: Bearer header -> api_keys -> legacy token -> issued user tokens -> anonymous.
///
/// `resolve_user` maps a bearer value to the user it was issued to, if any.
/// Returns `Some(AuthResult)` on success, `None` on auth failure.
pub fn validate_auth(
    config: &GatewayConfig,
    bearer: Option<&str>,
    resolve_user: impl FnOnce(&str) -> Option<i64>,
) -> Option<AuthResult> {
    if let Some(bearer_val) = bearer {
        for ak in &config.api_keys {
            if ak.key == bearer_val {
                return Some(AuthResult {
                    name: ak.name.clone(),
                    role: ak.role.clone(),
                    user_id: None,
                });
            }
        }
        if config.token.as_deref() == Some(bearer_val) {
            return Some(AuthResult::admin("legacy-token"));
        }
        return resolve_user(bearer_val).map(|user_id| AuthResult {
            name: format!("user:{}", user_id),
            role: ApiKeyRole::Operator,
            user_id: Some(user_id),
        });
    }

    // No credentials: only an unconfigured gateway is open.
    if config.api_keys.is_empty() && config.token.is_none() {
        Some(AuthResult::admin("anonymous"))
    } else {
        None
    }
}

/// Extract the bearer value from an Authorization header.
pub fn bearer_from_header(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Check if a role has at least viewer-level access.
pub fn has_viewer_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Viewer | ApiKeyRole::Operator | ApiKeyRole::Admin)
}

/// Check if a role has at least operator-level access.
pub fn has_operator_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Operator | ApiKeyRole::Admin)
}
