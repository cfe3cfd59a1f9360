//! API authentication via bearer tokens.
//!
//! Each token maps to one caller identity. The local user's token is
//! generated on first run and persisted; further users come from config.

use std::collections::HashMap;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::Rng;

use dealchat_core::config::AuthConfig;
use dealchat_core::types::Identity;

use crate::error::ApiError;
use crate::state::AppState;

/// Generate a random 32-character hex token.
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    hex::encode(bytes)
}

/// Load token from file, or generate and save a new one.
pub fn load_or_generate_token(token_path: &std::path::Path) -> String {
    if let Ok(contents) = std::fs::read_to_string(token_path) {
        let token = contents.trim().to_string();
        if !token.is_empty() {
            tracing::info!("API token loaded from {}", token_path.display());
            return token;
        }
    }

    let token = generate_token();

    if let Some(parent) = token_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(token_path, &token) {
        tracing::warn!(error = %e, "Failed to save API token to {}", token_path.display());
    } else {
        // Owner-only access.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(token_path, std::fs::Permissions::from_mode(0o600));
        }
        tracing::info!("API token saved to {}", token_path.display());
    }

    token
}

/// Build the token table: the local token for the default user plus any
/// configured tokens. Blank entries are skipped.
pub fn token_map(local_token: &str, auth: &AuthConfig) -> HashMap<String, Identity> {
    let mut tokens = HashMap::new();
    if !local_token.trim().is_empty() {
        tokens.insert(
            local_token.trim().to_string(),
            Identity::new(auth.default_user.clone()),
        );
    }
    for entry in &auth.tokens {
        let token = entry.token.trim();
        if token.is_empty() || entry.user_id.trim().is_empty() {
            continue;
        }
        if tokens
            .insert(token.to_string(), Identity::new(entry.user_id.trim()))
            .is_some()
        {
            tracing::warn!(user = %entry.user_id, "Duplicate API token in config; last entry wins");
        }
    }
    tokens
}

/// Middleware that validates `Authorization: Bearer <token>` and attaches
/// the caller's [`Identity`] to the request. Returns 401 otherwise.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let identity = match req.headers().get("authorization") {
        None => {
            return ApiError::Unauthorized("Missing Authorization header".to_string())
                .into_response()
        }
        Some(value) => {
            let Ok(value) = value.to_str() else {
                return ApiError::Unauthorized("Invalid Authorization header encoding".to_string())
                    .into_response();
            };
            value
                .strip_prefix("Bearer ")
                .and_then(|token| state.identity_for(token.trim()))
                .cloned()
        }
    };

    match identity {
        Some(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        None => ApiError::Unauthorized("Invalid bearer token".to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealchat_core::config::TokenEntry;

    #[test]
    fn test_generate_token_shape() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("api_token");
        let first = load_or_generate_token(&path);
        let second = load_or_generate_token(&path);
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_token_map_includes_configured_users() {
        let auth = AuthConfig {
            tokens: vec![
                TokenEntry {
                    token: "bob-token".to_string(),
                    user_id: "bob".to_string(),
                },
                TokenEntry {
                    token: "  ".to_string(),
                    user_id: "ghost".to_string(),
                },
            ],
            ..AuthConfig::default()
        };
        let map = token_map("local-token", &auth);
        assert_eq!(map.len(), 2);
        assert_eq!(map["local-token"], Identity::new("local"));
        assert_eq!(map["bob-token"], Identity::new("bob"));
    }
}
