//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, auth, rate limiting,
//! and all endpoint handlers. Compression is left off so streamed replies
//! reach the client as they are produced.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use dealchat_core::config::DealchatConfig;
use dealchat_core::error::DealchatError;

use crate::handlers;
use crate::state::AppState;

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // CORS: the configured port plus port+1 for a dev server.
    let port = state.config.general.port;
    let dev_port = port.saturating_add(1);
    let origins: Vec<HeaderValue> = [port, dev_port]
        .iter()
        .flat_map(|p| {
            [
                format!("http://127.0.0.1:{}", p),
                format!("http://localhost:{}", p),
            ]
        })
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .expose_headers([HeaderName::from_static(handlers::CONVERSATION_ID_HEADER)]);

    // Routes that do NOT require authentication.
    let public_routes = Router::new().route("/health", get(handlers::health));

    // Conversation management, budgeted by the management limiter.
    let management_routes = Router::new()
        .route("/api/chat/conversations", get(handlers::list_conversations))
        .route("/api/chat/conversation", get(handlers::get_conversation))
        .route("/api/chat/create", post(handlers::create_conversation))
        .route("/api/chat/delete", delete(handlers::delete_conversation))
        .route("/api/chat/update-title", post(handlers::update_title))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::rate_limit::rate_limit_middleware,
        ));

    // Turns carry their own budget inside the orchestrator.
    let turn_routes = Router::new()
        .route("/api/chat/ask", post(handlers::ask))
        .route("/api/chat/confirm", post(handlers::confirm));

    // Combine all protected routes behind auth.
    let protected_routes = management_routes
        .merge(turn_routes)
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_auth,
        ));

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured address.
///
/// Binds to 127.0.0.1 (localhost only) on the port from config.
pub async fn start_server(config: &DealchatConfig, state: AppState) -> Result<(), DealchatError> {
    let addr = format!("127.0.0.1:{}", config.general.port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| DealchatError::Api(format!("Failed to bind: {}", e)))?;

    axum::serve(listener, router)
        .await
        .map_err(|e| DealchatError::Api(format!("Server error: {}", e)))?;

    Ok(())
}
