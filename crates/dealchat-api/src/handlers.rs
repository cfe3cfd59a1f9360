//! Route handler functions for all API endpoints.
//!
//! Handlers pull the caller identity attached by the auth middleware,
//! call into the orchestrator and shape its outcome into HTTP.

use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dealchat_chat::{TurnOutcome, TurnRequest};
use dealchat_core::types::{ConfirmationDecision, Conversation, Identity};

use crate::error::ApiError;
use crate::rate_limit::client_origin;
use crate::state::AppState;

/// Response header naming the conversation a streamed reply belongs to.
pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

// =============================================================================
// Request and response types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub conversation_id: Uuid,
    pub title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationIdParams {
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

// =============================================================================
// Helpers
// =============================================================================

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn parse_conversation_id(params: &ConversationIdParams) -> Result<Uuid, ApiError> {
    let raw = params
        .conversation_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("conversationId is required".to_string()))?;
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::BadRequest(format!("Invalid conversationId: '{}'", raw)))
}

fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))
}

/// Shape a turn outcome into a response.
fn outcome_response(outcome: TurnOutcome) -> Result<Response, ApiError> {
    match outcome {
        TurnOutcome::Streaming(stream) => {
            let conversation_id = HeaderValue::from_str(&stream.conversation_id.to_string())
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            let body = Body::from_stream(stream.map(|item| item.map(Bytes::from)));
            Ok((
                StatusCode::OK,
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; charset=utf-8"),
                    ),
                    (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                ],
                [(CONVERSATION_ID_HEADER, conversation_id)],
                body,
            )
                .into_response())
        }
        TurnOutcome::Proposal { proposal, .. } => Ok(Json(proposal).into_response()),
        TurnOutcome::Executed(output) => Ok(Json(output).into_response()),
        TurnOutcome::Cancelled => Ok(Json(AckResponse {
            success: false,
            message: Some("cancelled".to_string()),
        })
        .into_response()),
    }
}

// =============================================================================
// Turns
// =============================================================================

/// POST /api/chat/ask - send a message; streams text or returns a proposal.
pub async fn ask(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let origin = client_origin(&headers);
    let permit = state
        .orchestrator
        .admit_turn(Some(&identity), &origin)
        .await
        .map_err(|e| state.api_error(e))?;
    let body = json_body(payload)?;
    let outcome = permit
        .run(TurnRequest::Message {
            conversation_id: body.conversation_id,
            message: body.message,
        })
        .await
        .map_err(|e| state.api_error(e))?;
    outcome_response(outcome)
}

/// POST /api/chat/confirm - approve or reject a proposed tool call.
pub async fn confirm(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
    payload: Result<Json<ConfirmationDecision>, JsonRejection>,
) -> Result<Response, ApiError> {
    let origin = client_origin(&headers);
    let permit = state
        .orchestrator
        .admit_turn(Some(&identity), &origin)
        .await
        .map_err(|e| state.api_error(e))?;
    let decision = json_body(payload)?;
    let outcome = permit
        .run(TurnRequest::Confirm(decision))
        .await
        .map_err(|e| state.api_error(e))?;
    outcome_response(outcome)
}

// =============================================================================
// Conversation management
// =============================================================================

/// GET /api/chat/conversations - the caller's conversations, newest first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ConversationsResponse>, ApiError> {
    let conversations = state
        .orchestrator
        .list_conversations(&identity)
        .await
        .map_err(|e| state.api_error(e))?;
    Ok(Json(ConversationsResponse { conversations }))
}

/// GET /api/chat/conversation?conversationId= - one conversation.
pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<ConversationIdParams>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let id = parse_conversation_id(&params)?;
    let conversation = state
        .orchestrator
        .get_conversation(&identity, id)
        .await
        .map_err(|e| state.api_error(e))?;
    Ok(Json(ConversationResponse { conversation }))
}

/// POST /api/chat/create - new empty conversation.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    body: Bytes,
) -> Result<(StatusCode, Json<ConversationResponse>), ApiError> {
    let request: CreateRequest = optional_json(&body)?;
    let conversation = state
        .orchestrator
        .create_conversation(&identity, request.title.as_deref())
        .await
        .map_err(|e| state.api_error(e))?;
    Ok((StatusCode::CREATED, Json(ConversationResponse { conversation })))
}

/// DELETE /api/chat/delete?conversationId= - remove a conversation.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<ConversationIdParams>,
) -> Result<Json<AckResponse>, ApiError> {
    let id = parse_conversation_id(&params)?;
    state
        .orchestrator
        .delete_conversation(&identity, id)
        .await
        .map_err(|e| state.api_error(e))?;
    Ok(Json(AckResponse {
        success: true,
        message: None,
    }))
}

/// POST /api/chat/update-title - rename a conversation.
pub async fn update_title(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let body = json_body(payload)?;
    let conversation = state
        .orchestrator
        .rename_conversation(&identity, body.conversation_id, &body.title)
        .await
        .map_err(|e| state.api_error(e))?;
    Ok(Json(ConversationResponse { conversation }))
}

/// GET /health - liveness check.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}
