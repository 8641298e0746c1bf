use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::history::{MessageInput, ThreadFilter};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: Option<i64>,
    pub thread_id: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateChatHistoryRequest {
    pub user_id: Option<i64>,
    pub thread_id: Option<String>,
    pub messages: Option<Vec<MessageInput>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateChatHistoryRequest {
    pub messages: Option<Vec<MessageInput>>,
}

#[derive(Debug, Deserialize)]
pub struct AppendMessageRequest {
    pub role: Option<String>,
    pub content: Option<String>,
}

pub async fn list_chat_histories(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = ThreadFilter {
        user_id: query.user_id,
        thread_id: query.thread_id,
    };
    let page = state
        .history
        .list(filter, query.page.unwrap_or(1), query.per_page.unwrap_or(0))
        .await?;

    Ok(Json(json!({ "success": true, "data": page })))
}

pub async fn create_chat_history(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateChatHistoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = state
        .history
        .create(payload.user_id, payload.thread_id, payload.messages)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": thread })),
    ))
}

pub async fn get_chat_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = state.history.get(id).await?;
    Ok(Json(json!({ "success": true, "data": thread })))
}

pub async fn get_chat_history_by_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = state.history.get_by_thread_id(&thread_id).await?;
    Ok(Json(json!({ "success": true, "data": thread })))
}

pub async fn update_chat_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateChatHistoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = state.history.replace_messages(id, payload.messages).await?;
    Ok(Json(json!({ "success": true, "data": thread })))
}

pub async fn append_message(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Json(payload): Json<AppendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = state
        .history
        .append_message(&thread_id, payload.role, payload.content)
        .await?;

    Ok(Json(json!({ "success": true, "data": thread })))
}

pub async fn clear_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.history.clear_messages(&thread_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": { "message": "Thread messages cleared successfully." }
    })))
}

pub async fn delete_chat_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.history.delete(id).await?;
    Ok(Json(json!({
        "success": true,
        "data": { "message": "Chat history deleted successfully." }
    })))
}
