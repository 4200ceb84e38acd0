use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use dl_agent::{AgentMetadata, ConversationMessage, CreateAgentRequest};
use serde::Serialize;

use crate::error::ApiErrorResponse;
use crate::state::AppState;

#[derive(Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<AgentMetadata>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAgentResponse {
    pub removed: bool,
    pub agent_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    pub agent_id: String,
    pub messages: Vec<ConversationMessage>,
}

pub async fn create_agent(
    State(state): State<AppState>,
    body: Result<Json<CreateAgentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AgentMetadata>), ApiErrorResponse> {
    let Json(body) = body?;
    let metadata = state.bridge.create_agent(body).await?;
    Ok((StatusCode::CREATED, Json(metadata)))
}

pub async fn list_agents(
    State(state): State<AppState>,
) -> Result<Json<AgentListResponse>, ApiErrorResponse> {
    let agents = state.bridge.list_agents().await?;
    Ok(Json(AgentListResponse { agents }))
}

pub async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteAgentResponse>, ApiErrorResponse> {
    state.bridge.delete_agent(&id).await?;
    Ok(Json(DeleteAgentResponse {
        removed: true,
        agent_id: id,
    }))
}

pub async fn conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, ApiErrorResponse> {
    let log = state.bridge.conversation(&id).await?;
    Ok(Json(ConversationResponse {
        agent_id: log.id,
        messages: log.messages,
    }))
}
