// API request handlers

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::{json, Value};

use super::streaming::{completion_response, openai_sse};
use super::AppState;
use crate::auth::{Credential, HarvestPayload};
use crate::error::GatewayError;
use crate::proxy::request::ChatRequest;

pub async fn root(State(state): State<AppState>) -> Json<Value> {
    let age = state.store.age();
    Json(json!({
        "status": "running",
        "service": "harvest-proxy",
        "credential": {
            "present": age.is_some(),
            "age_secs": age.map(|a| a.as_secs()),
        },
        "harvesters": state.hub.clients(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

pub async fn openai_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .gateway
        .list_models()
        .into_iter()
        .map(|id| ModelInfo {
            id,
            object: "model".to_string(),
            created,
            owned_by: "google".to_string(),
        })
        .collect();

    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}

pub async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let raw = match payload {
        Ok(Json(raw)) => raw,
        Err(e) => return GatewayError::InvalidRequest(e.body_text()).into_response(),
    };
    let request: ChatRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => return GatewayError::InvalidRequest(e.to_string()).into_response(),
    };
    if request.messages.is_empty() {
        return GatewayError::InvalidRequest("No messages provided".to_string()).into_response();
    }

    let model = request.model.clone();
    tracing::info!(
        "Chat completion: model={}, messages={}, stream={}",
        model,
        request.messages.len(),
        request.stream
    );

    if request.stream {
        let events = state.gateway.stream_chat(request);
        return openai_sse(events, &model).into_response();
    }

    match state.gateway.complete_chat(request).await {
        Ok(completion) => Json(completion_response(&completion, &model)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Operator channel for pushing a captured request by hand
pub async fn admin_credentials(
    State(state): State<AppState>,
    payload: Result<Json<HarvestPayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(p)) => p,
        Err(e) => return GatewayError::InvalidCredential(e.body_text()).into_response(),
    };

    match Credential::from_harvest(payload) {
        Ok(credential) => {
            state.store.set(credential);
            Json(json!({"status": "ok"})).into_response()
        }
        Err(e) => {
            tracing::warn!("Rejected credentials from operator: {}", e);
            e.into_response()
        }
    }
}
