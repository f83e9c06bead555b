// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Thin REST surface over the store, scheduler, and workflow engine.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use nils_store::{CreateSessionOptions, StoreError};
use nils_workflow::WorkflowError;

use crate::supervisor::Supervisor;

pub fn router() -> Router<Arc<Supervisor>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/cron", get(cron_status))
        .route("/api/cron/:id/pause", post(cron_pause))
        .route("/api/cron/:id/resume", post(cron_resume))
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/:name/run", post(run_workflow))
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true}))
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

async fn list_sessions(State(supervisor): State<Arc<Supervisor>>) -> Response {
    match supervisor.store().list().await {
        Ok(items) => Json(items).into_response(),
        Err(e) => internal(e),
    }
}

async fn create_session(
    State(supervisor): State<Arc<Supervisor>>,
    body: Option<Json<CreateSessionBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let model = body
        .model
        .unwrap_or_else(|| supervisor.config().model.name.clone());
    match supervisor
        .store()
        .create(CreateSessionOptions {
            name: body.name,
            model,
            ..CreateSessionOptions::default()
        })
        .await
    {
        Ok(metadata) => (StatusCode::CREATED, Json(metadata)).into_response(),
        Err(e) => internal(e),
    }
}

async fn get_session(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> Response {
    match supervisor.store().get(&id).await {
        Ok(metadata) => Json(metadata).into_response(),
        Err(e) => store_error(e),
    }
}

async fn delete_session(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> Response {
    match supervisor.store().delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error(e),
    }
}

// ── Cron ──────────────────────────────────────────────────────────────────────

async fn cron_status(State(supervisor): State<Arc<Supervisor>>) -> Response {
    Json(supervisor.cron().status().await).into_response()
}

async fn cron_pause(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> Response {
    match supervisor.cron().pause(&id).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn cron_resume(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> Response {
    match supervisor.cron().resume(&id).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

// ── Workflows ─────────────────────────────────────────────────────────────────

async fn list_workflows(State(supervisor): State<Arc<Supervisor>>) -> Response {
    let engine = supervisor.workflows();
    let summaries: Vec<Value> = engine
        .specs()
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "description": spec.description,
                "steps": spec.steps.len(),
            })
        })
        .collect();
    Json(summaries).into_response()
}

async fn run_workflow(
    State(supervisor): State<Arc<Supervisor>>,
    Path(name): Path<String>,
    body: Option<Json<Map<String, Value>>>,
) -> Response {
    let params = body.map(|Json(b)| b).unwrap_or_default();
    match supervisor.workflows().run(&name, params).await {
        Ok(result) => Json(result).into_response(),
        Err(WorkflowError::NotFound(name)) => {
            (StatusCode::NOT_FOUND, format!("workflow not found: {name}")).into_response()
        }
        Err(WorkflowError::InvalidParams(message)) => {
            (StatusCode::BAD_REQUEST, message).into_response()
        }
        Err(WorkflowError::Internal(e)) => internal(e),
    }
}

// ── Error mapping ─────────────────────────────────────────────────────────────

fn store_error(e: anyhow::Error) -> Response {
    match e.downcast_ref::<StoreError>() {
        Some(StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        Some(StoreError::InvalidId(_)) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        None => internal(e),
    }
}

fn internal(e: anyhow::Error) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}
