// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket endpoint: JSON frames in, fan-out frames back.
//!
//! Each `send_message` lands on the session's serial FIFO queue; a second
//! message for the same session always starts after the first finished.
//! Sessions run concurrently with each other. A `cancel` frame cancels the
//! named active run. On server shutdown every socket closes with 1001.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::frames::{ClientFrame, ServerFrame};
use crate::hub::RunJob;
use crate::run::run_step;
use crate::supervisor::Supervisor;

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, supervisor, query))
}

async fn handle_socket(mut socket: WebSocket, supervisor: Arc<Supervisor>, query: WsQuery) {
    let hub = supervisor.hub.clone();
    let (conn_id, mut outbound) = hub.connect();
    if let Some(session_id) = &query.session_id {
        hub.subscribe(conn_id, session_id);
    }

    loop {
        tokio::select! {
            biased;
            _ = hub.shutdown.cancelled() => {
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "server shutting down".into(),
                    })))
                    .await;
                break;
            }
            frame = outbound.recv() => {
                match frame {
                    Some(line) => {
                        if socket.send(WsMessage::Text(line)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&supervisor, conn_id, &text);
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(conn = conn_id, "ws recv error: {e}");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(conn_id);
    debug!(conn = conn_id, "ws connection closed");
}

fn handle_frame(supervisor: &Arc<Supervisor>, conn_id: u64, text: &str) {
    let hub = supervisor.hub.clone();
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn = conn_id, "invalid client frame: {e}");
            hub.send_to(
                conn_id,
                &ServerFrame::Error {
                    session_id: String::new(),
                    run_id: None,
                    message: format!("invalid frame: {e}"),
                },
            );
            return;
        }
    };

    match frame {
        ClientFrame::SendMessage {
            session_id,
            content,
        } => {
            hub.subscribe(conn_id, &session_id);
            let run_id = nils_store::generate_id();
            let job = RunJob {
                run_id,
                content,
            };
            let accepted = hub.enqueue(&session_id, job, |rx| {
                spawn_session_worker(supervisor.clone(), session_id.clone(), rx);
            });
            if !accepted {
                hub.emit(&ServerFrame::Error {
                    session_id,
                    run_id: None,
                    message: "Session queue is full. Please retry later.".into(),
                });
            }
        }
        ClientFrame::Cancel { session_id, run_id } => {
            if !hub.cancel_run(&session_id, &run_id) {
                debug!(session = %session_id, run = %run_id, "cancel for unknown run");
            }
        }
    }
}

/// Drain one session's queue serially. Every job gets a fresh runtime
/// snapshot so hot-reload applies between runs, never during one.
fn spawn_session_worker(
    supervisor: Arc<Supervisor>,
    session_id: String,
    mut rx: tokio::sync::mpsc::Receiver<RunJob>,
) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if supervisor.hub.shutdown.is_cancelled() {
                break;
            }
            let ctx = supervisor.run_context();
            run_step(supervisor.hub.clone(), ctx, session_id.clone(), job).await;
        }
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
