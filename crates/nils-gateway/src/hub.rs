// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frames::ServerFrame;

/// Per-session queue depth. One overflow frame is cheaper than an
/// unbounded backlog of model runs.
pub const SESSION_QUEUE_DEPTH: usize = 8;

/// A queued run: a user message waiting its turn on the session.
pub struct RunJob {
    pub run_id: String,
    pub content: String,
}

/// Connection/subscription registry and run bookkeeping for the WebSocket
/// layer.
///
/// All maps use std mutexes: every critical section is a short map
/// operation, never held across an await. Fan-out serializes a frame once
/// and pushes it to each subscriber's unbounded outbound queue; a closed
/// subscriber is dropped rather than back-pressuring the producer.
pub struct WsHub {
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    subscriptions: Mutex<HashMap<String, HashSet<u64>>>,
    /// Active run cancellation tokens keyed `"<sessionId>:<runId>"`
    active_runs: Mutex<HashMap<String, CancellationToken>>,
    /// Per-session job queues, created lazily
    queues: Mutex<HashMap<String, mpsc::Sender<RunJob>>>,
    /// Fires once on server shutdown
    pub shutdown: CancellationToken,
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WsHub {
    pub fn new() -> Self {
        Self {
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            active_runs: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    // ── Connections & subscriptions ──────────────────────────────────────────

    pub fn connect(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().unwrap().insert(id, tx);
        debug!(conn = id, "ws connection registered");
        (id, rx)
    }

    pub fn disconnect(&self, conn_id: u64) {
        self.connections.lock().unwrap().remove(&conn_id);
        let mut subs = self.subscriptions.lock().unwrap();
        for set in subs.values_mut() {
            set.remove(&conn_id);
        }
        subs.retain(|_, set| !set.is_empty());
    }

    /// A connection subscribes to a session on first mention.
    pub fn subscribe(&self, conn_id: u64, session_id: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .insert(conn_id);
    }

    /// Fan a frame out to every subscriber of its session. Subscribers get
    /// the same serialized snapshot; closed connections are pruned.
    pub fn emit(&self, frame: &ServerFrame) {
        let Ok(line) = serde_json::to_string(frame) else {
            return;
        };
        let subscribers: Vec<u64> = self
            .subscriptions
            .lock()
            .unwrap()
            .get(frame.session_id())
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut connections = self.connections.lock().unwrap();
        for conn_id in subscribers {
            if let Some(tx) = connections.get(&conn_id) {
                if tx.send(line.clone()).is_err() {
                    connections.remove(&conn_id);
                }
            }
        }
    }

    /// Send one frame to a single connection (pre-subscription errors).
    pub fn send_to(&self, conn_id: u64, frame: &ServerFrame) {
        let Ok(line) = serde_json::to_string(frame) else {
            return;
        };
        let mut connections = self.connections.lock().unwrap();
        if let Some(tx) = connections.get(&conn_id) {
            if tx.send(line).is_err() {
                connections.remove(&conn_id);
            }
        }
    }

    // ── Active runs ──────────────────────────────────────────────────────────

    pub fn register_run(&self, session_id: &str, run_id: &str) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.active_runs
            .lock()
            .unwrap()
            .insert(run_key(session_id, run_id), token.clone());
        token
    }

    pub fn remove_run(&self, session_id: &str, run_id: &str) {
        self.active_runs
            .lock()
            .unwrap()
            .remove(&run_key(session_id, run_id));
    }

    /// Cancel one run; true when it was active.
    pub fn cancel_run(&self, session_id: &str, run_id: &str) -> bool {
        match self
            .active_runs
            .lock()
            .unwrap()
            .get(&run_key(session_id, run_id))
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_run_count(&self) -> usize {
        self.active_runs.lock().unwrap().len()
    }

    /// Server shutdown: every active run token is a child of `shutdown`,
    /// so one cancel reaches them all.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    // ── Per-session FIFO queues ──────────────────────────────────────────────

    /// Enqueue a job on the session's serial queue, creating the worker on
    /// first use via `spawn_worker`. Returns `false` when the queue is at
    /// capacity (the caller emits the overflow error frame).
    pub fn enqueue<F>(&self, session_id: &str, job: RunJob, spawn_worker: F) -> bool
    where
        F: FnOnce(mpsc::Receiver<RunJob>),
    {
        let mut queues = self.queues.lock().unwrap();
        let sender = queues.entry(session_id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
            spawn_worker(rx);
            tx
        });
        sender.try_send(job).is_ok()
    }
}

fn run_key(session_id: &str, run_id: &str) -> String {
    format!("{session_id}:{run_id}")
}

/// Removes the active-run entry on drop, so the registry stays clean on
/// every exit path, including panics inside a run.
pub struct RunGuard<'a> {
    hub: &'a WsHub,
    session_id: String,
    run_id: String,
}

impl<'a> RunGuard<'a> {
    pub fn new(hub: &'a WsHub, session_id: &str, run_id: &str) -> Self {
        Self {
            hub,
            session_id: session_id.to_string(),
            run_id: run_id.to_string(),
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.hub.remove_run(&self.session_id, &self.run_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(session: &str, text: &str) -> ServerFrame {
        ServerFrame::StreamDelta {
            session_id: session.into(),
            run_id: "R".into(),
            delta: text.into(),
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers_in_order() {
        let hub = WsHub::new();
        let (a, mut rx_a) = hub.connect();
        let (b, mut rx_b) = hub.connect();
        hub.subscribe(a, "S1");
        hub.subscribe(b, "S1");

        hub.emit(&delta("S1", "one"));
        hub.emit(&delta("S1", "two"));

        for rx in [&mut rx_a, &mut rx_b] {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            assert!(first.contains("one"));
            assert!(second.contains("two"));
        }
    }

    #[tokio::test]
    async fn non_subscribers_see_nothing() {
        let hub = WsHub::new();
        let (a, mut rx_a) = hub.connect();
        let (_b, mut rx_b) = hub.connect();
        hub.subscribe(a, "S1");

        hub.emit(&delta("S1", "x"));
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let hub = WsHub::new();
        let (a, rx_a) = hub.connect();
        hub.subscribe(a, "S1");
        drop(rx_a);
        hub.emit(&delta("S1", "x"));
        assert!(hub.connections.lock().unwrap().is_empty());
    }

    #[test]
    fn run_registry_and_cancel() {
        let hub = WsHub::new();
        let token = hub.register_run("S", "R");
        assert!(!token.is_cancelled());
        assert!(hub.cancel_run("S", "R"));
        assert!(token.is_cancelled());
        assert!(!hub.cancel_run("S", "ghost"));
    }

    #[test]
    fn run_guard_always_cleans_up() {
        let hub = WsHub::new();
        hub.register_run("S", "R");
        {
            let _guard = RunGuard::new(&hub, "S", "R");
            assert_eq!(hub.active_run_count(), 1);
        }
        assert_eq!(hub.active_run_count(), 0);
    }

    #[test]
    fn shutdown_cancels_every_active_run() {
        let hub = WsHub::new();
        let t1 = hub.register_run("S", "R1");
        let t2 = hub.register_run("S", "R2");
        hub.close();
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[test]
    fn queue_depth_is_bounded() {
        let hub = WsHub::new();
        let mut kept_rx = None;
        for i in 0..SESSION_QUEUE_DEPTH {
            let accepted = hub.enqueue(
                "S",
                RunJob {
                    run_id: format!("R{i}"),
                    content: "x".into(),
                },
                |rx| kept_rx = Some(rx), // worker never drains
            );
            assert!(accepted, "job {i} should fit");
        }
        let overflow = hub.enqueue(
            "S",
            RunJob {
                run_id: "R-overflow".into(),
                content: "x".into(),
            },
            |_| panic!("worker already exists"),
        );
        assert!(!overflow, "ninth job must be rejected");
        drop(kept_rx);
    }
}
