// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Filesystem watcher driving hot-reload.
//!
//! Any change under the agent root, cron directory, or workflows directory
//! schedules an apply after a 120 ms debounce; applies themselves are
//! serialized by the supervisor's own lock.

use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::supervisor::Supervisor;

pub const DEBOUNCE: Duration = Duration::from_millis(120);

/// Start watching. The returned watcher must be kept alive for the
/// lifetime of the process.
pub fn spawn_watcher(supervisor: Arc<Supervisor>) -> anyhow::Result<RecommendedWatcher> {
    let (tx, rx) = mpsc::channel::<()>(16);

    let mut watcher = notify::recommended_watcher(move |result| match result {
        Ok(_event) => {
            // Full queue means a reload is already pending; dropping the
            // signal is fine.
            let _ = tx.try_send(());
        }
        Err(e) => warn!(error = %e, "file watcher error"),
    })?;

    watcher.watch(&supervisor.paths.root, RecursiveMode::NonRecursive)?;
    for dir in [
        supervisor.paths.cron_dir(),
        supervisor.paths.workflows_dir(),
    ] {
        if dir.is_dir() {
            watcher.watch(&dir, RecursiveMode::Recursive)?;
        }
    }

    tokio::spawn(debounce_loop(supervisor, rx));
    Ok(watcher)
}

async fn debounce_loop(supervisor: Arc<Supervisor>, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        // Collapse the burst: wait until the directory has been quiet for
        // one debounce window.
        loop {
            tokio::select! {
                _ = tokio::time::sleep(DEBOUNCE) => break,
                more = rx.recv() => {
                    if more.is_none() {
                        return;
                    }
                }
            }
        }
        debug!("file change detected; applying");
        if let Err(e) = supervisor.apply_from_disk("file_change").await {
            warn!(error = %e, "hot reload failed; previous state kept");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use nils_config::AgentPaths;

    use super::*;

    #[tokio::test]
    async fn file_change_triggers_apply() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("agent");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join("config.yaml"),
            "model:\n  provider: mock\n  name: m\nlogging:\n  stdout: false\n  level: error\n",
        )
        .unwrap();
        let supervisor = Supervisor::init(AgentPaths::new(&root)).await.unwrap();
        let _watcher = spawn_watcher(supervisor.clone()).unwrap();
        let before = supervisor.config_version();

        std::fs::write(
            root.join("workflows/new.yaml"),
            "name: fresh\nsteps:\n  - name: s\n    prompt: p\n",
        )
        .unwrap();

        // Debounce plus apply can take a moment under load.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if supervisor.config_version() > before {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "watcher never applied the change"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(supervisor.workflows().get("fresh").is_some());
    }
}
