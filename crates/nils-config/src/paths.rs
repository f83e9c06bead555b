// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

/// Well-known locations inside the agent root directory.
///
/// ```text
/// <root>/config.yaml        main configuration
/// <root>/tools.yaml         declarative CLI-tool document
/// <root>/cron/*.yaml        cron job configs
/// <root>/workflows/*.yaml   workflow documents
/// <root>/sessions/<id>/     per-session store
/// <root>/auth.json          OAuth credential store
/// <root>/logs/agent.log     rotated JSON-lines log
/// ```
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub root: PathBuf,
}

impl AgentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root: `~/.nils`, overridable with the NILS_ROOT env var.
    pub fn discover() -> Self {
        if let Ok(root) = std::env::var("NILS_ROOT") {
            return Self::new(root);
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".nils"))
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn tools_file(&self) -> PathBuf {
        self.root.join("tools.yaml")
    }

    pub fn cron_dir(&self) -> PathBuf {
        self.root.join("cron")
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn auth_file(&self) -> PathBuf {
        self.root.join("auth.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("logs").join("agent.log")
    }

    /// Create the directory skeleton if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.cron_dir(),
            self.workflows_dir(),
            self.sessions_dir(),
            self.root.join("logs"),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Resolve a possibly relative path against the agent root.
    pub fn resolve(&self, p: &str) -> PathBuf {
        let path = Path::new(p);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
