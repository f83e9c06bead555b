// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use nils_config::{AgentPaths, SystemPromptConfig};
use nils_tools::ToolRegistry;
use nils_workflow::WorkflowEngine;
use tracing::warn;

/// Static system-prompt fragments, assembled once per reload.
///
/// Identity, tool catalog, and workflow catalog change only when the
/// supervisor applies new state; the session-specific override is combined
/// at turn time.
#[derive(Debug, Clone, Default)]
pub struct PreparedSystemPrompt {
    identity: String,
    custom_instructions: String,
    tool_catalog: String,
    workflow_catalog: String,
}

impl PreparedSystemPrompt {
    pub fn build(
        config: &SystemPromptConfig,
        paths: &AgentPaths,
        registry: &ToolRegistry,
        workflows: &WorkflowEngine,
    ) -> Self {
        let identity = config
            .identity_file
            .as_deref()
            .map(|f| read_fragment(paths, f))
            .unwrap_or_default();
        let custom_instructions = config
            .custom_instructions_file
            .as_deref()
            .map(|f| read_fragment(paths, f))
            .unwrap_or_default();

        let tool_catalog = registry
            .schemas()
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.description.lines().next().unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n");
        let workflow_catalog = workflows
            .specs()
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            identity,
            custom_instructions,
            tool_catalog,
            workflow_catalog,
        }
    }

    /// Combine the static fragments with a session-specific override.
    /// An override replaces the identity block, never the catalogs.
    pub fn compose(&self, session_override: Option<&str>) -> String {
        let mut sections: Vec<String> = Vec::new();
        match session_override {
            Some(identity) if !identity.is_empty() => sections.push(identity.to_string()),
            _ if !self.identity.is_empty() => sections.push(self.identity.clone()),
            _ => {}
        }
        if !self.custom_instructions.is_empty() {
            sections.push(self.custom_instructions.clone());
        }
        if !self.tool_catalog.is_empty() {
            sections.push(format!("Available tools:\n{}", self.tool_catalog));
        }
        if !self.workflow_catalog.is_empty() {
            sections.push(format!("Available workflows:\n{}", self.workflow_catalog));
        }
        sections.join("\n\n")
    }
}

fn read_fragment(paths: &AgentPaths, file: &str) -> String {
    let path = paths.resolve(file);
    match std::fs::read_to_string(&path) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "system prompt fragment unreadable");
            String::new()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
