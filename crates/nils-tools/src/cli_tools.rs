// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Declarative CLI tools.
//!
//! A YAML document turns external commands into registry entries. The
//! subprocess is spawned **without** a shell so metacharacters inside
//! parameter values stay literal, and its environment is built through the
//! same allowlist policy as the bash tool.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use nils_security::build_tool_env;

use crate::tool::{Tool, ToolCategory, ToolContext};

// ─── Document shape ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CliToolsDoc {
    #[serde(default)]
    pub tools: Vec<CliToolSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CliToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default = "default_category")]
    pub category: ToolCategory,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra argv fragments appended only when the named parameter was
    /// provided by the model.
    #[serde(default)]
    pub optional_args: HashMap<String, Vec<String>>,
    /// Env entries; values of the form `${VAR}` resolve against the parent
    /// environment at call time, everything else is literal.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub parameters: HashMap<String, CliParamSpec>,
}

fn default_category() -> ToolCategory {
    ToolCategory::Read
}

#[derive(Debug, Clone, Deserialize)]
pub struct CliParamSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "enum", default)]
    pub allowed: Option<Vec<String>>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

/// Parse a tools document and build registry entries.
///
/// Unknown parameter types fail the whole load: a half-loaded tool set
/// after an edit would be worse than refusing the document.
pub fn load_cli_tools(
    doc_text: &str,
    ctx: Arc<ToolContext>,
) -> anyhow::Result<Vec<Arc<dyn Tool>>> {
    let doc: CliToolsDoc = serde_yaml::from_str(doc_text).context("parsing tools document")?;
    let mut tools: Vec<Arc<dyn Tool>> = Vec::with_capacity(doc.tools.len());
    for spec in doc.tools {
        let schema = build_schema(&spec)?;
        tools.push(Arc::new(CliTool {
            spec,
            schema,
            ctx: ctx.clone(),
        }));
    }
    Ok(tools)
}

fn build_schema(spec: &CliToolSpec) -> anyhow::Result<Value> {
    let mut properties = Map::new();
    let mut required: Vec<String> = Vec::new();
    for (name, param) in &spec.parameters {
        let type_name = match param.kind.as_str() {
            "string" => "string",
            "number" => "number",
            "boolean" => "boolean",
            other => bail!(
                "tool {}: parameter {name} has unknown type {other:?}",
                spec.name
            ),
        };
        let mut field = Map::new();
        field.insert("type".into(), json!(type_name));
        if let Some(allowed) = &param.allowed {
            field.insert("enum".into(), json!(allowed));
        }
        if let Some(pattern) = &param.pattern {
            field.insert("pattern".into(), json!(pattern));
        }
        properties.insert(name.clone(), Value::Object(field));
        if !param.optional {
            required.push(name.clone());
        }
    }
    required.sort();
    Ok(json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    }))
}

// ─── The tool itself ──────────────────────────────────────────────────────────

struct CliTool {
    spec: CliToolSpec,
    schema: Value,
    ctx: Arc<ToolContext>,
}

#[async_trait]
impl Tool for CliTool {
    fn name(&self) -> &str {
        &self.spec.name
    }
    fn description(&self) -> &str {
        &self.spec.description
    }
    fn category(&self) -> ToolCategory {
        self.spec.category
    }
    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let mut argv: Vec<String> = self
            .spec
            .args
            .iter()
            .map(|template| render_template(template, args))
            .collect();
        for (param, extra) in &self.spec.optional_args {
            if args.contains_key(param) {
                argv.extend(extra.iter().map(|t| render_template(t, args)));
            }
        }

        let overrides: HashMap<String, String> = self
            .spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), resolve_env_value(v)))
            .collect();
        let env = build_tool_env(&self.ctx.allowed_env, &overrides);

        debug!(tool = %self.spec.name, cmd = %self.spec.cmd, "cli tool");
        let child = tokio::process::Command::new(&self.spec.cmd)
            .args(&argv)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.spec.cmd))?;

        let wait_fut = child.wait_with_output();
        tokio::pin!(wait_fut);
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                bail!("command cancelled");
            }
            out = &mut wait_fut => out?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        if !output.status.success() {
            bail!(
                "command exited with status {}:\n{combined}",
                output.status.code().unwrap_or(-1)
            );
        }
        Ok(combined)
    }
}

/// Substitute every `{{ name }}` placeholder from the argument map.
/// Unknown references render as the empty string.
fn render_template(template: &str, args: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let key = after[..close].trim();
                if let Some(value) = args.get(key) {
                    out.push_str(&value_to_arg(value));
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn value_to_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `${VAR}` resolves against the parent env at call time; anything else is
/// a literal.
fn resolve_env_value(value: &str) -> String {
    value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(|var| std::env::var(var).unwrap_or_default())
        .unwrap_or_else(|| value.to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::builtin::test_ctx;
    use crate::executor::{execute_tool, ExecLimits};
    use crate::registry::ToolRegistry;

    use super::*;

    const DOC: &str = r#"
tools:
  - name: word_count
    description: Count words in the given text
    category: read
    cmd: wc
    args: ["-w"]
    parameters: {}
  - name: echo_args
    description: Echo rendered arguments
    cmd: echo
    args: ["value={{ value }}", "fixed"]
    optional_args:
      verbose: ["--verbose", "{{ verbose }}"]
    env:
      GREETING: hello
      FROM_PARENT: ${NILS_CLI_PARENT}
    parameters:
      value:
        type: string
      verbose:
        type: string
        optional: true
"#;

    fn load(root: &std::path::Path) -> Vec<Arc<dyn Tool>> {
        load_cli_tools(DOC, test_ctx(root)).unwrap()
    }

    #[test]
    fn loads_specs_and_synthesizes_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let tools = load(tmp.path());
        assert_eq!(tools.len(), 2);
        let echo = tools.iter().find(|t| t.name() == "echo_args").unwrap();
        let schema = echo.parameters_schema();
        assert_eq!(schema["properties"]["value"]["type"], "string");
        assert_eq!(schema["required"], json!(["value"]));
    }

    #[test]
    fn unknown_parameter_type_fails_load() {
        let doc = "
tools:
  - name: bad
    description: x
    cmd: true
    parameters:
      p:
        type: object
";
        let tmp = tempfile::tempdir().unwrap();
        let err = load_cli_tools(doc, test_ctx(tmp.path())).unwrap_err();
        assert!(err.to_string().contains("unknown type"));
    }

    #[test]
    fn template_rendering() {
        let args = json!({"value": "x y", "n": 3}).as_object().unwrap().clone();
        assert_eq!(render_template("value={{ value }}", &args), "value=x y");
        assert_eq!(render_template("{{n}}", &args), "3");
        assert_eq!(render_template("{{ missing }}!", &args), "!");
        assert_eq!(render_template("no placeholders", &args), "no placeholders");
    }

    #[test]
    fn env_value_resolution() {
        std::env::set_var("NILS_CLI_RESOLVE", "resolved");
        assert_eq!(resolve_env_value("${NILS_CLI_RESOLVE}"), "resolved");
        assert_eq!(resolve_env_value("literal"), "literal");
        assert_eq!(resolve_env_value("${NILS_CLI_ABSENT_XYZ}"), "");
    }

    #[tokio::test]
    async fn metacharacters_stay_literal_without_shell() {
        let tmp = tempfile::tempdir().unwrap();
        let tools = load(tmp.path());
        let registry = ToolRegistry::with_tools(tools).unwrap();
        let out = execute_tool(
            &registry,
            "echo_args",
            &json!({"value": "$(rm -rf /) && echo pwned"})
                .as_object()
                .unwrap()
                .clone(),
            &CancellationToken::new(),
            ExecLimits::default(),
        )
        .await;
        assert!(!out.is_error, "{}", out.content);
        // echo prints the raw string; nothing was interpreted by a shell.
        assert!(out.content.contains("value=$(rm -rf /) && echo pwned"));
    }

    #[tokio::test]
    async fn optional_args_only_when_provided() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::with_tools(load(tmp.path())).unwrap();
        let without = execute_tool(
            &registry,
            "echo_args",
            &json!({"value": "v"}).as_object().unwrap().clone(),
            &CancellationToken::new(),
            ExecLimits::default(),
        )
        .await;
        assert!(!without.content.contains("--verbose"));

        let with = execute_tool(
            &registry,
            "echo_args",
            &json!({"value": "v", "verbose": "high"})
                .as_object()
                .unwrap()
                .clone(),
            &CancellationToken::new(),
            ExecLimits::default(),
        )
        .await;
        assert!(with.content.contains("--verbose"));
        assert!(with.content.contains("high"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let doc = "
tools:
  - name: failer
    description: always fails
    cmd: false
    parameters: {}
";
        let tmp = tempfile::tempdir().unwrap();
        let registry =
            ToolRegistry::with_tools(load_cli_tools(doc, test_ctx(tmp.path())).unwrap()).unwrap();
        let out = execute_tool(
            &registry,
            "failer",
            &Map::new(),
            &CancellationToken::new(),
            ExecLimits::default(),
        )
        .await;
        assert!(out.is_error);
        assert!(out.content.contains("exited with status"));
    }
}
