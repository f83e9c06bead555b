// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// One workflow document (`<name>.yaml` in the workflows directory).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: HashMap<String, ParamSpec>,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "enum", default)]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_failure: OnFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Halt,
    Continue,
    SkipRemaining,
}

impl WorkflowSpec {
    /// Synthesize the JSON Schema used both for run-parameter validation
    /// and for the `workflow_<name>` tool definition.
    pub fn parameters_schema(&self) -> anyhow::Result<Value> {
        let mut properties = Map::new();
        let mut required: Vec<String> = Vec::new();
        for (name, param) in &self.parameters {
            let type_name = match param.kind.as_str() {
                "string" => "string",
                "number" => "number",
                "boolean" => "boolean",
                other => bail!(
                    "workflow {}: parameter {name} has unknown type {other:?}",
                    self.name
                ),
            };
            let mut field = Map::new();
            field.insert("type".into(), json!(type_name));
            if let Some(allowed) = &param.allowed {
                field.insert("enum".into(), json!(allowed));
            }
            properties.insert(name.clone(), Value::Object(field));
            if param.default.is_none() {
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

    /// Fill declared defaults into a caller-provided argument map.
    pub fn apply_defaults(&self, params: &mut Map<String, Value>) {
        for (name, spec) in &self.parameters {
            if let (false, Some(default)) = (params.contains_key(name), &spec.default) {
                params.insert(name.clone(), default.clone());
            }
        }
    }
}

/// Load every `*.yaml` / `*.yml` in the workflows directory. Documents that
/// fail to parse are skipped with a warning so one broken file cannot take
/// down a reload.
pub fn load_workflows(dir: &Path) -> anyhow::Result<Vec<WorkflowSpec>> {
    let mut specs = Vec::new();
    if !dir.is_dir() {
        return Ok(specs);
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_yaml::from_str::<WorkflowSpec>(&text) {
            Ok(spec) => {
                debug!(workflow = %spec.name, path = %path.display(), "loaded workflow");
                specs.push(spec);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid workflow"),
        }
    }
    Ok(specs)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "
name: review
description: review a branch
parameters:
  branch:
    type: string
  depth:
    type: number
    default: 3
steps:
  - name: fetch
    prompt: 'Fetch {{ parameters.branch }}'
  - name: report
    prompt: 'Summarize'
    condition: 'parameters.depth == 3'
    on_failure: skip_remaining
";

    #[test]
    fn parses_document() {
        let spec: WorkflowSpec = serde_yaml::from_str(DOC).unwrap();
        assert_eq!(spec.name, "review");
        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[0].on_failure, OnFailure::Halt);
        assert_eq!(spec.steps[1].on_failure, OnFailure::SkipRemaining);
    }

    #[test]
    fn schema_marks_defaultless_params_required() {
        let spec: WorkflowSpec = serde_yaml::from_str(DOC).unwrap();
        let schema = spec.parameters_schema().unwrap();
        assert_eq!(schema["required"], serde_json::json!(["branch"]));
        assert_eq!(schema["properties"]["depth"]["type"], "number");
    }

    #[test]
    fn unknown_parameter_type_is_an_error() {
        let doc = "
name: bad
parameters:
  p:
    type: list
steps:
  - name: s
    prompt: x
";
        let spec: WorkflowSpec = serde_yaml::from_str(doc).unwrap();
        assert!(spec.parameters_schema().is_err());
    }

    #[test]
    fn defaults_fill_missing_params() {
        let spec: WorkflowSpec = serde_yaml::from_str(DOC).unwrap();
        let mut params = Map::new();
        params.insert("branch".into(), json!("main"));
        spec.apply_defaults(&mut params);
        assert_eq!(params["depth"], json!(3));
        assert_eq!(params["branch"], json!("main"));
    }

    #[test]
    fn load_skips_broken_documents() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("good.yaml"), DOC).unwrap();
        std::fs::write(tmp.path().join("bad.yaml"), "steps: [not a step]").unwrap();
        std::fs::write(tmp.path().join("ignored.txt"), "x").unwrap();
        let specs = load_workflows(tmp.path()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "review");
    }

    #[test]
    fn missing_directory_is_empty_not_error() {
        let specs = load_workflows(Path::new("/tmp/nils_missing_workflows_dir")).unwrap();
        assert!(specs.is_empty());
    }
}
