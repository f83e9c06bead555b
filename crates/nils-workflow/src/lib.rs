// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod condition;
mod engine;
mod spec;
mod tool;

pub use condition::{evaluate_condition, CondValue};
pub use engine::{
    EngineConfig, StepResult, StepStatus, WorkflowEngine, WorkflowError, WorkflowRunResult,
};
pub use spec::{load_workflows, OnFailure, ParamSpec, StepSpec, WorkflowSpec};
pub use tool::workflow_tools;
