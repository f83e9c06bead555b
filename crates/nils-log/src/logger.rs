// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Value};

use crate::redact::redact;
use crate::rotate::RotatingFile;

/// Log severity, ordered `debug < info < warn < error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// The operational JSON-lines log.
///
/// Every line is `{ts, level, module, event, ...fields}`. Fields pass the
/// redaction pass *before* serialization, so secrets never reach disk or
/// stdout. Cheap to share behind an `Arc`; writes are serialized by an
/// internal mutex.
pub struct Logger {
    min_level: Level,
    stdout: bool,
    file: Option<Mutex<RotatingFile>>,
}

impl Logger {
    pub fn new(min_level: Level, stdout: bool) -> Self {
        Self {
            min_level,
            stdout,
            file: None,
        }
    }

    pub fn with_file(
        mut self,
        path: &Path,
        max_size_mb: u64,
        max_days: u32,
    ) -> anyhow::Result<Self> {
        self.file = Some(Mutex::new(RotatingFile::open(path, max_size_mb, max_days)?));
        Ok(self)
    }

    /// A logger that drops everything. Useful default for tests.
    pub fn disabled() -> Self {
        Self {
            min_level: Level::Error,
            stdout: false,
            file: None,
        }
    }

    pub fn debug(&self, module: &str, event: &str, fields: Value) {
        self.log(Level::Debug, module, event, fields);
    }
    pub fn info(&self, module: &str, event: &str, fields: Value) {
        self.log(Level::Info, module, event, fields);
    }
    pub fn warn(&self, module: &str, event: &str, fields: Value) {
        self.log(Level::Warn, module, event, fields);
    }
    pub fn error(&self, module: &str, event: &str, fields: Value) {
        self.log(Level::Error, module, event, fields);
    }

    pub fn log(&self, level: Level, module: &str, event: &str, fields: Value) {
        if level < self.min_level {
            return;
        }
        let line = self.render(level, module, event, fields);
        if self.stdout {
            println!("{line}");
        }
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.write_line(&line);
            }
        }
    }

    fn render(&self, level: Level, module: &str, event: &str, fields: Value) -> String {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "level": level.as_str(),
            "module": module,
            "event": event,
        });
        if let (Some(obj), Value::Object(extra)) = (entry.as_object_mut(), fields) {
            for (k, v) in extra {
                obj.entry(k).or_insert(v);
            }
        }
        redact(&mut entry);
        entry.to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
