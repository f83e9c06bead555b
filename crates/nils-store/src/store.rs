// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use nils_model::Message;

use crate::compact::{plan_compaction, CompactionSettings, Summarizer};
use crate::id::{generate_id, is_valid_id};
use crate::records::{
    estimate_tokens, record_to_message, AppendInput, SessionMetadata, SessionMetrics,
    SessionRecord, SessionSource, SCHEMA_VERSION,
};
use crate::title::{normalize_title, title_fallback, title_prompt, DEFAULT_SESSION_NAME};

const SESSION_FILE: &str = "session.jsonl";
const METADATA_FILE: &str = "metadata.json";

/// How many sessions `list` reads concurrently.
const LIST_CONCURRENCY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid session id: {0}")]
    InvalidId(String),
    #[error("session not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    pub compaction_enabled: bool,
    pub keep_recent_tokens: u64,
    pub reserve_tokens: u64,
    pub context_window: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            compaction_enabled: true,
            keep_recent_tokens: 20_000,
            reserve_tokens: 16_384,
            context_window: 200_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub name: Option<String>,
    pub model: String,
    pub source: SessionSource,
    pub cron_job_id: Option<String>,
    pub system_prompt_override: Option<String>,
}

/// Lightweight row returned by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListItem {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: u64,
    pub source: SessionSource,
}

/// Counters accumulated into metadata after each run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnMetrics {
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u64,
    pub total_tokens: u64,
}

#[derive(Default)]
struct SessionState {
    /// `next_seq` has been verified against the on-disk records once this
    /// process's lifetime.
    reconciled: bool,
    /// In-memory copy of the record list, kept in sync by locked operations.
    cache: Option<Vec<SessionRecord>>,
}

/// The session store owns the per-session files and their locks. All
/// mutation happens under the session's mutex; `session.jsonl` is append
/// only and `metadata.json` is replaced atomically (temp + rename).
pub struct SessionStore {
    root: PathBuf,
    /// Compaction budgets; replaced in place on hot-reload so in-flight
    /// holders of the store see the new values on their next run.
    settings: std::sync::RwLock<StoreSettings>,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionStore {
    pub fn new(sessions_root: impl Into<PathBuf>, settings: StoreSettings) -> Self {
        Self {
            root: sessions_root.into(),
            settings: std::sync::RwLock::new(settings),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn update_settings(&self, settings: StoreSettings) {
        *self.settings.write().expect("settings lock poisoned") = settings;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    async fn state(&self, id: &str) -> Arc<Mutex<SessionState>> {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(id.to_string()).or_default().clone()
    }

    fn check_id(&self, id: &str) -> Result<(), StoreError> {
        if is_valid_id(id) {
            Ok(())
        } else {
            Err(StoreError::InvalidId(id.to_string()))
        }
    }

    // ── Creation / lookup ────────────────────────────────────────────────────

    pub async fn create(&self, options: CreateSessionOptions) -> anyhow::Result<SessionMetadata> {
        let id = generate_id();
        let dir = self.session_dir(&id);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        std::fs::write(dir.join(SESSION_FILE), b"")?;

        let now = Utc::now();
        let metadata = SessionMetadata {
            id: id.clone(),
            created_at: now,
            last_message_at: now,
            message_count: 0,
            next_seq: 1,
            model: options.model,
            name: options.name.unwrap_or_else(|| DEFAULT_SESSION_NAME.into()),
            source: options.source,
            cron_job_id: options.cron_job_id,
            system_prompt_override: options.system_prompt_override,
            metrics: SessionMetrics::default(),
        };
        write_metadata(&dir, &metadata)?;

        // A session this process just created needs no reconciliation.
        let state = self.state(&id).await;
        let mut state = state.lock().await;
        state.reconciled = true;
        state.cache = Some(Vec::new());

        debug!(session = %id, "session created");
        Ok(metadata)
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<SessionMetadata> {
        self.check_id(id)?;
        let state = self.state(id).await;
        let mut state = state.lock().await;
        let dir = self.session_dir(id);
        let mut metadata = read_metadata(&dir, id)?;

        if !state.reconciled {
            let records = read_records(&dir.join(SESSION_FILE));
            let max_seq = records.iter().map(SessionRecord::seq).max().unwrap_or(0);
            let next = metadata.next_seq.max(max_seq + 1);
            if next != metadata.next_seq {
                warn!(
                    session = %id,
                    from = metadata.next_seq,
                    to = next,
                    "reconciling next_seq against on-disk records"
                );
                metadata.next_seq = next;
                write_metadata(&dir, &metadata)?;
            }
            state.reconciled = true;
        }
        Ok(metadata)
    }

    pub async fn list(&self) -> anyhow::Result<Vec<SessionListItem>> {
        let mut ids = Vec::new();
        match std::fs::read_dir(&self.root) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if is_valid_id(&name) {
                        ids.push(name);
                    }
                }
            }
            Err(_) => return Ok(Vec::new()),
        }

        let mut items: Vec<SessionListItem> = futures::stream::iter(ids)
            .map(|id| {
                let dir = self.session_dir(&id);
                async move {
                    tokio::task::spawn_blocking(move || read_metadata(&dir, &id).ok())
                        .await
                        .ok()
                        .flatten()
                }
            })
            .buffer_unordered(LIST_CONCURRENCY)
            .filter_map(|meta| async move {
                meta.map(|m| SessionListItem {
                    id: m.id,
                    name: m.name,
                    created_at: m.created_at,
                    last_message_at: m.last_message_at,
                    message_count: m.message_count,
                    source: m.source,
                })
            })
            .collect()
            .await;

        items.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(items)
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.check_id(id)?;
        let dir = self.session_dir(id);
        if !dir.exists() {
            return Err(StoreError::NotFound(id.to_string()).into());
        }
        std::fs::remove_dir_all(&dir)?;
        self.sessions.lock().await.remove(id);
        debug!(session = %id, "session deleted");
        Ok(())
    }

    // ── Append path ──────────────────────────────────────────────────────────

    pub async fn append_message(
        &self,
        id: &str,
        input: AppendInput,
    ) -> anyhow::Result<SessionRecord> {
        self.check_id(id)?;
        let state = self.state(id).await;
        let mut state = state.lock().await;
        let dir = self.session_dir(id);
        let mut metadata = self.reconciled_metadata(&mut state, &dir, id)?;

        let record = SessionRecord::Message {
            seq: metadata.next_seq,
            schema_version: SCHEMA_VERSION,
            role: input.role,
            content: input.content,
            timestamp: Utc::now(),
            is_error: input.is_error,
            tool_call_id: input.tool_call_id,
            tool_name: input.tool_name,
        };
        append_record(&dir.join(SESSION_FILE), &record)?;

        metadata.next_seq += 1;
        metadata.message_count += 1;
        metadata.last_message_at = Utc::now();
        if let Err(e) = write_metadata(&dir, &metadata) {
            // The JSONL append already happened; drop every in-memory
            // assumption so the next operation rebuilds from disk.
            state.reconciled = false;
            state.cache = None;
            return Err(e).context("metadata write failed after append");
        }

        if let Some(cache) = state.cache.as_mut() {
            cache.push(record.clone());
        }
        Ok(record)
    }

    // ── Context reconstruction ───────────────────────────────────────────────

    /// Read-only replay of the session, honoring the latest compaction
    /// overlay. Takes no lock.
    pub async fn build_context(&self, id: &str) -> anyhow::Result<Vec<Message>> {
        self.check_id(id)?;
        let dir = self.session_dir(id);
        if !dir.exists() {
            return Err(StoreError::NotFound(id.to_string()).into());
        }
        let records = read_records(&dir.join(SESSION_FILE));
        Ok(replay(&records))
    }

    /// Locked context build used at the start of a run: when the estimated
    /// context exceeds the window minus the reserve, run the compaction
    /// engine and persist the overlay before returning the rebuilt context.
    pub async fn build_context_for_run(
        &self,
        id: &str,
        summarizer: &dyn Summarizer,
    ) -> anyhow::Result<Vec<Message>> {
        self.check_id(id)?;
        let state = self.state(id).await;
        let mut state = state.lock().await;
        let dir = self.session_dir(id);
        let mut metadata = self.reconciled_metadata(&mut state, &dir, id)?;

        let records = match state.cache.as_ref() {
            Some(cached) => cached.clone(),
            None => {
                let records = read_records(&dir.join(SESSION_FILE));
                state.cache = Some(records.clone());
                records
            }
        };

        let settings = *self.settings.read().expect("settings lock poisoned");
        let context = replay(&records);
        let budget = settings
            .context_window
            .saturating_sub(settings.reserve_tokens);
        if !settings.compaction_enabled || context_tokens(&context) <= budget {
            return Ok(context);
        }

        let compaction_settings = CompactionSettings {
            keep_recent_tokens: settings.keep_recent_tokens,
            reserve_tokens: settings.reserve_tokens,
        };
        let Some(record) = plan_compaction(&records, &compaction_settings, summarizer).await?
        else {
            return Ok(context);
        };

        append_record(&dir.join(SESSION_FILE), &record)?;
        metadata.next_seq = record.seq() + 1;
        metadata.last_message_at = Utc::now();
        if let Err(e) = write_metadata(&dir, &metadata) {
            state.reconciled = false;
            state.cache = None;
            return Err(e).context("metadata write failed after compaction append");
        }

        let mut records = records;
        records.push(record);
        if let Some(cache) = state.cache.as_mut() {
            *cache = records.clone();
        }
        debug!(session = %id, "context compacted");
        Ok(replay(&records))
    }

    // ── Metadata updates ─────────────────────────────────────────────────────

    pub async fn record_turn_metrics(&self, id: &str, turn: TurnMetrics) -> anyhow::Result<()> {
        self.check_id(id)?;
        let state = self.state(id).await;
        let _guard = state.lock().await;
        let dir = self.session_dir(id);
        let mut metadata = read_metadata(&dir, id)?;
        metadata.metrics.total_turns += 1;
        metadata.metrics.total_tokens += turn.total_tokens;
        metadata.metrics.total_tool_calls += turn.tool_calls;
        metadata.metrics.total_duration_ms += turn.duration_ms;
        write_metadata(&dir, &metadata)
    }

    /// Generate and persist a session title from the first exchange.
    ///
    /// No-op when the session was already renamed. On generator failure or
    /// an empty result, falls back to a prefix of the user's text.
    pub async fn generate_title<F, Fut>(
        &self,
        id: &str,
        user_text: &str,
        assistant_text: &str,
        generate: F,
    ) -> anyhow::Result<Option<String>>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<String>>,
    {
        self.check_id(id)?;
        let state = self.state(id).await;
        let _guard = state.lock().await;
        let dir = self.session_dir(id);
        let mut metadata = read_metadata(&dir, id)?;
        if metadata.name != DEFAULT_SESSION_NAME {
            return Ok(None);
        }

        let prompt = title_prompt(user_text, assistant_text);
        let title = match generate(prompt).await {
            Ok(raw) => normalize_title(&raw).unwrap_or_else(|| title_fallback(user_text)),
            Err(e) => {
                warn!(session = %id, error = %e, "title generation failed; using fallback");
                title_fallback(user_text)
            }
        };
        metadata.name = title.clone();
        write_metadata(&dir, &metadata)?;
        Ok(Some(title))
    }

    fn reconciled_metadata(
        &self,
        state: &mut SessionState,
        dir: &Path,
        id: &str,
    ) -> anyhow::Result<SessionMetadata> {
        let mut metadata = read_metadata(dir, id)?;
        if !state.reconciled {
            let records = read_records(&dir.join(SESSION_FILE));
            let max_seq = records.iter().map(SessionRecord::seq).max().unwrap_or(0);
            let next = metadata.next_seq.max(max_seq + 1);
            if next != metadata.next_seq {
                metadata.next_seq = next;
                write_metadata(dir, &metadata)?;
            }
            state.cache = Some(records);
            state.reconciled = true;
        }
        Ok(metadata)
    }
}

// ─── Replay ───────────────────────────────────────────────────────────────────

fn context_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.text()).max(1)).sum()
}

/// Rebuild the message list, applying the latest compaction overlay: a
/// synthetic user message carries the summary, and every message below
/// `first_kept_seq` is skipped. Underlying records are never modified.
fn replay(records: &[SessionRecord]) -> Vec<Message> {
    let overlay = records.iter().rev().find_map(|r| match r {
        SessionRecord::Compaction {
            summary,
            first_kept_seq,
            ..
        } => Some((summary.clone(), *first_kept_seq)),
        _ => None,
    });

    let mut context = Vec::new();
    let first_kept = match overlay {
        Some((summary, first_kept_seq)) => {
            context.push(Message::user(format!(
                "The conversation history before this point was compacted into the \
                 following summary:\n<summary>\n{summary}\n</summary>"
            )));
            first_kept_seq
        }
        None => 0,
    };

    for record in records {
        if record.seq() < first_kept {
            continue;
        }
        if let Some(message) = record_to_message(record) {
            context.push(message);
        }
    }
    context
}

// ─── File helpers ─────────────────────────────────────────────────────────────

fn read_metadata(dir: &Path, id: &str) -> anyhow::Result<SessionMetadata> {
    let path = dir.join(METADATA_FILE);
    let text = std::fs::read_to_string(&path)
        .map_err(|_| StoreError::NotFound(id.to_string()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn write_metadata(dir: &Path, metadata: &SessionMetadata) -> anyhow::Result<()> {
    let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
    let text = serde_json::to_string_pretty(metadata)?;
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, dir.join(METADATA_FILE))?;
    Ok(())
}

/// Append one record as a single `write` of `json + \n`.
fn append_record(path: &Path, record: &SessionRecord) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Read every complete record. A trailing line without a terminating LF is
/// a torn write from a crash — discarded silently. Malformed complete lines
/// are skipped with a warning so one bad record cannot poison the session.
fn read_records(path: &Path) -> Vec<SessionRecord> {
    let Ok(data) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut records = Vec::new();
    for segment in data.split_inclusive('\n') {
        if !segment.ends_with('\n') {
            break;
        }
        let line = segment.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed record"),
        }
    }
    records
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
