// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nils_core::{run_agent_loop, AgentEvent, LoopOptions, RetrySettings};
use nils_log::Logger;
use nils_model::StreamFactory;
use nils_store::{
    message_to_append_input, AppendInput, CreateSessionOptions, RecordBlock, RecordRole,
    SessionSource, SessionStore, TurnMetrics,
};
use nils_tools::{ExecLimits, ToolRegistry};

use crate::config::CronJobConfig;
use crate::scope::scoped_registry;

const ERROR_SNIPPET_LEN: usize = 200;

/// Everything a job run needs, shared across the service.
pub struct CronDeps {
    pub store: Arc<SessionStore>,
    pub registry: Arc<ToolRegistry>,
    pub factory: Arc<dyn StreamFactory>,
    pub logger: Arc<Logger>,
    pub default_max_iterations: u32,
    pub limits: ExecLimits,
    pub retry: Option<RetrySettings>,
    pub system_prompt: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobStatus {
    pub id: String,
    pub schedule: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    /// "ok" or "error" after the first run
    pub last_status: Option<String>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct JobState {
    last_run_at: Option<DateTime<Utc>>,
    last_status: Option<String>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

struct JobEntry {
    config: CronJobConfig,
    enabled: bool,
    state: Arc<Mutex<JobState>>,
    cancel: CancellationToken,
}

/// The cron service. `start` installs one runtime entry per job and spawns
/// a runner task for each enabled one; the runner awaits each firing to
/// completion before computing the next occurrence, so a job can never
/// overlap itself.
pub struct CronService {
    deps: Arc<CronDeps>,
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl CronService {
    pub fn new(deps: CronDeps) -> Arc<Self> {
        Arc::new(Self {
            deps: Arc::new(deps),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the installed job set. The previous schedule stops first.
    pub async fn start(self: &Arc<Self>, configs: Vec<CronJobConfig>) -> anyhow::Result<()> {
        self.stop().await;
        let mut jobs = self.jobs.lock().await;
        for config in configs {
            // Unparseable schedules were dropped at load time; re-check so a
            // directly constructed config cannot wedge the service.
            if config.parsed_schedule().is_err() {
                warn!(job = %config.id, "skipping job with invalid schedule");
                continue;
            }
            if let Some(tz) = config.timezone.as_deref() {
                if !tz.eq_ignore_ascii_case("utc") {
                    warn!(job = %config.id, timezone = tz, "non-UTC timezones are not supported; using UTC");
                }
            }
            let entry = JobEntry {
                enabled: config.enabled,
                state: Arc::new(Mutex::new(JobState::default())),
                cancel: CancellationToken::new(),
                config,
            };
            if entry.enabled {
                self.spawn_runner(&entry);
            }
            jobs.insert(entry.config.id.clone(), entry);
        }
        info!(jobs = jobs.len(), "cron service started");
        Ok(())
    }

    pub async fn stop(&self) {
        let mut jobs = self.jobs.lock().await;
        for entry in jobs.values() {
            entry.cancel.cancel();
        }
        jobs.clear();
    }

    pub async fn pause(&self, id: &str) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown cron job: {id}"))?;
        if entry.enabled {
            entry.cancel.cancel();
            entry.cancel = CancellationToken::new();
            entry.enabled = false;
            info!(job = id, "cron job paused");
        }
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>, id: &str) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown cron job: {id}"))?;
        if !entry.enabled {
            entry.enabled = true;
            self.spawn_runner(entry);
            info!(job = id, "cron job resumed");
        }
        Ok(())
    }

    pub async fn status(&self) -> Vec<CronJobStatus> {
        let jobs = self.jobs.lock().await;
        let mut out = Vec::with_capacity(jobs.len());
        for entry in jobs.values() {
            let state = entry.state.lock().await;
            let next_run_at = entry
                .enabled
                .then(|| {
                    entry
                        .config
                        .parsed_schedule()
                        .ok()
                        .and_then(|s| s.upcoming(Utc).next())
                })
                .flatten();
            out.push(CronJobStatus {
                id: entry.config.id.clone(),
                schedule: entry.config.schedule.clone(),
                enabled: entry.enabled,
                last_run_at: state.last_run_at,
                last_status: state.last_status.clone(),
                consecutive_failures: state.consecutive_failures,
                last_error: state.last_error.clone(),
                next_run_at,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn spawn_runner(&self, entry: &JobEntry) {
        let deps = self.deps.clone();
        let config = entry.config.clone();
        let state = entry.state.clone();
        let cancel = entry.cancel.clone();
        tokio::spawn(async move {
            let Ok(schedule) = config.parsed_schedule() else {
                return;
            };
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    debug!(job = %config.id, "schedule has no future firings");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                // The run is awaited: the next occurrence is only computed
                // after this firing completes, so jobs never overlap.
                run_job_once(&deps, &config, &state).await;
            }
        });
    }
}

/// Fire one job: isolated session, scoped tools, errors recorded but never
/// propagated — a failing job must not take the scheduler down.
pub(crate) async fn run_job_once(
    deps: &CronDeps,
    config: &CronJobConfig,
    state: &Arc<Mutex<JobState>>,
) -> bool {
    let fired_at = Utc::now();
    let result = execute_job(deps, config).await;

    let mut state = state.lock().await;
    state.last_run_at = Some(fired_at);
    match result {
        Ok(session_id) => {
            state.last_status = Some("ok".into());
            state.consecutive_failures = 0;
            state.last_error = None;
            deps.logger.info(
                "cron",
                "job_completed",
                json!({"jobId": config.id, "sessionId": session_id}),
            );
            true
        }
        Err(e) => {
            state.last_status = Some("error".into());
            state.consecutive_failures += 1;
            let snippet: String = e.to_string().chars().take(ERROR_SNIPPET_LEN).collect();
            state.last_error = Some(snippet.clone());
            deps.logger.error(
                "cron",
                "job_failed",
                json!({
                    "jobId": config.id,
                    "consecutiveFailures": state.consecutive_failures,
                    "message": snippet,
                }),
            );
            false
        }
    }
}

async fn execute_job(deps: &CronDeps, config: &CronJobConfig) -> anyhow::Result<String> {
    let session = deps
        .store
        .create(CreateSessionOptions {
            name: Some(format!(
                "[cron] {} - {}",
                config.id,
                Utc::now().format("%Y-%m-%d %H:%M")
            )),
            model: deps.factory.model().to_string(),
            source: SessionSource::Cron,
            cron_job_id: Some(config.id.clone()),
            system_prompt_override: None,
        })
        .await?;

    deps.store
        .append_message(
            &session.id,
            AppendInput {
                role: RecordRole::User,
                content: vec![RecordBlock::Text {
                    text: config.prompt.clone(),
                }],
                is_error: None,
                tool_call_id: None,
                tool_name: None,
            },
        )
        .await?;

    let scoped = scoped_registry(&deps.registry, config.policy.as_ref());
    let max_iterations = config
        .policy
        .as_ref()
        .and_then(|p| p.max_iterations)
        .unwrap_or(deps.default_max_iterations);

    let context = deps.store.build_context(&session.id).await?;
    let boundary = context.len();

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let opts = LoopOptions {
        max_iterations,
        system_prompt: deps.system_prompt.clone(),
        retry: deps.retry.clone(),
        limits: deps.limits,
        session_id: Some(session.id.clone()),
        ..LoopOptions::default()
    };
    let outcome = run_agent_loop(
        deps.factory.as_ref(),
        &scoped,
        context,
        &opts,
        &CancellationToken::new(),
        &tx,
    )
    .await;
    drop(tx);
    let _ = drain.await;
    let outcome = outcome?;

    for message in &outcome.messages[boundary..] {
        deps.store
            .append_message(&session.id, message_to_append_input(message))
            .await?;
    }
    deps.store
        .record_turn_metrics(
            &session.id,
            TurnMetrics {
                duration_ms: outcome.stats.duration_ms,
                input_tokens: outcome.stats.input_tokens,
                output_tokens: outcome.stats.output_tokens,
                tool_calls: outcome.stats.tool_calls,
                total_tokens: outcome.stats.total_tokens,
            },
        )
        .await?;
    Ok(session.id)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use nils_model::ScriptedFactory;
    use nils_store::StoreSettings;

    use super::*;

    fn deps(tmp: &std::path::Path, factory: ScriptedFactory) -> CronDeps {
        CronDeps {
            store: Arc::new(SessionStore::new(tmp, StoreSettings::default())),
            registry: Arc::new(ToolRegistry::new()),
            factory: Arc::new(factory),
            logger: Arc::new(Logger::disabled()),
            default_max_iterations: 5,
            limits: ExecLimits::default(),
            retry: None,
            system_prompt: String::new(),
        }
    }

    fn job(id: &str) -> CronJobConfig {
        CronJobConfig {
            id: id.into(),
            schedule: "0 9 * * *".into(),
            prompt: "daily report".into(),
            enabled: true,
            timezone: None,
            policy: None,
        }
    }

    #[tokio::test]
    async fn firing_creates_an_isolated_cron_session() {
        let tmp = tempfile::tempdir().unwrap();
        let d = deps(tmp.path(), ScriptedFactory::always_text("report ready"));
        let state = Arc::new(Mutex::new(JobState::default()));

        assert!(run_job_once(&d, &job("daily"), &state).await);

        let sessions = d.store.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].name.starts_with("[cron] daily - "));
        assert_eq!(sessions[0].source, SessionSource::Cron);

        let meta = d.store.get(&sessions[0].id).await.unwrap();
        assert_eq!(meta.cron_job_id.as_deref(), Some("daily"));
        let ctx = d.store.build_context(&sessions[0].id).await.unwrap();
        assert_eq!(ctx[0].text(), "daily report");
        assert_eq!(ctx[1].text(), "report ready");

        let s = state.lock().await;
        assert_eq!(s.last_status.as_deref(), Some("ok"));
        assert_eq!(s.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failures_count_up_and_success_resets() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new(vec![ScriptedFactory::text_script("recovered")])
            .with_failures(vec![500, 500]);
        let d = deps(tmp.path(), factory);
        let state = Arc::new(Mutex::new(JobState::default()));
        let config = job("flaky");

        assert!(!run_job_once(&d, &config, &state).await);
        assert!(!run_job_once(&d, &config, &state).await);
        {
            let s = state.lock().await;
            assert_eq!(s.consecutive_failures, 2);
            assert_eq!(s.last_status.as_deref(), Some("error"));
            assert!(s.last_error.as_deref().unwrap().len() <= ERROR_SNIPPET_LEN);
        }

        assert!(run_job_once(&d, &config, &state).await);
        let s = state.lock().await;
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.last_error.is_none());
    }

    #[tokio::test]
    async fn start_pause_resume_status() {
        let tmp = tempfile::tempdir().unwrap();
        let service = CronService::new(deps(tmp.path(), ScriptedFactory::always_text("x")));
        service
            .start(vec![job("a"), {
                let mut b = job("b");
                b.enabled = false;
                b
            }])
            .await
            .unwrap();

        let status = service.status().await;
        assert_eq!(status.len(), 2);
        let a = status.iter().find(|s| s.id == "a").unwrap();
        assert!(a.enabled);
        assert!(a.next_run_at.is_some());
        let b = status.iter().find(|s| s.id == "b").unwrap();
        assert!(!b.enabled);
        assert!(b.next_run_at.is_none());

        service.pause("a").await.unwrap();
        let status = service.status().await;
        assert!(!status.iter().find(|s| s.id == "a").unwrap().enabled);

        service.resume("a").await.unwrap();
        let status = service.status().await;
        assert!(status.iter().find(|s| s.id == "a").unwrap().enabled);

        assert!(service.pause("ghost").await.is_err());
        service.stop().await;
        assert!(service.status().await.is_empty());
    }
}
