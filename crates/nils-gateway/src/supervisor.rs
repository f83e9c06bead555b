// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Runtime supervisor: owns the mutable runtime state and applies
//! configuration, tool, workflow, and cron changes atomically.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use async_trait::async_trait;
use nils_config::{AgentPaths, Config};
use nils_core::{ApiKeyResolver, RetrySettings};
use nils_log::{Level, Logger};
use nils_model::{get_oauth_api_key, AnthropicFactory, CredentialStore, EchoFactory, StreamFactory};
use nils_scheduler::{load_cron_jobs, CronDeps, CronJobConfig, CronService};
use nils_security::{CommandPolicy, PathPolicy};
use nils_store::{SessionStore, StoreSettings};
use nils_tools::builtin::builtin_tools;
use nils_tools::{load_cli_tools, ExecLimits, Tool, ToolContext, ToolRegistry};
use nils_workflow::{load_workflows, workflow_tools, EngineConfig, WorkflowEngine};

use crate::hub::WsHub;
use crate::prompt::PreparedSystemPrompt;
use crate::run::RunContext;

/// Config-derived state, swapped as one unit on every successful apply.
#[derive(Clone)]
struct Applied {
    config: Arc<Config>,
    factory: Arc<dyn StreamFactory>,
    prepared: Arc<PreparedSystemPrompt>,
    workflows: Arc<WorkflowEngine>,
    cron: Arc<CronService>,
    cron_jobs: Vec<CronJobConfig>,
    api_key: Option<String>,
}

struct ServerHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

/// Owns the long-lived runtime: the session store, the live tool registry
/// (contents replaced in place, never the owner), the WebSocket hub, and
/// the current [`Applied`] snapshot. `apply_from_disk` is the only writer
/// and serializes itself through one mutex.
pub struct Supervisor {
    pub paths: AgentPaths,
    pub hub: Arc<WsHub>,
    store: Arc<SessionStore>,
    registry: Arc<ToolRegistry>,
    logger: Arc<Logger>,
    auth: Arc<CredentialStore>,
    applied: RwLock<Applied>,
    version: AtomicU64,
    apply_lock: tokio::sync::Mutex<()>,
    server: tokio::sync::Mutex<Option<ServerHandle>>,
}

impl Supervisor {
    /// Load everything from disk and start the cron service. The HTTP
    /// server is bound separately via [`Supervisor::serve`].
    pub async fn init(paths: AgentPaths) -> anyhow::Result<Arc<Self>> {
        paths.ensure()?;
        let config = nils_config::load(&paths.config_file())?;
        let logger = Arc::new(build_logger(&config, &paths)?);
        let store = Arc::new(SessionStore::new(
            paths.sessions_dir(),
            store_settings(&config),
        ));
        let registry = Arc::new(ToolRegistry::new());
        let hub = Arc::new(WsHub::new());
        let auth = Arc::new(CredentialStore::load(&paths.auth_file()));

        let applied = build_applied(
            &paths, &config, &store, &registry, &logger, None,
        )
        .await?;
        applied
            .cron
            .start(applied.cron_jobs.clone())
            .await
            .context("starting cron service")?;
        install_tools(&registry, &applied, &paths)?;

        let supervisor = Arc::new(Self {
            paths,
            hub,
            store,
            registry,
            logger,
            auth,
            applied: RwLock::new(applied),
            version: AtomicU64::new(1),
            apply_lock: tokio::sync::Mutex::new(()),
            server: tokio::sync::Mutex::new(None),
        });
        // The prompt catalogs depend on the installed tool set; rebuild now
        // that the registry is populated.
        supervisor.rebuild_prepared_prompt();
        Ok(supervisor)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn store(&self) -> Arc<SessionStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    pub fn logger(&self) -> Arc<Logger> {
        self.logger.clone()
    }

    pub fn config(&self) -> Arc<Config> {
        self.applied.read().expect("state lock poisoned").config.clone()
    }

    pub fn cron(&self) -> Arc<CronService> {
        self.applied.read().expect("state lock poisoned").cron.clone()
    }

    pub fn workflows(&self) -> Arc<WorkflowEngine> {
        self.applied
            .read()
            .expect("state lock poisoned")
            .workflows
            .clone()
    }

    pub fn config_version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Snapshot everything one run needs. Taken when a job is dequeued, so
    /// a reload between runs applies cleanly and never mid-run.
    pub fn run_context(&self) -> RunContext {
        let applied = self.applied.read().expect("state lock poisoned");
        RunContext {
            store: self.store.clone(),
            registry: self.registry.clone(),
            factory: applied.factory.clone(),
            prepared: applied.prepared.clone(),
            logger: self.logger.clone(),
            max_iterations: applied.config.tools.max_iterations,
            limits: ExecLimits {
                timeout: Duration::from_secs(applied.config.tools.timeout),
                output_limit: applied.config.tools.output_limit,
            },
            retry: Some(retry_settings(&applied.config)),
            api_key: applied.api_key.clone(),
            api_key_resolver: Some(Arc::new(StoredKeyResolver {
                auth: self.auth.clone(),
                provider: applied.config.model.provider.clone(),
                env_key: applied.api_key.clone(),
            })),
        }
    }

    // ── Hot reload ───────────────────────────────────────────────────────────

    /// Atomically apply new on-disk state. Order: load, swap cron, rebind
    /// the server when its address changed, then commit tools + snapshot.
    /// Any failure rolls cron and server back and leaves the previous
    /// state in force.
    pub async fn apply_from_disk(self: &Arc<Self>, reason: &str) -> anyhow::Result<()> {
        let _guard = self.apply_lock.lock().await;
        let previous = self.applied.read().expect("state lock poisoned").clone();

        match self.apply_inner(&previous).await {
            Ok(()) => {
                let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
                self.logger.info(
                    "supervisor",
                    "config_reloaded",
                    json!({"reason": reason, "version": version}),
                );
                Ok(())
            }
            Err(e) => {
                self.logger.error(
                    "supervisor",
                    "config_reload_failed",
                    json!({"reason": reason, "message": e.to_string()}),
                );
                Err(e)
            }
        }
    }

    async fn apply_inner(self: &Arc<Self>, previous: &Applied) -> anyhow::Result<()> {
        // Stage 1: load and build everything side-effect-free.
        let config = nils_config::load(&self.paths.config_file())?;
        let next = build_applied(
            &self.paths,
            &config,
            &self.store,
            &self.registry,
            &self.logger,
            Some(previous),
        )
        .await?;

        // Stage 2: swap cron. The old service stops before the new starts
        // so a job is never scheduled twice.
        previous.cron.stop().await;
        if let Err(e) = next.cron.start(next.cron_jobs.clone()).await {
            warn!(error = %e, "new cron service failed to start; rolling back");
            let _ = previous.cron.start(previous.cron_jobs.clone()).await;
            return Err(e).context("starting new cron service");
        }

        // Stage 3: rebind the listener when the address changed.
        let new_addr = server_addr(&config);
        let old_addr = server_addr(&previous.config);
        if new_addr != old_addr {
            if let Err(e) = self.rebind(new_addr).await {
                next.cron.stop().await;
                let _ = previous.cron.start(previous.cron_jobs.clone()).await;
                return Err(e).context("rebinding server");
            }
        }

        // Stage 4: commit. Tool replacement failures roll everything back.
        let old_tools: Vec<Arc<dyn Tool>> =
            self.registry.snapshot().values().cloned().collect();
        if let Err(e) = install_tools(&self.registry, &next, &self.paths) {
            let _ = self.registry.replace_all(old_tools);
            next.cron.stop().await;
            let _ = previous.cron.start(previous.cron_jobs.clone()).await;
            if new_addr != old_addr {
                let _ = self.rebind(old_addr).await;
            }
            return Err(e).context("installing tool set");
        }

        self.store.update_settings(store_settings(&config));
        *self.applied.write().expect("state lock poisoned") = next;
        self.rebuild_prepared_prompt();
        Ok(())
    }

    fn rebuild_prepared_prompt(&self) {
        let mut applied = self.applied.write().expect("state lock poisoned");
        applied.prepared = Arc::new(PreparedSystemPrompt::build(
            &applied.config.system_prompt,
            &self.paths,
            &self.registry,
            &applied.workflows,
        ));
    }

    // ── HTTP server ──────────────────────────────────────────────────────────

    /// Bind the configured address and start serving. Returns the bound
    /// address (useful when the port is 0 in tests).
    pub async fn serve(self: &Arc<Self>) -> anyhow::Result<SocketAddr> {
        let addr = server_addr(&self.config());
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let handle = self.spawn_server(listener)?;
        let bound = handle.addr;
        *self.server.lock().await = Some(handle);
        info!(%bound, "gateway listening");
        Ok(bound)
    }

    fn spawn_server(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<ServerHandle> {
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let router = build_router(self.clone());
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!(error = %e, "server task exited with error");
            }
        });
        Ok(ServerHandle {
            addr,
            cancel,
            _task: task,
        })
    }

    /// Move the listener to a new address: prebind first, fall back to
    /// close-then-bind, and restore the old listener when all else fails.
    async fn rebind(self: &Arc<Self>, new_addr: SocketAddr) -> anyhow::Result<()> {
        let mut server = self.server.lock().await;
        let Some(current) = server.take() else {
            // Not serving yet (startup or tests): nothing to move.
            return Ok(());
        };
        if current.addr == new_addr {
            *server = Some(current);
            return Ok(());
        }

        match TcpListener::bind(new_addr).await {
            Ok(listener) => {
                let next = self.spawn_server(listener)?;
                current.cancel.cancel();
                info!(from = %current.addr, to = %next.addr, "server rebound");
                *server = Some(next);
                Ok(())
            }
            Err(first) => {
                // The new address may only be free once the old listener is
                // gone (e.g. same port, different host).
                current.cancel.cancel();
                tokio::time::sleep(Duration::from_millis(50)).await;
                match TcpListener::bind(new_addr).await {
                    Ok(listener) => {
                        let next = self.spawn_server(listener)?;
                        info!(to = %next.addr, "server rebound after close");
                        *server = Some(next);
                        Ok(())
                    }
                    Err(_) => {
                        let listener = TcpListener::bind(current.addr)
                            .await
                            .context("restoring previous listener")?;
                        *server = Some(self.spawn_server(listener)?);
                        Err(first).context("binding new server address; previous restored")
                    }
                }
            }
        }
    }

    /// Graceful shutdown: cancel every active run, close all sockets with
    /// 1001, stop cron, stop the listener.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.hub.close();
        self.cron().stop().await;
        if let Some(server) = self.server.lock().await.take() {
            server.cancel.cancel();
        }
        self.logger.info("supervisor", "shutdown", json!({}));
    }
}

/// Full router: REST surface plus the WebSocket endpoint, wrapped in the
/// identity middleware.
pub fn build_router(supervisor: Arc<Supervisor>) -> Router {
    use tower_http::{cors::CorsLayer, trace::TraceLayer};
    Router::new()
        .merge(crate::rest::router())
        .route("/ws", axum::routing::get(crate::ws::ws_handler))
        .layer(axum::middleware::from_fn_with_state(
            supervisor.clone(),
            crate::identity::identity_mw,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(supervisor)
}

/// Resolves the per-call API key: an OAuth credential from `auth.json`
/// wins, the environment key is the fallback. Actual token refresh is an
/// external concern; an expired credential is passed through unchanged.
struct StoredKeyResolver {
    auth: Arc<CredentialStore>,
    provider: String,
    env_key: Option<String>,
}

#[async_trait]
impl ApiKeyResolver for StoredKeyResolver {
    async fn resolve(&self) -> anyhow::Result<Option<String>> {
        let stored = get_oauth_api_key(&self.provider, &self.auth, |c| async { Ok(c) }).await?;
        Ok(stored.or_else(|| self.env_key.clone()))
    }
}

// ─── Builders ─────────────────────────────────────────────────────────────────

async fn build_applied(
    paths: &AgentPaths,
    config: &Config,
    store: &Arc<SessionStore>,
    registry: &Arc<ToolRegistry>,
    logger: &Arc<Logger>,
    _previous: Option<&Applied>,
) -> anyhow::Result<Applied> {
    let config = Arc::new(config.clone());
    let api_key = resolve_api_key(&config);
    let factory = build_factory(&config, api_key.clone())?;

    let workflow_specs = load_workflows(&paths.workflows_dir())?;
    let workflows = Arc::new(WorkflowEngine::new(
        workflow_specs,
        store.clone(),
        registry.clone(),
        factory.clone(),
        EngineConfig {
            max_iterations: config.tools.max_iterations,
            limits: ExecLimits {
                timeout: Duration::from_secs(config.tools.timeout),
                output_limit: config.tools.output_limit,
            },
            retry: Some(retry_settings(&config)),
            system_prompt: String::new(),
        },
    ));

    let cron_jobs = load_cron_jobs(&paths.cron_dir())?;
    let cron = CronService::new(CronDeps {
        store: store.clone(),
        registry: registry.clone(),
        factory: factory.clone(),
        logger: logger.clone(),
        default_max_iterations: config.tools.max_iterations,
        limits: ExecLimits {
            timeout: Duration::from_secs(config.tools.timeout),
            output_limit: config.tools.output_limit,
        },
        retry: Some(retry_settings(&config)),
        system_prompt: String::new(),
    });

    // Prompt catalogs are rebuilt after the tool set is installed.
    let prepared = Arc::new(PreparedSystemPrompt::default());

    Ok(Applied {
        config,
        factory,
        prepared,
        workflows,
        cron,
        cron_jobs,
        api_key,
    })
}

/// Build and install the complete tool set: builtins under the security
/// policy, CLI tools from the tools document, workflow adapters.
fn install_tools(
    registry: &Arc<ToolRegistry>,
    applied: &Applied,
    paths: &AgentPaths,
) -> anyhow::Result<()> {
    let security = &applied.config.security;
    let ctx = ToolContext::new(
        PathPolicy::new(&security.allowed_paths, &security.denied_paths),
        CommandPolicy::new(&security.blocked_commands),
        security.allowed_env.clone(),
    );

    let mut tools = builtin_tools(ctx.clone());
    let tools_file = paths.tools_file();
    if tools_file.is_file() {
        let text = std::fs::read_to_string(&tools_file)?;
        tools.extend(load_cli_tools(&text, ctx)?);
    }
    tools.extend(workflow_tools(&applied.workflows));
    registry.replace_all(tools)
}

fn build_logger(config: &Config, paths: &AgentPaths) -> anyhow::Result<Logger> {
    let level = Level::parse(&config.logging.level);
    let logger = Logger::new(level, config.logging.stdout);
    let file = config
        .logging
        .file
        .as_deref()
        .map(|f| paths.resolve(f))
        .unwrap_or_else(|| paths.log_file());
    logger.with_file(
        &file,
        config.logging.rotation.max_size_mb,
        config.logging.rotation.max_days,
    )
}

fn resolve_api_key(config: &Config) -> Option<String> {
    let var = config
        .model
        .api_key_env
        .clone()
        .unwrap_or_else(|| "ANTHROPIC_API_KEY".into());
    std::env::var(var).ok()
}

fn build_factory(
    config: &Config,
    api_key: Option<String>,
) -> anyhow::Result<Arc<dyn StreamFactory>> {
    match config.model.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicFactory::new(
            config.model.name.clone(),
            api_key,
        ))),
        "mock" => Ok(Arc::new(EchoFactory)),
        other => anyhow::bail!("unknown model provider: {other}"),
    }
}

fn store_settings(config: &Config) -> StoreSettings {
    StoreSettings {
        compaction_enabled: config.compaction.enabled,
        keep_recent_tokens: config.compaction.keep_recent_tokens as u64,
        reserve_tokens: config.compaction.reserve_tokens as u64,
        context_window: config.model.context_window as u64,
    }
}

fn retry_settings(config: &Config) -> RetrySettings {
    RetrySettings {
        base_delay_ms: config.retry.base_delay_ms,
        max_delay_ms: config.retry.max_delay_ms,
        max_retries: config.retry.max_retries,
        retryable_statuses: config.retry.retryable_statuses.clone(),
    }
}

fn server_addr(config: &Config) -> SocketAddr {
    format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], config.server.port)))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
