use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use appforge_common::{
    AppStatus, CapabilityConfig, ContainerPhase, GenerationMetrics, Session, SessionStatus,
};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::emitter::SessionEmitter;
use super::protocol::ServerEvent;
use super::recovery::{RecoveredSession, recover_stuck_sessions};
use super::registry::ActiveSessions;
use super::rooms::Rooms;
use crate::capability::CapabilityEnv;
use crate::config::AppConfig;
use crate::container::{ContainerRegistry, LifecycleHandle};
use crate::errors::SessionError;
use crate::llm::LanguageModel;
use crate::orchestrator::{Capabilities, Orchestrator, RunOutcome, RunStatus};
use crate::sandbox::{LocalExecutor, SandboxFs};
use crate::store::DbHandle;
use crate::util::sanitize_client_message;

/// How long an aborted run gets to unwind before its task is dropped.
const ABORT_GRACE: Duration = Duration::from_secs(10);
/// How long to wait for the timeline writer after a run ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
/// How long shutdown waits for aborted runs to unregister.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Longest a session can watch its container for failure.
const CONTAINER_WATCH_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Builds the capability set for a model name.
pub type CapabilityFactory = Arc<dyn Fn(&str) -> Capabilities + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_sessions: usize,
    pub generation_timeout: Duration,
    pub stuck_threshold: Duration,
    pub stuck_sweep_interval: Duration,
    pub sandbox_root: PathBuf,
    pub templates_dir: PathBuf,
    pub default_model: String,
}

impl ManagerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_sessions: config.max_concurrent_sessions,
            generation_timeout: config.generation_timeout,
            stuck_threshold: config.stuck_threshold,
            stuck_sweep_interval: config.stuck_sweep_interval,
            sandbox_root: config.sandbox_root.clone(),
            templates_dir: config.templates_dir.clone(),
            default_model: config.default_model.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub session_id: Uuid,
    pub prompt: String,
    pub config: CapabilityConfig,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The orchestrator was told to stop. Also returned for repeat calls
    /// while it winds down.
    Stopping,
    NotActive,
}

/// How a supervised run ended.
enum Finish {
    Completed(GenerationMetrics),
    Stopped(Option<GenerationMetrics>),
    Failed {
        message: String,
        metrics: Option<GenerationMetrics>,
    },
}

impl From<RunOutcome> for Finish {
    fn from(outcome: RunOutcome) -> Self {
        match outcome.status {
            RunStatus::Completed => Finish::Completed(outcome.metrics),
            RunStatus::Aborted => Finish::Stopped(Some(outcome.metrics)),
            RunStatus::Failed(message) => Finish::Failed {
                message,
                metrics: Some(outcome.metrics),
            },
        }
    }
}

/// Owns every running generation in the process.
///
/// Each run is registered in [`ActiveSessions`], supervised by its own task
/// (timeout, panic, container failure), and reported to the session's room.
pub struct SessionManager {
    db: DbHandle,
    model: Arc<dyn LanguageModel>,
    settings: ManagerSettings,
    rooms: Arc<Rooms>,
    active: ActiveSessions,
    containers: Option<Arc<ContainerRegistry>>,
    capabilities: CapabilityFactory,
    forwarding: Arc<Mutex<HashSet<Uuid>>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(db: DbHandle, model: Arc<dyn LanguageModel>, settings: ManagerSettings) -> Self {
        let templates_dir = settings.templates_dir.clone();
        Self {
            db,
            model,
            settings,
            rooms: Arc::new(Rooms::new()),
            active: ActiveSessions::new(),
            containers: None,
            capabilities: Arc::new(move |model: &str| Capabilities::standard(model, &templates_dir)),
            forwarding: Arc::new(Mutex::new(HashSet::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_containers(mut self, containers: Arc<ContainerRegistry>) -> Self {
        self.containers = Some(containers);
        self
    }

    pub fn with_capabilities(mut self, factory: CapabilityFactory) -> Self {
        self.capabilities = factory;
        self
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn rooms(&self) -> &Arc<Rooms> {
        &self.rooms
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn is_active(&self, session_id: Uuid) -> bool {
        self.active.lookup(session_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn sandbox_dir(&self, session_id: Uuid) -> PathBuf {
        self.settings.sandbox_root.join(session_id.to_string())
    }

    // ── Generation ────────────────────────────────────────────────────

    /// Register and start a generation. Returns once the session is
    /// persisted; the run continues in the background.
    pub async fn start_generation(self: &Arc<Self>, request: GenerationRequest) -> Result<Uuid, SessionError> {
        let GenerationRequest {
            session_id,
            prompt,
            config,
            model,
        } = request;
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        config.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }
        if self.active.lookup(session_id).is_some() {
            return Err(SessionError::AlreadyActive(session_id));
        }
        if self.active.len() >= self.settings.max_sessions {
            return Err(SessionError::CapacityReached {
                limit: self.settings.max_sessions,
            });
        }

        let sandbox_dir = self.sandbox_dir(session_id);
        tokio::fs::create_dir_all(&sandbox_dir)
            .await
            .context("Failed to create sandbox directory")?;
        let lifecycle = match &self.containers {
            Some(containers) => Some(containers.ensure(session_id).await?),
            None => None,
        };

        let model_name = model.unwrap_or_else(|| self.settings.default_model.clone());
        let (emitter, writer) = SessionEmitter::spawn(session_id, self.rooms.clone(), self.db.clone());
        let env = CapabilityEnv {
            model: self.model.clone(),
            runner: Arc::new(LocalExecutor::new(&sandbox_dir)),
            sink: emitter.clone(),
            lifecycle: lifecycle.clone(),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            session_id,
            config.clone(),
            (self.capabilities)(&model_name),
            env,
        ));
        if let Err(e) = self.active.register(orchestrator.clone(), self.settings.max_sessions) {
            self.release_container(session_id).await;
            return Err(e);
        }

        let session = Session::new(session_id, &prompt, config, &model_name);
        if let Err(e) = self.db.call(move |db| db.create_session(&session)).await {
            self.active.unregister(session_id);
            self.release_container(session_id).await;
            return Err(e.into());
        }

        info!(session_id = %session_id, model = %model_name, "generation started");
        self.rooms.publish(session_id, &ServerEvent::SessionStarted { session_id });
        emitter.user_message(&prompt);
        if let Some(handle) = &lifecycle {
            self.forward_app_status(handle.clone());
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .supervise(orchestrator, emitter, writer, prompt, sandbox_dir, lifecycle)
                .await;
        });
        Ok(session_id)
    }

    /// Ask the session's orchestrator to stop. Calling it again, or for a
    /// session that is not running, is harmless.
    pub fn stop_generation(&self, session_id: Uuid) -> StopOutcome {
        match self.active.lookup(session_id) {
            Some(orchestrator) => {
                orchestrator.abort();
                StopOutcome::Stopping
            }
            None => StopOutcome::NotActive,
        }
    }

    async fn supervise(
        self: Arc<Self>,
        orchestrator: Arc<Orchestrator>,
        emitter: Arc<SessionEmitter>,
        writer: JoinHandle<()>,
        prompt: String,
        sandbox_dir: PathBuf,
        lifecycle: Option<LifecycleHandle>,
    ) {
        let session_id = orchestrator.session_id();
        let runner = orchestrator.clone();
        let mut run = tokio::spawn(async move { runner.run(&prompt, Some(sandbox_dir)).await });
        let timeout = self.settings.generation_timeout;

        let finish = tokio::select! {
            joined = &mut run => match joined {
                Ok(outcome) => Finish::from(outcome),
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "generation task crashed");
                    Finish::Failed {
                        message: "Generation crashed unexpectedly".into(),
                        metrics: None,
                    }
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(session_id = %session_id, timeout_secs = timeout.as_secs(), "generation timed out");
                orchestrator.abort();
                let metrics = wind_down(run).await.map(|o| o.metrics);
                Finish::Failed {
                    message: format!("Generation timed out after {} minutes", timeout.as_secs() / 60),
                    metrics,
                }
            }
            message = container_failure(lifecycle) => {
                warn!(session_id = %session_id, error = %message, "sandbox failed, aborting generation");
                orchestrator.abort();
                let metrics = wind_down(run).await.map(|o| o.metrics);
                Finish::Failed { message, metrics }
            }
        };

        self.release_container(session_id).await;
        self.active.unregister(session_id);
        drop(orchestrator);
        drop(emitter);
        if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
            warn!(session_id = %session_id, "timeline writer did not finish in time");
        }
        self.finish(session_id, finish).await;
    }

    /// Free the generation's container slot. A container the user started
    /// the app in is kept.
    async fn release_container(&self, session_id: Uuid) {
        if let Some(containers) = &self.containers
            && let Err(e) = containers.release(session_id).await
        {
            warn!(session_id = %session_id, error = %e, "failed to release generation container");
        }
    }

    async fn finish(&self, session_id: Uuid, finish: Finish) {
        let (status, error, metrics, event) = match finish {
            Finish::Completed(metrics) => {
                let event = ServerEvent::GenerationComplete {
                    session_id,
                    metrics: metrics.clone(),
                };
                (SessionStatus::Completed, None, Some(metrics), event)
            }
            Finish::Stopped(metrics) => (
                SessionStatus::Stopped,
                None,
                metrics,
                ServerEvent::Info {
                    message: "Generation stopped".into(),
                },
            ),
            Finish::Failed { message, metrics } => {
                let message = sanitize_client_message(&message);
                let event = ServerEvent::Error {
                    message: message.clone(),
                };
                (SessionStatus::Failed, Some(message), metrics, event)
            }
        };

        info!(session_id = %session_id, status = status.as_str(), "generation finished");
        let result = self
            .db
            .call(move |db| db.finish_session(session_id, status, error.as_deref(), metrics.as_ref()))
            .await;
        if let Err(e) = result {
            error!(session_id = %session_id, error = %format!("{:#}", e), "failed to record session outcome");
        }
        self.rooms.publish(session_id, &event);
    }

    // ── Files ─────────────────────────────────────────────────────────

    /// Write a client edit into the sandbox and mirror it to the store.
    pub async fn save_file(&self, session_id: Uuid, path: &str, content: &str) -> Result<(), SessionError> {
        let exists = self.db.call(move |db| db.get_session(session_id)).await?.is_some();
        if !exists {
            return Err(SessionError::NotFound(session_id));
        }
        let fs = SandboxFs::new(self.sandbox_dir(session_id));
        let relative = fs.relative(&fs.resolve(path)?);
        fs.write_file(&relative, content).await?;

        let (stored_path, stored_content) = (relative.clone(), content.to_string());
        self.db
            .call(move |db| db.upsert_file(session_id, &stored_path, &stored_content))
            .await?;
        self.rooms.publish(
            session_id,
            &ServerEvent::FileSaved {
                session_id,
                path: relative,
            },
        );
        Ok(())
    }

    // ── App lifecycle ─────────────────────────────────────────────────

    fn containers(&self) -> Result<&Arc<ContainerRegistry>, SessionError> {
        self.containers.as_ref().ok_or(SessionError::ContainersUnavailable)
    }

    pub async fn start_app(&self, session_id: Uuid) -> Result<AppStatus, SessionError> {
        let containers = self.containers()?;
        let status = containers.start_app(session_id).await?;
        if let Some(handle) = containers.get(session_id).await {
            self.forward_app_status(handle);
        }
        Ok(status)
    }

    pub async fn stop_app(&self, session_id: Uuid) -> Result<AppStatus, SessionError> {
        Ok(self.containers()?.stop_app(session_id).await?)
    }

    pub async fn restart_app(&self, session_id: Uuid) -> Result<AppStatus, SessionError> {
        let containers = self.containers()?;
        let status = containers.restart_app(session_id).await?;
        if let Some(handle) = containers.get(session_id).await {
            self.forward_app_status(handle);
        }
        Ok(status)
    }

    pub async fn app_status(&self, session_id: Uuid) -> Option<AppStatus> {
        match &self.containers {
            Some(containers) => containers.status(session_id).await,
            None => None,
        }
    }

    /// Destroy the session's container, if any, and remove its sandbox.
    pub async fn discard_sandbox(&self, session_id: Uuid) -> anyhow::Result<()> {
        if let Some(containers) = &self.containers {
            containers
                .destroy(session_id)
                .await
                .context("Failed to destroy container")?;
        }
        let dir = self.sandbox_dir(session_id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .context("Failed to remove sandbox directory")?;
        }
        self.rooms.close_if_idle(session_id);
        Ok(())
    }

    /// Relay a machine's status updates to the session's room until the
    /// machine reaches a terminal state. One relay per session.
    fn forward_app_status(&self, handle: LifecycleHandle) {
        let session_id = handle.session_id();
        if !lock_set(&self.forwarding).insert(session_id) {
            return;
        }
        let rooms = self.rooms.clone();
        let forwarding = self.forwarding.clone();
        let mut updates = handle.subscribe();
        rooms.publish(session_id, &ServerEvent::AppStatus(handle.status()));
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(status) => {
                        let terminal = status.phase.is_terminal();
                        rooms.publish(session_id, &ServerEvent::AppStatus(status));
                        if terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            lock_set(&forwarding).remove(&session_id);
        });
    }

    // ── Recovery and shutdown ─────────────────────────────────────────

    /// Fail every persisted session stuck in `generating` that no live
    /// orchestrator owns.
    pub async fn recover_stuck(&self) -> anyhow::Result<Vec<RecoveredSession>> {
        let mut running = HashSet::new();
        self.active.for_each(|id, _| {
            running.insert(id);
        });
        let threshold_ms = i64::try_from(self.settings.stuck_threshold.as_millis()).unwrap_or(i64::MAX);
        self.db
            .call(move |db| recover_stuck_sessions(db, threshold_ms, Utc::now(), &running))
            .await
    }

    /// Run `recover_stuck` now and then every sweep interval until shutdown.
    pub fn spawn_stuck_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.settings.stuck_sweep_interval);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match manager.recover_stuck().await {
                            Ok(recovered) if !recovered.is_empty() => {
                                info!(count = recovered.len(), "stuck-session sweep recovered sessions");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %format!("{:#}", e), "stuck-session sweep failed"),
                        }
                    }
                }
            }
        })
    }

    /// Abort every running generation, wait briefly for them to unwind, then
    /// destroy every container. New generations are refused from here on.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut count = 0usize;
        self.active.for_each(|_, orchestrator| {
            orchestrator.abort();
            count += 1;
        });
        if count > 0 {
            info!(count, "aborting active generations");
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.active.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.active.is_empty() {
            warn!(remaining = self.active.len(), "generations still active at shutdown");
        }
        if let Some(containers) = &self.containers {
            containers.shutdown().await;
        }
    }
}

fn lock_set(set: &Mutex<HashSet<Uuid>>) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Give an aborted run time to return its outcome; drop it otherwise.
async fn wind_down(mut run: JoinHandle<RunOutcome>) -> Option<RunOutcome> {
    match tokio::time::timeout(ABORT_GRACE, &mut run).await {
        Ok(Ok(outcome)) => Some(outcome),
        Ok(Err(_)) => None,
        Err(_) => {
            run.abort();
            None
        }
    }
}

/// Resolves with the error message once the session's container fails.
/// Never resolves without a container, or once the container is stopped.
async fn container_failure(lifecycle: Option<LifecycleHandle>) -> String {
    let Some(handle) = lifecycle else {
        return std::future::pending().await;
    };
    match handle
        .wait_for(|p| p == ContainerPhase::Failed, CONTAINER_WATCH_LIMIT)
        .await
    {
        Ok(status) => status
            .error
            .unwrap_or_else(|| "Sandbox container failed".to_string()),
        Err(_) => std::future::pending().await,
    }
}
