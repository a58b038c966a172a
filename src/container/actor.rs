//! One actor task per session container.
//!
//! The actor owns the [`ContainerContext`] and is the only place it is
//! mutated. Work started by entry actions runs in spawned tasks that report
//! back by posting events into the actor's own mailbox. Tasks are scoped:
//! state tasks are cancelled on every exit, process tasks when the machine
//! leaves the serving states.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use appforge_common::{AppStatus, ContainerPhase};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::machine::{ContainerContext, ContainerEvent, PortPair, is_serving, transition};
use super::ports::PortAllocator;
use super::runtime::{ContainerRuntime, ContainerSpec, FRONTEND_CONTAINER_PORT};
use crate::errors::ContainerError;
use crate::parsers::strip_ansi;
use crate::sandbox::{CommandKind, SandboxConfig};

const HTTP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_BUFFER: usize = 64;

/// Shared collaborators for every lifecycle actor.
pub struct LifecycleDeps {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub ports: Arc<PortAllocator>,
    pub sandbox: SandboxConfig,
}

impl LifecycleDeps {
    fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.health_check_timeout)
    }
}

fn frontend_command() -> Vec<String> {
    let port = FRONTEND_CONTAINER_PORT.to_string();
    ["npx", "vite", "--host", "0.0.0.0", "--port", port.as_str(), "--strictPort"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn backend_command() -> Vec<String> {
    ["npx", "tsx", "watch", "server/index.ts"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Vite prints one of these once the dev server is listening.
pub fn is_framework_ready_line(line: &str) -> bool {
    let line = strip_ansi(line);
    line.contains("ready in") || line.contains("Local:")
}

/// Cloneable handle to a running lifecycle actor.
#[derive(Clone)]
pub struct LifecycleHandle {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<ContainerEvent>,
    status: watch::Receiver<AppStatus>,
    updates: broadcast::Sender<AppStatus>,
}

impl LifecycleHandle {
    /// Start an actor for `session_id` whose container mounts `sandbox_dir`.
    pub fn spawn(session_id: Uuid, sandbox_dir: PathBuf, deps: Arc<LifecycleDeps>) -> Self {
        let ctx = ContainerContext::new(session_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ctx.status());
        let (updates, _) = broadcast::channel(STATUS_BUFFER);

        let actor = LifecycleActor {
            ctx,
            sandbox_dir,
            deps,
            self_tx: tx.downgrade(),
            status_tx,
            updates: updates.clone(),
            state_cancel: CancellationToken::new(),
            state_tasks: Vec::new(),
            process_tasks: Vec::new(),
            readiness_deadline: None,
        };
        tokio::spawn(actor.run(rx));

        Self {
            session_id,
            tx,
            status,
            updates,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn send(&self, event: ContainerEvent) -> Result<(), ContainerError> {
        self.tx
            .send(event)
            .map_err(|_| ContainerError::MachineGone(self.session_id))
    }

    /// Latest published status.
    pub fn status(&self) -> AppStatus {
        self.status.borrow().clone()
    }

    pub fn phase(&self) -> ContainerPhase {
        self.status.borrow().phase
    }

    /// Every status the actor publishes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AppStatus> {
        self.updates.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until the published phase satisfies `pred`.
    pub async fn wait_for<F>(&self, pred: F, timeout: Duration) -> Result<AppStatus, ContainerError>
    where
        F: Fn(ContainerPhase) -> bool,
    {
        let mut rx = self.status.clone();
        let session_id = self.session_id;
        let wait = async move {
            let result = rx.wait_for(|s| pred(s.phase)).await.map(|s| AppStatus::clone(&s));
            result.map_err(|_| ContainerError::MachineGone(session_id))
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ContainerError::Timeout(timeout))?
    }
}

struct LifecycleActor {
    ctx: ContainerContext,
    sandbox_dir: PathBuf,
    deps: Arc<LifecycleDeps>,
    self_tx: mpsc::WeakUnboundedSender<ContainerEvent>,
    status_tx: watch::Sender<AppStatus>,
    updates: broadcast::Sender<AppStatus>,
    state_cancel: CancellationToken,
    state_tasks: Vec<JoinHandle<()>>,
    process_tasks: Vec<JoinHandle<()>>,
    readiness_deadline: Option<Instant>,
}

/// Post an event back into an actor's mailbox. Returns false once the
/// actor is gone.
fn post(tx: &mpsc::WeakUnboundedSender<ContainerEvent>, event: ContainerEvent) -> bool {
    match tx.upgrade() {
        Some(tx) => tx.send(event).is_ok(),
        None => false,
    }
}

impl LifecycleActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ContainerEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
            if self.ctx.phase == ContainerPhase::Stopped {
                break;
            }
        }
        if !self.ctx.phase.is_terminal() {
            debug!(session = %self.ctx.session_id, "all lifecycle handles dropped, tearing down");
            self.teardown().await;
        }
    }

    async fn handle(&mut self, event: ContainerEvent) {
        let prev = self.ctx.phase;
        let Some(next) = transition(prev, &event) else {
            warn!(
                session = %self.ctx.session_id,
                state = prev.as_str(),
                event = event.name(),
                "ignoring event not accepted in current state"
            );
            self.discard_orphaned(&event);
            return;
        };

        self.exit(prev, next).await;
        self.ctx.apply(&event);
        self.ctx.phase = next;
        match &event {
            ContainerEvent::Error(message) => {
                warn!(session = %self.ctx.session_id, from = prev.as_str(), error = %message, "container lifecycle failed")
            }
            _ => info!(
                session = %self.ctx.session_id,
                from = prev.as_str(),
                to = next.as_str(),
                event = event.name(),
                "container transition"
            ),
        }
        self.enter(next).await;
        self.publish();
    }

    /// A container created after its machine was destroyed must not leak.
    fn discard_orphaned(&self, event: &ContainerEvent) {
        if let ContainerEvent::Created {
            container_id,
            ports,
        } = event
        {
            let runtime = self.deps.runtime.clone();
            let allocator = self.deps.ports.clone();
            let id = container_id.clone();
            let ports = *ports;
            tokio::spawn(async move {
                if let Err(e) = runtime.destroy(&id).await {
                    warn!(container = %id, error = %e, "failed to remove orphaned container");
                }
                allocator.release(ports);
            });
        }
    }

    fn publish(&self) {
        let status = self.ctx.status();
        let _ = self.updates.send(status.clone());
        self.status_tx.send_replace(status);
    }

    async fn exit(&mut self, prev: ContainerPhase, next: ContainerPhase) {
        self.state_cancel.cancel();
        self.state_cancel = CancellationToken::new();
        for task in self.state_tasks.drain(..) {
            task.abort();
        }

        if is_serving(prev) && !is_serving(next) {
            for task in self.process_tasks.drain(..) {
                task.abort();
            }
            self.readiness_deadline = None;
        }

        let stopping = prev == ContainerPhase::Installing || is_serving(prev);
        if stopping
            && next == ContainerPhase::Ready
            && let Some(id) = &self.ctx.container_id
            && let Err(e) = self.deps.runtime.stop_processes(id).await
        {
            warn!(session = %self.ctx.session_id, error = %e, "failed to stop dev processes");
        }
    }

    async fn enter(&mut self, phase: ContainerPhase) {
        match phase {
            ContainerPhase::Creating => self.enter_creating(),
            ContainerPhase::Ready => {
                if self.ctx.auto_install {
                    self.ctx.auto_install = false;
                    post(&self.self_tx, ContainerEvent::InstallDeps);
                }
            }
            ContainerPhase::Installing => self.enter_installing(),
            ContainerPhase::Starting => self.enter_starting(),
            ContainerPhase::WaitingForVite => self.arm_readiness_timer(),
            ContainerPhase::CheckingHttpReady => self.enter_checking_http(),
            ContainerPhase::Stopped | ContainerPhase::Failed => self.teardown().await,
            ContainerPhase::Idle | ContainerPhase::Running => {}
        }
    }

    fn enter_creating(&mut self) {
        let ports = match self.deps.ports.allocate() {
            Ok(ports) => ports,
            Err(e) => {
                post(&self.self_tx, ContainerEvent::Error(e.to_string()));
                return;
            }
        };

        let mut env: Vec<String> = self
            .deps
            .sandbox
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();
        let spec = ContainerSpec {
            name: format!("appforge-{}", self.ctx.session_id),
            image: self.deps.sandbox.image.clone(),
            sandbox_dir: self.sandbox_dir.clone(),
            ports,
            memory_bytes: self.deps.sandbox.memory_bytes(),
            nano_cpus: Some(self.deps.sandbox.nano_cpus()),
            env,
        };

        // Not scoped to the state: an in-flight create must report back so
        // a late container can be removed.
        let runtime = self.deps.runtime.clone();
        let allocator = self.deps.ports.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            match runtime.create(&spec).await {
                Ok(container_id) => {
                    let created = ContainerEvent::Created {
                        container_id: container_id.clone(),
                        ports,
                    };
                    if !post(&tx, created) {
                        let _ = runtime.destroy(&container_id).await;
                        allocator.release(ports);
                    }
                }
                Err(e) => {
                    allocator.release(ports);
                    post(&tx, ContainerEvent::Error(e.to_string()));
                }
            }
        });
    }

    fn enter_installing(&mut self) {
        let Some(id) = self.ctx.container_id.clone() else {
            post(&self.self_tx, ContainerEvent::Error("no container to install into".into()));
            return;
        };
        let runtime = self.deps.runtime.clone();
        let tx = self.self_tx.clone();
        let cancel = self.state_cancel.clone();
        let has_prisma = self.sandbox_dir.join("prisma/schema.prisma").exists();

        self.state_tasks.push(tokio::spawn(async move {
            let timeout = CommandKind::Install.timeout();
            let mut steps = vec![argv(&["npm", "install"])];
            if has_prisma {
                steps.push(argv(&["npx", "prisma", "generate"]));
            }
            for step in steps {
                let label = step.join(" ");
                match runtime.exec(&id, step, timeout, &cancel).await {
                    Ok(out) if out.cancelled => return,
                    Ok(out) if out.success() => {}
                    Ok(out) => {
                        post(
                            &tx,
                            ContainerEvent::Error(format!("{} failed: {}", label, out.failure_summary())),
                        );
                        return;
                    }
                    Err(e) => {
                        post(&tx, ContainerEvent::Error(format!("{} failed: {}", label, e)));
                        return;
                    }
                }
            }
            post(&tx, ContainerEvent::Installed);
        }));
    }

    fn enter_starting(&mut self) {
        let Some(id) = self.ctx.container_id.clone() else {
            post(&self.self_tx, ContainerEvent::Error("no container to start".into()));
            return;
        };
        self.readiness_deadline = Some(Instant::now() + self.deps.readiness_timeout());
        self.arm_readiness_timer();

        let runtime = self.deps.runtime.clone();
        let tx = self.self_tx.clone();
        let session_id = self.ctx.session_id;
        self.process_tasks.push(tokio::spawn(async move {
            let mut frontend = match runtime.exec_stream(&id, frontend_command(), Vec::new()).await {
                Ok(rx) => rx,
                Err(e) => {
                    post(&tx, ContainerEvent::Error(format!("failed to start frontend: {}", e)));
                    return;
                }
            };
            let backend_env = vec![format!("PORT={}", super::runtime::BACKEND_CONTAINER_PORT)];
            let mut backend = match runtime.exec_stream(&id, backend_command(), backend_env).await {
                Ok(rx) => rx,
                Err(e) => {
                    post(&tx, ContainerEvent::Error(format!("failed to start backend: {}", e)));
                    return;
                }
            };
            post(&tx, ContainerEvent::ProcessesStarted);

            let mut announced = false;
            let mut backend_open = true;
            loop {
                tokio::select! {
                    line = frontend.recv() => {
                        let Some(line) = line else {
                            post(&tx, ContainerEvent::Error("frontend dev server exited".into()));
                            return;
                        };
                        debug!(session = %session_id, source = "frontend", "{}", line);
                        if !announced && is_framework_ready_line(&line) {
                            announced = true;
                            post(&tx, ContainerEvent::FrameworkReady);
                        }
                    }
                    line = backend.recv(), if backend_open => match line {
                        Some(line) => debug!(session = %session_id, source = "backend", "{}", line),
                        None => {
                            backend_open = false;
                            warn!(session = %session_id, "backend dev server output closed");
                        }
                    },
                }
            }
        }));
    }

    /// Fail the machine if the dev servers are not up before the deadline.
    fn arm_readiness_timer(&mut self) {
        let Some(deadline) = self.readiness_deadline else {
            return;
        };
        let tx = self.self_tx.clone();
        let timeout = self.deps.readiness_timeout();
        self.state_tasks.push(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            post(
                &tx,
                ContainerEvent::Error(format!("dev server not ready after {:?}", timeout)),
            );
        }));
    }

    fn enter_checking_http(&mut self) {
        let Some(PortPair { frontend, .. }) = self.ctx.ports else {
            post(&self.self_tx, ContainerEvent::Error("no frontend port bound".into()));
            return;
        };
        let deadline = self
            .readiness_deadline
            .unwrap_or_else(|| Instant::now() + self.deps.readiness_timeout());
        let timeout = self.deps.readiness_timeout();
        let runtime = self.deps.runtime.clone();
        let tx = self.self_tx.clone();

        self.state_tasks.push(tokio::spawn(async move {
            loop {
                if runtime.http_ready(frontend).await {
                    post(&tx, ContainerEvent::HttpReady);
                    return;
                }
                if Instant::now() >= deadline {
                    post(
                        &tx,
                        ContainerEvent::Error(format!(
                            "frontend did not answer HTTP within {:?}",
                            timeout
                        )),
                    );
                    return;
                }
                tokio::time::sleep(HTTP_POLL_INTERVAL).await;
            }
        }));
    }

    /// Stop everything, remove the container and give its ports back.
    async fn teardown(&mut self) {
        self.state_cancel.cancel();
        for task in self.state_tasks.drain(..).chain(self.process_tasks.drain(..)) {
            task.abort();
        }
        self.readiness_deadline = None;

        if let Some(id) = &self.ctx.container_id
            && let Err(e) = self.deps.runtime.destroy(id).await
        {
            warn!(session = %self.ctx.session_id, container = %id, error = %e, "failed to remove container");
        }
        if let Some(ports) = self.ctx.ports.take() {
            self.deps.ports.release(ports);
        }
    }
}
