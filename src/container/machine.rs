//! Pure transition table for the container lifecycle.
//!
//! ```text
//! idle ─CREATE─▶ creating ─created─▶ ready ─INSTALL_DEPS─▶ installing
//!                                     ▲                        │ installed
//!                                     │ STOP_SERVER            ▼
//! running ◀─http ready─ checkingHttpReady ◀─framework ready─ starting
//!                              ▲                                │ processes started
//!                              └────── framework ready ── waitingForVite
//!
//! any state ─DESTROY─▶ stopped        any non-terminal state ─ERROR─▶ failed
//! ```
//!
//! `transition` has no side effects. The actor in `actor.rs` owns the
//! context, applies event payloads and runs entry/exit actions.

use appforge_common::{AppStatus, ContainerPhase};
use uuid::Uuid;

/// Host ports bound to the frontend and backend dev servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub frontend: u16,
    pub backend: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// Provision a container. With `auto_install`, dependency install starts
    /// as soon as the container is ready.
    Create { auto_install: bool },
    Created { container_id: String, ports: PortPair },
    InstallDeps,
    Installed,
    ProcessesStarted,
    FrameworkReady,
    HttpReady,
    StopServer,
    Destroy,
    Error(String),
}

impl ContainerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "CREATE",
            Self::Created { .. } => "CREATED",
            Self::InstallDeps => "INSTALL_DEPS",
            Self::Installed => "INSTALLED",
            Self::ProcessesStarted => "PROCESSES_STARTED",
            Self::FrameworkReady => "FRAMEWORK_READY",
            Self::HttpReady => "HTTP_READY",
            Self::StopServer => "STOP_SERVER",
            Self::Destroy => "DESTROY",
            Self::Error(_) => "ERROR",
        }
    }
}

/// States in which the dev processes are (or are being brought) up.
pub fn is_serving(phase: ContainerPhase) -> bool {
    matches!(
        phase,
        ContainerPhase::Starting
            | ContainerPhase::WaitingForVite
            | ContainerPhase::CheckingHttpReady
            | ContainerPhase::Running
    )
}

/// Next state for `event` in `state`, or `None` when the event is not
/// accepted there.
pub fn transition(state: ContainerPhase, event: &ContainerEvent) -> Option<ContainerPhase> {
    use ContainerEvent as E;
    use ContainerPhase as S;

    match (state, event) {
        (S::Stopped, E::Destroy) => None,
        (_, E::Destroy) => Some(S::Stopped),

        (s, E::Error(_)) if !s.is_terminal() => Some(S::Failed),

        (S::Idle, E::Create { .. }) => Some(S::Creating),
        (S::Creating, E::Created { .. }) => Some(S::Ready),
        (S::Ready, E::InstallDeps) => Some(S::Installing),
        (S::Installing, E::Installed) => Some(S::Starting),
        (S::Starting, E::ProcessesStarted) => Some(S::WaitingForVite),
        (S::Starting | S::WaitingForVite, E::FrameworkReady) => Some(S::CheckingHttpReady),
        (S::CheckingHttpReady, E::HttpReady) => Some(S::Running),
        (s, E::StopServer) if s == S::Installing || is_serving(s) => Some(S::Ready),

        _ => None,
    }
}

/// Mutable state of one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerContext {
    pub session_id: Uuid,
    pub phase: ContainerPhase,
    pub container_id: Option<String>,
    pub ports: Option<PortPair>,
    pub auto_install: bool,
    pub last_error: Option<String>,
}

impl ContainerContext {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            phase: ContainerPhase::Idle,
            container_id: None,
            ports: None,
            auto_install: false,
            last_error: None,
        }
    }

    /// Copy event payloads into the context. Called only for accepted events.
    pub fn apply(&mut self, event: &ContainerEvent) {
        match event {
            ContainerEvent::Create { auto_install } => self.auto_install = *auto_install,
            ContainerEvent::Created {
                container_id,
                ports,
            } => {
                self.container_id = Some(container_id.clone());
                self.ports = Some(*ports);
            }
            ContainerEvent::Error(message) => self.last_error = Some(message.clone()),
            ContainerEvent::InstallDeps => self.last_error = None,
            _ => {}
        }
    }

    pub fn status(&self) -> AppStatus {
        let mut status = AppStatus::new(self.session_id, self.phase);
        status.container_id = self.container_id.clone();
        status.frontend_port = self.ports.map(|p| p.frontend);
        status.backend_port = self.ports.map(|p| p.backend);
        status.error = self.last_error.clone();
        status
    }
}
