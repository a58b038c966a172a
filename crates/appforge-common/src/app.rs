use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Detailed lifecycle state of a session's sandbox container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ContainerPhase {
    #[default]
    Idle,
    Creating,
    Ready,
    Installing,
    Starting,
    WaitingForVite,
    CheckingHttpReady,
    Running,
    Stopped,
    Failed,
}

impl ContainerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::WaitingForVite => "waitingForVite",
            Self::CheckingHttpReady => "checkingHttpReady",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Coarse status shown to clients. The three readiness sub-states all
    /// collapse into `STARTING`.
    pub fn coarse(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Creating => "CREATING",
            Self::Ready => "READY",
            Self::Installing => "INSTALLING",
            Self::Starting | Self::WaitingForVite | Self::CheckingHttpReady => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for ContainerPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "creating" => Ok(Self::Creating),
            "ready" => Ok(Self::Ready),
            "installing" => Ok(Self::Installing),
            "starting" => Ok(Self::Starting),
            "waitingForVite" => Ok(Self::WaitingForVite),
            "checkingHttpReady" => Ok(Self::CheckingHttpReady),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid container phase: {}", s)),
        }
    }
}

/// Snapshot of a sandbox container, pushed to subscribers on every state entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    pub session_id: Uuid,
    pub phase: ContainerPhase,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppStatus {
    pub fn new(session_id: Uuid, phase: ContainerPhase) -> Self {
        Self {
            session_id,
            phase,
            status: phase.coarse().to_string(),
            container_id: None,
            frontend_port: None,
            backend_port: None,
            error: None,
        }
    }

    /// Address of the frontend dev server once ports are allocated.
    pub fn frontend_url(&self) -> Option<String> {
        self.frontend_port.map(|p| format!("http://localhost:{}", p))
    }
}
