//! Typed error hierarchy for appforge.
//!
//! One enum per subsystem:
//! - `ConfigError` for start-up configuration
//! - `ExecError` and `SandboxFsError` for sandbox commands and files
//! - `ContainerError` for the container lifecycle
//! - `ModelError` for language-model providers
//! - `CapabilityError` for pipeline phases
//! - `SessionError` for the session manager

use std::path::PathBuf;
use std::time::Duration;

use appforge_common::ConfigValidationError;
use thiserror::Error;
use uuid::Uuid;

/// Fatal start-up configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No LLM provider configured: set ANTHROPIC_API_KEY or OPENAI_API_KEY")]
    NoProvider,

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Errors raised before or while running a sandbox command. A command that
/// runs and exits non-zero is not an error at this level.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Empty command")]
    Empty,

    #[error("Command '{0}' is not allowed in the sandbox")]
    NotAllowed(String),

    #[error("Command contains forbidden shell syntax '{0}'")]
    ForbiddenSyntax(String),

    #[error("Unterminated quote in command")]
    UnterminatedQuote,

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read command output: {0}")]
    Output(#[source] std::io::Error),

    #[error("Container exec failed: {0}")]
    Container(String),
}

/// Errors from sandbox file access.
#[derive(Debug, Error)]
pub enum SandboxFsError {
    #[error("Path is empty")]
    Empty,

    #[error("Path must be relative to the project root: {0}")]
    Absolute(String),

    #[error("Path escapes the project root: {0}")]
    Escape(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from container provisioning and lifecycle control.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container limit reached ({limit} active)")]
    CapacityReached { limit: usize },

    #[error("Session {0} already has a container")]
    AlreadyExists(Uuid),

    #[error("No container for session {0}")]
    NotFound(Uuid),

    #[error("No free port pair in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("Lifecycle machine for session {0} is no longer running")]
    MachineGone(Uuid),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from language-model providers.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("No provider configured for model '{0}'")]
    NoProvider(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Malformed stream event: {0}")]
    Decode(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ModelError {
    /// Rate limits and server errors are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// Failures of a single pipeline phase.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{capability} requires {field} in the generation context")]
    MissingContext {
        capability: &'static str,
        field: &'static str,
    },

    #[error("Language model failure: {0}")]
    LlmFailure(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Command '{command}' failed: {message}")]
    CommandFailure { command: String, message: String },

    #[error("The model did not call the create_plan tool")]
    PlanningToolNotInvoked,

    #[error("The generated plan has no models, routes or components")]
    EmptyPlan,

    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("Failed to copy template: {0}")]
    TemplateCopy(String),

    #[error("Generation aborted")]
    Aborted,
}

impl CapabilityError {
    /// Stable taxonomy label used in logs and stage events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingContext { .. } => "missingContext",
            Self::LlmFailure(_) => "llmFailure",
            Self::ToolExecution(_) => "toolExecutionFailure",
            Self::CommandFailure { .. } => "commandFailure",
            Self::PlanningToolNotInvoked | Self::EmptyPlan => "planningFailure",
            Self::UnknownTemplate(_) | Self::TemplateCopy(_) => "templateFailure",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl From<ModelError> for CapabilityError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Cancelled => Self::Aborted,
            other => Self::LlmFailure(other.to_string()),
        }
    }
}

/// Errors returned by the session manager to protocol handlers.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} is already generating")]
    AlreadyActive(Uuid),

    #[error("Too many concurrent generations (limit {limit})")]
    CapacityReached { limit: usize },

    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),

    #[error("Session {0} not found")]
    NotFound(Uuid),

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Container runtime is not available")]
    ContainersUnavailable,

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Sandbox(#[from] SandboxFsError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
