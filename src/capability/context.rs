use std::path::{Path, PathBuf};

use appforge_common::{CapabilityConfig, TokenUsage, ValidationError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::plan::ArchitecturePlan;

/// State threaded through one session's capability sequence.
///
/// Identity, configuration and the cancellation token are fixed at
/// construction. Capabilities only read the context; the orchestrator folds
/// their [`ContextUpdate`]s and usage back in.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    session_id: Uuid,
    prompt: String,
    config: CapabilityConfig,
    sandbox_dir: Option<PathBuf>,
    cancel: CancellationToken,
    usage: TokenUsage,
    plan: Option<ArchitecturePlan>,
    validation_errors: Option<Vec<ValidationError>>,
    fix_attempts: u8,
}

impl GenerationContext {
    pub fn new(
        session_id: Uuid,
        prompt: impl Into<String>,
        config: CapabilityConfig,
        sandbox_dir: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            prompt: prompt.into(),
            config,
            sandbox_dir,
            cancel,
            usage: TokenUsage::default(),
            plan: None,
            validation_errors: None,
            fix_attempts: 0,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn config(&self) -> &CapabilityConfig {
        &self.config
    }

    pub fn sandbox_dir(&self) -> Option<&Path> {
        self.sandbox_dir.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    pub fn plan(&self) -> Option<&ArchitecturePlan> {
        self.plan.as_ref()
    }

    /// Errors from the latest validation run. `None` until validation ran.
    pub fn validation_errors(&self) -> Option<&[ValidationError]> {
        self.validation_errors.as_deref()
    }

    pub fn has_validation_errors(&self) -> bool {
        self.validation_errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    pub fn fix_attempts(&self) -> u8 {
        self.fix_attempts
    }

    pub(crate) fn add_usage(&mut self, usage: &TokenUsage) {
        self.usage.accumulate(usage);
    }

    pub(crate) fn apply(&mut self, update: ContextUpdate) {
        if let Some(plan) = update.plan {
            self.plan = Some(plan);
        }
        if let Some(errors) = update.validation_errors {
            self.validation_errors = Some(errors);
        }
        if let Some(attempts) = update.fix_attempts {
            self.fix_attempts = attempts.max(self.fix_attempts);
        }
    }
}

/// The context fields a capability is allowed to change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUpdate {
    pub plan: Option<ArchitecturePlan>,
    pub validation_errors: Option<Vec<ValidationError>>,
    pub fix_attempts: Option<u8>,
}

impl ContextUpdate {
    pub fn is_empty(&self) -> bool {
        self.plan.is_none() && self.validation_errors.is_none() && self.fix_attempts.is_none()
    }
}
