//! Pipeline capabilities.
//!
//! Each capability performs one phase of a generation against a shared
//! [`GenerationContext`] and reports back through a [`CapabilityResult`].
//! Capabilities never mutate the context; the orchestrator merges the
//! result's [`ContextUpdate`] after each call.

pub mod context;
pub mod fixing;
pub mod generation;
pub mod plan;
pub mod planning;
pub mod template;
pub mod validation;

use std::path::Path;
use std::sync::Arc;

use appforge_common::TokenUsage;
use async_trait::async_trait;

use crate::container::LifecycleHandle;
use crate::errors::CapabilityError;
use crate::llm::{EventSink, LanguageModel};
use crate::sandbox::CommandRunner;

pub use context::{ContextUpdate, GenerationContext};
pub use fixing::ErrorFixingCapability;
pub use generation::{CodeGenerationCapability, ToolBudget};
pub use plan::ArchitecturePlan;
pub use planning::PlanningCapability;
pub use template::TemplateCapability;
pub use validation::ValidationCapability;

/// Collaborators a capability acts through. One set per session.
#[derive(Clone)]
pub struct CapabilityEnv {
    pub model: Arc<dyn LanguageModel>,
    /// Runs whitelisted commands in the session sandbox.
    pub runner: Arc<dyn CommandRunner>,
    pub sink: Arc<dyn EventSink>,
    /// The session's container machine, when one is provisioned. Validation
    /// reports fatal command failures to it.
    pub lifecycle: Option<LifecycleHandle>,
}

/// Output of one capability invocation.
#[derive(Debug, Default)]
pub struct CapabilityResult {
    pub success: bool,
    pub error: Option<CapabilityError>,
    pub usage: TokenUsage,
    pub update: ContextUpdate,
}

impl CapabilityResult {
    pub fn ok(usage: TokenUsage, update: ContextUpdate) -> Self {
        Self {
            success: true,
            error: None,
            usage,
            update,
        }
    }

    /// A failed invocation. Usage spent before the failure is still reported.
    pub fn failed(error: CapabilityError, usage: TokenUsage) -> Self {
        Self {
            success: false,
            error: Some(error),
            usage,
            update: ContextUpdate::default(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.error.as_ref().is_some_and(CapabilityError::is_aborted)
    }
}

/// One pipeline phase.
///
/// Real implementations live in this module's children; tests drive the
/// orchestrator with their own.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when the phase has nothing to do for this context.
    fn can_skip(&self, _ctx: &GenerationContext) -> bool {
        false
    }

    /// Fail fast when a field the phase needs is absent.
    fn validate_context(&self, ctx: &GenerationContext) -> Result<(), CapabilityError>;

    async fn execute(&self, ctx: &GenerationContext, env: &CapabilityEnv) -> CapabilityResult;
}

pub(crate) fn require_sandbox<'a>(
    capability: &'static str,
    ctx: &'a GenerationContext,
) -> Result<&'a Path, CapabilityError> {
    ctx.sandbox_dir().ok_or(CapabilityError::MissingContext {
        capability,
        field: "sandbox path",
    })
}
