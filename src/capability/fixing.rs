use appforge_common::TokenUsage;
use async_trait::async_trait;
use tracing::info;

use super::{Capability, CapabilityEnv, CapabilityResult, ContextUpdate, GenerationContext, require_sandbox};
use crate::errors::CapabilityError;
use crate::llm::{ModelRequest, SandboxTools, ToolSet, run_tool_loop};
use crate::prompts::{PromptBuilder, PromptInputs, fix_user_prompt};
use crate::sandbox::SandboxFs;

const NAME: &str = "errorFixing";

pub const DEFAULT_FIX_TOOL_CALLS: u32 = 30;

/// One bounded fixing call against the latest validation errors. Does not
/// re-validate; the orchestrator runs validation again afterwards.
pub struct ErrorFixingCapability {
    model: String,
    max_tool_calls: u32,
}

impl ErrorFixingCapability {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tool_calls: DEFAULT_FIX_TOOL_CALLS,
        }
    }

    pub fn with_max_tool_calls(mut self, max_tool_calls: u32) -> Self {
        self.max_tool_calls = max_tool_calls;
        self
    }
}

#[async_trait]
impl Capability for ErrorFixingCapability {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_skip(&self, ctx: &GenerationContext) -> bool {
        !ctx.has_validation_errors()
    }

    fn validate_context(&self, ctx: &GenerationContext) -> Result<(), CapabilityError> {
        require_sandbox(NAME, ctx)?;
        if !ctx.has_validation_errors() {
            return Err(CapabilityError::MissingContext {
                capability: NAME,
                field: "validation errors",
            });
        }
        Ok(())
    }

    async fn execute(&self, ctx: &GenerationContext, env: &CapabilityEnv) -> CapabilityResult {
        let (sandbox, errors) = match (require_sandbox(NAME, ctx), ctx.validation_errors()) {
            (Ok(dir), Some(errors)) if !errors.is_empty() => (dir, errors),
            (Err(e), _) => return CapabilityResult::failed(e, TokenUsage::default()),
            _ => {
                return CapabilityResult::failed(
                    CapabilityError::MissingContext {
                        capability: NAME,
                        field: "validation errors",
                    },
                    TokenUsage::default(),
                );
            }
        };

        let attempt = ctx.fix_attempts().saturating_add(1);
        let system = PromptBuilder::fixing().build(&PromptInputs::new(ctx.config()));
        let request = ModelRequest::new(&self.model, system)
            .with_user(fix_user_prompt(errors, attempt, ctx.config().max_iterations))
            .with_tools(ToolSet::Fixing.specs());
        let tools = SandboxTools::new(SandboxFs::new(sandbox), env.runner.clone(), ToolSet::Fixing);

        info!(session_id = %ctx.session_id(), attempt, errors = errors.len(), "fixing validation errors");
        match run_tool_loop(
            env.model.as_ref(),
            request,
            &tools,
            env.sink.as_ref(),
            self.max_tool_calls,
            ctx.cancel_token(),
        )
        .await
        {
            Ok(outcome) => CapabilityResult::ok(
                outcome.usage,
                ContextUpdate {
                    fix_attempts: Some(attempt),
                    ..Default::default()
                },
            ),
            Err(stopped) => CapabilityResult::failed(stopped.error, stopped.usage),
        }
    }
}
