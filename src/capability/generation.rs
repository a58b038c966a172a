use appforge_common::{CapabilityConfig, TokenUsage};
use async_trait::async_trait;
use tracing::{info, warn};

use super::{Capability, CapabilityEnv, CapabilityResult, ContextUpdate, GenerationContext, require_sandbox};
use crate::errors::CapabilityError;
use crate::llm::{ModelRequest, SandboxTools, ToolSet, run_tool_loop};
use crate::prompts::{PromptBuilder, PromptInputs};
use crate::sandbox::SandboxFs;

const NAME: &str = "codeGeneration";

/// Tool calls allowed before any per-iteration allowance.
const BASE_TOOL_CALLS: u32 = 60;
/// Extra tool calls granted per configured fix iteration.
const TOOL_CALLS_PER_ITERATION: u32 = 20;

/// How many tool calls one generation call may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolBudget {
    Fixed(u32),
    /// Scaled by the configured `max_iterations`.
    FromIterations,
}

impl ToolBudget {
    pub fn resolve(&self, config: &CapabilityConfig) -> u32 {
        match self {
            Self::Fixed(n) => *n,
            Self::FromIterations => {
                BASE_TOOL_CALLS + TOOL_CALLS_PER_ITERATION * u32::from(config.max_iterations)
            }
        }
    }
}

/// The unified generation phase: one streaming tool loop that writes the app.
pub struct CodeGenerationCapability {
    model: String,
    budget: ToolBudget,
}

impl CodeGenerationCapability {
    pub fn new(model: impl Into<String>, budget: ToolBudget) -> Self {
        Self {
            model: model.into(),
            budget,
        }
    }

    pub fn system_prompt(&self, ctx: &GenerationContext) -> String {
        PromptBuilder::generation().build(&PromptInputs::new(ctx.config()).with_plan(ctx.plan()))
    }
}

#[async_trait]
impl Capability for CodeGenerationCapability {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate_context(&self, ctx: &GenerationContext) -> Result<(), CapabilityError> {
        require_sandbox(NAME, ctx)?;
        if ctx.prompt().trim().is_empty() {
            return Err(CapabilityError::MissingContext {
                capability: NAME,
                field: "prompt",
            });
        }
        Ok(())
    }

    async fn execute(&self, ctx: &GenerationContext, env: &CapabilityEnv) -> CapabilityResult {
        let sandbox = match require_sandbox(NAME, ctx) {
            Ok(dir) => dir,
            Err(e) => return CapabilityResult::failed(e, TokenUsage::default()),
        };
        let max_tool_calls = self.budget.resolve(ctx.config());
        let request = ModelRequest::new(&self.model, self.system_prompt(ctx))
            .with_user(ctx.prompt())
            .with_tools(ToolSet::Generation.specs());
        let tools = SandboxTools::new(SandboxFs::new(sandbox), env.runner.clone(), ToolSet::Generation);

        match run_tool_loop(
            env.model.as_ref(),
            request,
            &tools,
            env.sink.as_ref(),
            max_tool_calls,
            ctx.cancel_token(),
        )
        .await
        {
            Ok(outcome) => {
                if outcome.budget_exhausted {
                    warn!(session_id = %ctx.session_id(), max_tool_calls, "generation stopped at tool-call budget");
                }
                info!(
                    session_id = %ctx.session_id(),
                    turns = outcome.turns,
                    tool_calls = outcome.usage.tool_calls,
                    tokens = outcome.usage.total_tokens(),
                    "code generation finished"
                );
                CapabilityResult::ok(outcome.usage, ContextUpdate::default())
            }
            Err(stopped) => CapabilityResult::failed(stopped.error, stopped.usage),
        }
    }
}
