use appforge_common::TokenUsage;
use async_trait::async_trait;
use tracing::{debug, info};

use super::plan::ArchitecturePlan;
use super::{Capability, CapabilityEnv, CapabilityResult, ContextUpdate, GenerationContext};
use crate::errors::CapabilityError;
use crate::llm::tools::{CREATE_PLAN, plan_tool};
use crate::llm::{AgentEvent, ModelRequest, ToolChoice, describe_tool_call, pricing};
use crate::prompts::planning_system_prompt;

const NAME: &str = "planning";

/// One forced `create_plan` call producing the architecture plan.
pub struct PlanningCapability {
    model: String,
}

impl PlanningCapability {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }
}

#[async_trait]
impl Capability for PlanningCapability {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_skip(&self, ctx: &GenerationContext) -> bool {
        ctx.plan().is_some()
    }

    fn validate_context(&self, ctx: &GenerationContext) -> Result<(), CapabilityError> {
        if ctx.prompt().trim().is_empty() {
            return Err(CapabilityError::MissingContext {
                capability: NAME,
                field: "prompt",
            });
        }
        Ok(())
    }

    async fn execute(&self, ctx: &GenerationContext, env: &CapabilityEnv) -> CapabilityResult {
        let request = ModelRequest::new(&self.model, planning_system_prompt())
            .with_user(ctx.prompt())
            .with_tools(vec![plan_tool()])
            .with_tool_choice(ToolChoice::Tool(CREATE_PLAN.to_string()));

        let response = match env.model.complete(request, ctx.cancel_token().clone()).await {
            Ok(response) => response,
            Err(e) => return CapabilityResult::failed(e.into(), TokenUsage::default()),
        };
        let mut usage = TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            cost: pricing::cost(&self.model, &response.usage),
            tool_calls: 0,
        };

        let Some(call) = response.tool_calls.into_iter().find(|c| c.name == CREATE_PLAN) else {
            debug!(session_id = %ctx.session_id(), text = %response.text, "planning reply without tool call");
            return CapabilityResult::failed(CapabilityError::PlanningToolNotInvoked, usage);
        };
        usage.tool_calls = 1;
        env.sink.emit(AgentEvent::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.input.clone(),
            reason: describe_tool_call(&call.name, &call.input),
        });

        let plan: ArchitecturePlan = match serde_json::from_value(call.input) {
            Ok(plan) => plan,
            Err(e) => {
                let error = CapabilityError::LlmFailure(format!("Malformed plan: {}", e));
                emit_result(env, &call.id, &error.to_string(), true);
                return CapabilityResult::failed(error, usage);
            }
        };
        if plan.is_empty() {
            emit_result(env, &call.id, &CapabilityError::EmptyPlan.to_string(), true);
            return CapabilityResult::failed(CapabilityError::EmptyPlan, usage);
        }

        info!(
            session_id = %ctx.session_id(),
            models = plan.models.len(),
            routes = plan.routes.len(),
            components = plan.components.len(),
            "architecture plan created"
        );
        emit_result(env, &call.id, &plan.to_markdown(), false);
        CapabilityResult::ok(
            usage,
            ContextUpdate {
                plan: Some(plan),
                ..Default::default()
            },
        )
    }
}

fn emit_result(env: &CapabilityEnv, id: &str, result: &str, is_error: bool) {
    env.sink.emit(AgentEvent::ToolResult {
        id: id.to_string(),
        name: CREATE_PLAN.to_string(),
        result: result.to_string(),
        is_error,
    });
}
