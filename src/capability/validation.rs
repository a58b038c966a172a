use appforge_common::{TokenUsage, ValidationError, ValidationErrorKind};
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Capability, CapabilityEnv, CapabilityResult, ContextUpdate, GenerationContext, require_sandbox};
use crate::container::ContainerEvent;
use crate::errors::CapabilityError;
use crate::llm::tools::RUN_COMMAND;
use crate::llm::AgentEvent;
use crate::parsers::parse_validation_output;
use crate::sandbox::ExecOutcome;
use crate::util::truncate_str;

const NAME: &str = "validation";

pub const INSTALL_COMMAND: &str = "npm install";
pub const SCHEMA_COMMAND: &str = "npx prisma validate";
pub const TYPE_CHECK_COMMAND: &str = "npx tsc --noEmit";

const SCHEMA_PATH: &str = "prisma/schema.prisma";
const RESULT_PREVIEW_LEN: usize = 2000;

/// Install, schema validation and type check. No model calls.
pub struct ValidationCapability;

impl ValidationCapability {
    async fn run_step(
        &self,
        ctx: &GenerationContext,
        env: &CapabilityEnv,
        command: &str,
    ) -> Result<ExecOutcome, CapabilityError> {
        let id = format!("validate_{}", Uuid::new_v4().simple());
        env.sink.emit(AgentEvent::ToolCall {
            id: id.clone(),
            name: RUN_COMMAND.to_string(),
            args: serde_json::json!({ "command": command }),
            reason: format!("Running: {}", command),
        });

        let result = env.runner.run(command, ctx.cancel_token()).await;
        let (text, is_error) = match &result {
            Ok(out) if out.success() => (truncate_str(&out.combined_output(), RESULT_PREVIEW_LEN), false),
            Ok(out) => (
                format!("{}\n{}", out.failure_summary(), truncate_str(&out.combined_output(), RESULT_PREVIEW_LEN)),
                true,
            ),
            Err(e) => (e.to_string(), true),
        };
        env.sink.emit(AgentEvent::ToolResult {
            id,
            name: RUN_COMMAND.to_string(),
            result: text,
            is_error,
        });

        let outcome = result.map_err(|e| CapabilityError::CommandFailure {
            command: command.to_string(),
            message: e.to_string(),
        })?;
        if outcome.cancelled || ctx.is_cancelled() {
            return Err(CapabilityError::Aborted);
        }
        if outcome.timed_out {
            return Err(CapabilityError::CommandFailure {
                command: command.to_string(),
                message: outcome.failure_summary(),
            });
        }
        Ok(outcome)
    }

    /// Run a check whose non-zero exit means diagnostics, not a broken sandbox.
    async fn check(
        &self,
        ctx: &GenerationContext,
        env: &CapabilityEnv,
        kind: ValidationErrorKind,
        command: &str,
    ) -> Result<Vec<ValidationError>, CapabilityError> {
        let outcome = self.run_step(ctx, env, command).await?;
        Ok(parse_validation_output(kind, &outcome.combined_output(), outcome.success()))
    }

    async fn validate(
        &self,
        ctx: &GenerationContext,
        env: &CapabilityEnv,
    ) -> Result<Vec<ValidationError>, CapabilityError> {
        let sandbox = require_sandbox(NAME, ctx)?;
        if !is_file(&sandbox.join("package.json")).await {
            return Ok(vec![ValidationError::new(
                ValidationErrorKind::Type,
                "package.json",
                "package.json is missing; the project cannot be installed or type-checked",
            )]);
        }

        let install = self.run_step(ctx, env, INSTALL_COMMAND).await?;
        if !install.success() {
            return Err(CapabilityError::CommandFailure {
                command: INSTALL_COMMAND.to_string(),
                message: format!(
                    "{}: {}",
                    install.failure_summary(),
                    truncate_str(install.stderr.trim(), 500)
                ),
            });
        }

        let mut errors = Vec::new();
        if is_file(&sandbox.join(SCHEMA_PATH)).await {
            errors.extend(self.check(ctx, env, ValidationErrorKind::Schema, SCHEMA_COMMAND).await?);
        }
        errors.extend(self.check(ctx, env, ValidationErrorKind::Type, TYPE_CHECK_COMMAND).await?);
        Ok(errors)
    }
}

#[async_trait]
impl Capability for ValidationCapability {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate_context(&self, ctx: &GenerationContext) -> Result<(), CapabilityError> {
        require_sandbox(NAME, ctx).map(|_| ())
    }

    async fn execute(&self, ctx: &GenerationContext, env: &CapabilityEnv) -> CapabilityResult {
        match self.validate(ctx, env).await {
            Ok(errors) => {
                info!(session_id = %ctx.session_id(), errors = errors.len(), "validation finished");
                CapabilityResult::ok(
                    TokenUsage::default(),
                    ContextUpdate {
                        validation_errors: Some(errors),
                        ..Default::default()
                    },
                )
            }
            Err(e) => {
                if let CapabilityError::CommandFailure { .. } = &e
                    && let Some(lifecycle) = &env.lifecycle
                    && let Err(send_err) = lifecycle.send(ContainerEvent::Error(e.to_string()))
                {
                    warn!(session_id = %ctx.session_id(), error = %send_err, "could not report command failure to container machine");
                }
                CapabilityResult::failed(e, TokenUsage::default())
            }
        }
    }
}

async fn is_file(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}
