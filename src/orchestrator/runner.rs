use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use appforge_common::{CapabilityConfig, CompilerCheckMetrics, GenerationMetrics};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sequence::{Stage, stage_sequence};
use crate::capability::{
    Capability, CapabilityEnv, CodeGenerationCapability, ErrorFixingCapability, GenerationContext,
    PlanningCapability, TemplateCapability, ToolBudget, ValidationCapability,
};
use crate::errors::CapabilityError;
use crate::llm::{AgentEvent, StageStatus};

/// The capability bound to each stage.
#[derive(Clone)]
pub struct Capabilities {
    template: Arc<dyn Capability>,
    planning: Arc<dyn Capability>,
    generation: Arc<dyn Capability>,
    validation: Arc<dyn Capability>,
    fixing: Arc<dyn Capability>,
}

impl Capabilities {
    pub fn standard(model: &str, templates_dir: &Path) -> Self {
        Self {
            template: Arc::new(TemplateCapability::new(templates_dir)),
            planning: Arc::new(PlanningCapability::new(model)),
            generation: Arc::new(CodeGenerationCapability::new(model, ToolBudget::FromIterations)),
            validation: Arc::new(ValidationCapability),
            fixing: Arc::new(ErrorFixingCapability::new(model)),
        }
    }

    /// Replace the capability for one stage.
    pub fn with(mut self, stage: Stage, capability: Arc<dyn Capability>) -> Self {
        match stage {
            Stage::Template => self.template = capability,
            Stage::Planning => self.planning = capability,
            Stage::CodeGeneration => self.generation = capability,
            Stage::Validation => self.validation = capability,
            Stage::ErrorFixing => self.fixing = capability,
        }
        self
    }

    fn get(&self, stage: Stage) -> &dyn Capability {
        match stage {
            Stage::Template => self.template.as_ref(),
            Stage::Planning => self.planning.as_ref(),
            Stage::CodeGeneration => self.generation.as_ref(),
            Stage::Validation => self.validation.as_ref(),
            Stage::ErrorFixing => self.fixing.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed,
    Failed(String),
    /// Stopped by `abort()`. Not a failure.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub metrics: GenerationMetrics,
    /// Stages that executed, in order, including repeats from the fix loop.
    pub executed: Vec<Stage>,
}

enum StageOutcome {
    Completed,
    Skipped,
    Failed(CapabilityError),
}

struct RunState {
    ctx: GenerationContext,
    executed: Vec<Stage>,
}

/// Runs one session's capability sequence.
pub struct Orchestrator {
    session_id: Uuid,
    config: CapabilityConfig,
    capabilities: Capabilities,
    env: CapabilityEnv,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        session_id: Uuid,
        config: CapabilityConfig,
        capabilities: Capabilities,
        env: CapabilityEnv,
    ) -> Self {
        Self {
            session_id,
            config,
            capabilities,
            env,
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Stop the run. Safe to call any number of times, before, during or
    /// after `run`.
    pub fn abort(&self) {
        if !self.cancel.is_cancelled() {
            info!(session_id = %self.session_id, "aborting generation");
        }
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, prompt: &str, sandbox_dir: Option<PathBuf>) -> RunOutcome {
        let started = Instant::now();
        let mut state = RunState {
            ctx: GenerationContext::new(
                self.session_id,
                prompt,
                self.config.clone(),
                sandbox_dir,
                self.cancel.clone(),
            ),
            executed: Vec::new(),
        };
        let stages = stage_sequence(&self.config);
        info!(
            session_id = %self.session_id,
            stages = ?stages.iter().map(Stage::as_str).collect::<Vec<_>>(),
            "starting generation pipeline"
        );

        let mut compiler_checks = None;
        let mut status = RunStatus::Completed;
        for stage in stages {
            if self.is_aborted() {
                status = RunStatus::Aborted;
                break;
            }
            if stage == Stage::ErrorFixing {
                match self.fix_loop(&mut state).await {
                    Ok(metrics) => compiler_checks = Some(metrics),
                    Err(s) => {
                        status = s;
                        break;
                    }
                }
                continue;
            }
            if let StageOutcome::Failed(e) = self.run_stage(stage, &mut state).await {
                status = terminal_status(&e);
                break;
            }
        }
        if status == RunStatus::Completed && self.is_aborted() {
            status = RunStatus::Aborted;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let mut metrics = GenerationMetrics::from_usage(
            self.session_id,
            state.ctx.usage(),
            duration_ms,
            state.executed.len() as u32,
        );
        metrics.compiler_checks = compiler_checks;
        match &status {
            RunStatus::Completed => info!(
                session_id = %self.session_id,
                tokens = metrics.total_tokens,
                cost = metrics.cost,
                tool_calls = metrics.tool_calls,
                duration_ms,
                "generation completed"
            ),
            RunStatus::Failed(error) => warn!(session_id = %self.session_id, error = %error, "generation failed"),
            RunStatus::Aborted => info!(session_id = %self.session_id, "generation aborted"),
        }
        RunOutcome {
            status,
            metrics,
            executed: state.executed,
        }
    }

    /// Alternate fixing and validation until validation is clean or
    /// `max_iterations` fixes have run. Remaining errors are reported, not
    /// treated as failure.
    async fn fix_loop(&self, state: &mut RunState) -> Result<CompilerCheckMetrics, RunStatus> {
        let max_iterations = self.config.max_iterations;
        let initial_error_count = error_count(&state.ctx);
        let mut iterations_used: u8 = 0;

        while state.ctx.has_validation_errors() && iterations_used < max_iterations {
            if self.is_aborted() {
                return Err(RunStatus::Aborted);
            }
            iterations_used += 1;
            debug!(session_id = %self.session_id, iteration = iterations_used, max_iterations, "fix iteration");

            if let StageOutcome::Failed(e) = self.run_stage(Stage::ErrorFixing, state).await {
                if e.is_aborted() || iterations_used >= max_iterations {
                    return Err(terminal_status(&e));
                }
                warn!(session_id = %self.session_id, error = %e, "fix attempt failed, retrying");
                continue;
            }
            if let StageOutcome::Failed(e) = self.run_stage(Stage::Validation, state).await {
                return Err(terminal_status(&e));
            }
        }

        let final_error_count = error_count(&state.ctx);
        Ok(CompilerCheckMetrics {
            max_iterations,
            iterations_used,
            initial_error_count,
            final_error_count,
            has_remaining_errors: final_error_count > 0,
        })
    }

    async fn run_stage(&self, stage: Stage, state: &mut RunState) -> StageOutcome {
        let capability = self.capabilities.get(stage);
        let name = capability.name();
        if capability.can_skip(&state.ctx) {
            debug!(session_id = %self.session_id, capability = name, "skipping capability");
            self.emit_stage(name, StageStatus::Skipped);
            return StageOutcome::Skipped;
        }
        if let Err(e) = capability.validate_context(&state.ctx) {
            warn!(session_id = %self.session_id, capability = name, error = %e, "capability contract violated");
            self.emit_stage(name, StageStatus::Failed);
            return StageOutcome::Failed(e);
        }

        self.emit_stage(name, StageStatus::Started);
        let result = capability.execute(&state.ctx, &self.env).await;
        state.ctx.add_usage(&result.usage);
        state.executed.push(stage);

        if result.success {
            state.ctx.apply(result.update);
            self.emit_stage(name, StageStatus::Completed);
            return StageOutcome::Completed;
        }
        let error = result
            .error
            .unwrap_or_else(|| CapabilityError::LlmFailure(format!("{} failed without an error", name)));
        if error.is_aborted() {
            self.emit_stage(name, StageStatus::Aborted);
        } else {
            warn!(session_id = %self.session_id, capability = name, kind = error.kind(), error = %error, "capability failed");
            self.emit_stage(name, StageStatus::Failed);
        }
        StageOutcome::Failed(error)
    }

    fn emit_stage(&self, capability: &'static str, status: StageStatus) {
        self.env.sink.emit(AgentEvent::Stage { capability, status });
    }
}

fn error_count(ctx: &GenerationContext) -> usize {
    ctx.validation_errors().map_or(0, <[_]>::len)
}

fn terminal_status(error: &CapabilityError) -> RunStatus {
    if error.is_aborted() {
        RunStatus::Aborted
    } else {
        RunStatus::Failed(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use appforge_common::{InputMode, TokenUsage, ValidationError, ValidationErrorKind};
    use async_trait::async_trait;

    use super::*;
    use crate::capability::{CapabilityResult, ContextUpdate};
    use crate::llm::{EventSink, ScriptedModel};
    use crate::sandbox::LocalExecutor;

    /// Test capability with a fixed outcome and a call counter.
    struct Stub {
        name: &'static str,
        fail: Option<fn() -> CapabilityError>,
        calls: AtomicUsize,
    }

    impl Stub {
        fn ok(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str, fail: fn() -> CapabilityError) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: Some(fail),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cost: 0.01,
            tool_calls: 2,
        }
    }

    #[async_trait]
    impl Capability for Stub {
        fn name(&self) -> &'static str {
            self.name
        }

        fn validate_context(&self, _ctx: &GenerationContext) -> Result<(), CapabilityError> {
            Ok(())
        }

        async fn execute(&self, _ctx: &GenerationContext, _env: &CapabilityEnv) -> CapabilityResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                Some(f) => CapabilityResult::failed(f(), TokenUsage::default()),
                None => CapabilityResult::ok(usage(), ContextUpdate::default()),
            }
        }
    }

    /// Reports errors for the first `failing_runs` validations, then passes.
    struct FlakyValidation {
        failing_runs: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Capability for FlakyValidation {
        fn name(&self) -> &'static str {
            "validation"
        }

        fn validate_context(&self, _ctx: &GenerationContext) -> Result<(), CapabilityError> {
            Ok(())
        }

        async fn execute(&self, _ctx: &GenerationContext, _env: &CapabilityEnv) -> CapabilityResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let errors = if n < self.failing_runs {
                vec![ValidationError::new(ValidationErrorKind::Type, "src/App.tsx", "bad")]
            } else {
                vec![]
            };
            CapabilityResult::ok(
                TokenUsage::default(),
                ContextUpdate {
                    validation_errors: Some(errors),
                    ..Default::default()
                },
            )
        }
    }

    /// Fixer that counts attempts through the context.
    struct CountingFixer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Capability for CountingFixer {
        fn name(&self) -> &'static str {
            "errorFixing"
        }

        fn can_skip(&self, ctx: &GenerationContext) -> bool {
            !ctx.has_validation_errors()
        }

        fn validate_context(&self, _ctx: &GenerationContext) -> Result<(), CapabilityError> {
            Ok(())
        }

        async fn execute(&self, ctx: &GenerationContext, _env: &CapabilityEnv) -> CapabilityResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            CapabilityResult::ok(
                usage(),
                ContextUpdate {
                    fix_attempts: Some(ctx.fix_attempts() + 1),
                    ..Default::default()
                },
            )
        }
    }

    #[derive(Default)]
    struct StageLog(Mutex<Vec<(&'static str, StageStatus)>>);

    impl EventSink for StageLog {
        fn emit(&self, event: AgentEvent) {
            if let AgentEvent::Stage { capability, status } = event {
                self.0.lock().unwrap().push((capability, status));
            }
        }
    }

    fn stub_capabilities() -> Capabilities {
        Capabilities::standard("m", Path::new("templates"))
            .with(Stage::Template, Stub::ok("template"))
            .with(Stage::Planning, Stub::ok("planning"))
            .with(Stage::CodeGeneration, Stub::ok("codeGeneration"))
            .with(
                Stage::Validation,
                Arc::new(FlakyValidation {
                    failing_runs: 0,
                    calls: AtomicUsize::new(0),
                }),
            )
            .with(
                Stage::ErrorFixing,
                Arc::new(CountingFixer {
                    calls: AtomicUsize::new(0),
                }),
            )
    }

    fn env(sink: Arc<dyn EventSink>) -> CapabilityEnv {
        CapabilityEnv {
            model: Arc::new(ScriptedModel::new(vec![])),
            runner: Arc::new(LocalExecutor::new("/tmp")),
            sink,
            lifecycle: None,
        }
    }

    fn orchestrator(config: CapabilityConfig, capabilities: Capabilities) -> (Orchestrator, Arc<StageLog>) {
        let log = Arc::new(StageLog::default());
        let orch = Orchestrator::new(Uuid::new_v4(), config, capabilities, env(log.clone()));
        (orch, log)
    }

    #[tokio::test]
    async fn test_executes_exactly_the_configured_stages() {
        for mode in [InputMode::Naive, InputMode::Template] {
            for planning in [false, true] {
                for compiler_checks in [false, true] {
                    let config = CapabilityConfig {
                        input_mode: mode,
                        planning,
                        compiler_checks,
                        ..Default::default()
                    };
                    let (orch, _) = orchestrator(config.clone(), stub_capabilities());
                    let outcome = orch.run("todo", Some(PathBuf::from("/tmp/x"))).await;
                    assert_eq!(outcome.status, RunStatus::Completed);

                    // A clean first validation means the fix loop never runs.
                    let expected: Vec<Stage> = stage_sequence(&config)
                        .into_iter()
                        .filter(|s| *s != Stage::ErrorFixing)
                        .collect();
                    assert_eq!(outcome.executed, expected, "config {:?}", config);
                    assert_eq!(outcome.metrics.compiler_checks.is_some(), compiler_checks);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_fix_loop_stops_once_validation_is_clean() {
        let validation = Arc::new(FlakyValidation {
            failing_runs: 1,
            calls: AtomicUsize::new(0),
        });
        let fixer = Arc::new(CountingFixer {
            calls: AtomicUsize::new(0),
        });
        let caps = stub_capabilities()
            .with(Stage::Validation, validation.clone())
            .with(Stage::ErrorFixing, fixer.clone());
        let config = CapabilityConfig {
            compiler_checks: true,
            max_iterations: 2,
            ..Default::default()
        };
        let (orch, _) = orchestrator(config, caps);
        let outcome = orch.run("todo", Some(PathBuf::from("/tmp/x"))).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        let checks = outcome.metrics.compiler_checks.unwrap();
        assert_eq!(checks.iterations_used, 1);
        assert_eq!(checks.initial_error_count, 1);
        assert_eq!(checks.final_error_count, 0);
        assert!(!checks.has_remaining_errors);
        assert_eq!(fixer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(validation.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome.executed,
            vec![Stage::CodeGeneration, Stage::Validation, Stage::ErrorFixing, Stage::Validation]
        );
    }

    #[tokio::test]
    async fn test_fix_loop_never_exceeds_max_iterations() {
        for max_iterations in 1..=5u8 {
            let validation = Arc::new(FlakyValidation {
                failing_runs: usize::MAX,
                calls: AtomicUsize::new(0),
            });
            let fixer = Arc::new(CountingFixer {
                calls: AtomicUsize::new(0),
            });
            let caps = stub_capabilities()
                .with(Stage::Validation, validation)
                .with(Stage::ErrorFixing, fixer.clone());
            let config = CapabilityConfig {
                compiler_checks: true,
                max_iterations,
                ..Default::default()
            };
            let (orch, _) = orchestrator(config, caps);
            let outcome = orch.run("todo", Some(PathBuf::from("/tmp/x"))).await;

            // Remaining errors are reported, not a failure.
            assert_eq!(outcome.status, RunStatus::Completed);
            let checks = outcome.metrics.compiler_checks.unwrap();
            assert_eq!(checks.iterations_used, max_iterations);
            assert!(checks.has_remaining_errors);
            assert_eq!(fixer.calls.load(Ordering::SeqCst), max_iterations as usize);
        }
    }

    #[tokio::test]
    async fn test_failure_stops_pipeline() {
        let validation = Stub::ok("validation");
        let caps = stub_capabilities()
            .with(
                Stage::CodeGeneration,
                Stub::failing("codeGeneration", || CapabilityError::LlmFailure("overloaded".into())),
            )
            .with(Stage::Validation, validation.clone());
        let config = CapabilityConfig {
            compiler_checks: true,
            ..Default::default()
        };
        let (orch, log) = orchestrator(config, caps);
        let outcome = orch.run("todo", Some(PathBuf::from("/tmp/x"))).await;

        assert!(matches!(&outcome.status, RunStatus::Failed(msg) if msg.contains("overloaded")));
        assert_eq!(validation.calls(), 0);
        let stages = log.0.lock().unwrap().clone();
        assert_eq!(
            stages,
            vec![("codeGeneration", StageStatus::Started), ("codeGeneration", StageStatus::Failed)]
        );
    }

    #[tokio::test]
    async fn test_last_fix_failure_fails_pipeline() {
        let validation = Arc::new(FlakyValidation {
            failing_runs: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let caps = stub_capabilities()
            .with(Stage::Validation, validation)
            .with(
                Stage::ErrorFixing,
                Stub::failing("errorFixing", || CapabilityError::LlmFailure("bad gateway".into())),
            );
        let config = CapabilityConfig {
            compiler_checks: true,
            max_iterations: 2,
            ..Default::default()
        };
        let (orch, _) = orchestrator(config, caps);
        let outcome = orch.run("todo", Some(PathBuf::from("/tmp/x"))).await;
        assert!(matches!(outcome.status, RunStatus::Failed(_)));
    }

    /// Fails its first attempt, then fixes like [`CountingFixer`].
    struct FailsOnceFixer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Capability for FailsOnceFixer {
        fn name(&self) -> &'static str {
            "errorFixing"
        }

        fn validate_context(&self, _ctx: &GenerationContext) -> Result<(), CapabilityError> {
            Ok(())
        }

        async fn execute(&self, ctx: &GenerationContext, _env: &CapabilityEnv) -> CapabilityResult {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return CapabilityResult::failed(CapabilityError::LlmFailure("bad gateway".into()), usage());
            }
            CapabilityResult::ok(
                usage(),
                ContextUpdate {
                    fix_attempts: Some(ctx.fix_attempts() + 1),
                    ..Default::default()
                },
            )
        }
    }

    #[tokio::test]
    async fn test_failed_fix_attempt_is_retried() {
        let validation = Arc::new(FlakyValidation {
            failing_runs: 1,
            calls: AtomicUsize::new(0),
        });
        let fixer = Arc::new(FailsOnceFixer {
            calls: AtomicUsize::new(0),
        });
        let caps = stub_capabilities()
            .with(Stage::Validation, validation.clone())
            .with(Stage::ErrorFixing, fixer.clone());
        let config = CapabilityConfig {
            compiler_checks: true,
            max_iterations: 2,
            ..Default::default()
        };
        let (orch, log) = orchestrator(config, caps);
        let outcome = orch.run("todo", Some(PathBuf::from("/tmp/x"))).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        let checks = outcome.metrics.compiler_checks.unwrap();
        assert_eq!(checks.iterations_used, 2);
        assert_eq!(checks.final_error_count, 0);
        assert_eq!(fixer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(validation.calls.load(Ordering::SeqCst), 2);
        // Usage of the failed attempt still counts.
        assert_eq!(outcome.metrics.total_tokens, 150 * 3);
        let fixing: Vec<StageStatus> = log
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| *name == "errorFixing")
            .map(|(_, status)| *status)
            .collect();
        assert_eq!(
            fixing,
            vec![StageStatus::Started, StageStatus::Failed, StageStatus::Started, StageStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_abort_is_idempotent_at_any_time() {
        let (orch, _) = orchestrator(CapabilityConfig::default(), stub_capabilities());
        orch.abort();
        orch.abort();
        assert!(orch.is_aborted());
        let outcome = orch.run("todo", Some(PathBuf::from("/tmp/x"))).await;
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert!(outcome.executed.is_empty());

        let (orch, _) = orchestrator(CapabilityConfig::default(), stub_capabilities());
        let outcome = orch.run("todo", Some(PathBuf::from("/tmp/x"))).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        orch.abort();
        orch.abort();
        assert!(orch.is_aborted());
    }

    #[tokio::test]
    async fn test_abort_during_run_is_not_failure() {
        use crate::llm::scripted::ScriptedTurn;

        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(StageLog::default());
        let mut env = env(log.clone());
        env.model = Arc::new(ScriptedModel::new(vec![ScriptedTurn::Hang]));
        let orch = Arc::new(Orchestrator::new(
            Uuid::new_v4(),
            CapabilityConfig::default(),
            Capabilities::standard("m", Path::new("templates")),
            env,
        ));

        let runner = orch.clone();
        let dir_path = dir.path().to_path_buf();
        let task = tokio::spawn(async move { runner.run("todo", Some(dir_path)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.abort();
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert!(log
            .0
            .lock()
            .unwrap()
            .contains(&("codeGeneration", StageStatus::Aborted)));
    }

    #[tokio::test]
    async fn test_contract_violation_fails_fast() {
        let (orch, _) = orchestrator(
            CapabilityConfig::default(),
            Capabilities::standard("m", Path::new("templates")),
        );
        let outcome = orch.run("todo", None).await;
        assert!(matches!(&outcome.status, RunStatus::Failed(msg) if msg.contains("sandbox path")));
        assert!(outcome.executed.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_accumulate_across_stages() {
        let config = CapabilityConfig {
            planning: true,
            ..Default::default()
        };
        let (orch, _) = orchestrator(config, stub_capabilities());
        let outcome = orch.run("todo", Some(PathBuf::from("/tmp/x"))).await;
        assert_eq!(outcome.metrics.steps, 2);
        assert_eq!(outcome.metrics.total_tokens, 300);
        assert_eq!(outcome.metrics.tool_calls, 4);
        assert!(outcome.metrics.cost > 0.0);
    }
}
