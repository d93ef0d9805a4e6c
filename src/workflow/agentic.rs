//! Agentic loop engine
//!
//! Runs a loop's sub-steps over and over, feeding each iteration the
//! recent history, until the exit condition fires, `max_iterations` is
//! reached (a normal stop) or the wall-clock timeout elapses (an error).

use super::context::{ExecutionContext, RunContext};
use super::dispatcher::StepDispatcher;
use super::error::StepError;
use super::loop_state::{
    HistoryEntry, LoopState, LoopStateError, LoopStatus, compute_workflow_checksum,
    validate_workflow_checksum,
};
use crate::config::{AgenticLoopConfig, ExitCondition};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Separates rendered history from the current input
pub const CURRENT_INPUT_MARKER: &str = "--- Current input ---";

static EXACT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(DONE|COMPLETE|FINISHED)$")
        .unwrap_or_else(|e| panic!("invalid marker regex: {e}"))
});

static FUZZY_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)TASK[_\s-]?COMPLETE").unwrap_or_else(|e| panic!("invalid marker regex: {e}"))
});

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("loop '{loop_name}' timed out after {elapsed:?} ({iterations} iterations)")]
    Timeout {
        loop_name: String,
        elapsed: Duration,
        iterations: u32,
        best_output: String,
    },

    #[error("loop '{loop_name}' iteration {iteration}, step '{step}' failed: {source}")]
    Step {
        loop_name: String,
        iteration: u32,
        step: String,
        #[source]
        source: Box<StepError>,
    },

    #[error("loop '{loop_name}' has no steps")]
    NoSteps { loop_name: String },

    #[error("loop '{loop_name}': invalid exit pattern: {message}")]
    InvalidPattern { loop_name: String, message: String },

    #[error("loop '{loop_name}': {source}")]
    State {
        loop_name: String,
        #[source]
        source: LoopStateError,
    },
}

/// Why a loop stopped normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The exit condition matched
    ConditionMet,
    /// `max_iterations` was reached first
    MaxIterations,
    /// A completed checkpoint was found on resume
    AlreadyCompleted,
}

impl std::fmt::Display for LoopExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopExit::ConditionMet => "condition met",
            LoopExit::MaxIterations => "max iterations",
            LoopExit::AlreadyCompleted => "already completed",
        };
        f.write_str(s)
    }
}

/// Result of a loop that stopped without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub output: String,
    pub iterations: u32,
    pub exit: LoopExit,
}

/// Evaluates a loop's exit condition
#[derive(Debug, Clone)]
pub enum ExitMatcher {
    LlmDecides,
    Pattern(Option<Regex>),
}

impl ExitMatcher {
    pub fn new(condition: ExitCondition, pattern: Option<&str>) -> Result<Self, regex::Error> {
        Ok(match condition {
            ExitCondition::LlmDecides => ExitMatcher::LlmDecides,
            ExitCondition::PatternMatch => match pattern {
                Some(p) if !p.is_empty() => ExitMatcher::Pattern(Some(Regex::new(p)?)),
                _ => ExitMatcher::Pattern(None),
            },
        })
    }

    /// True if `output` ends the loop
    pub fn check_exit_condition(&self, output: &str) -> bool {
        match self {
            ExitMatcher::LlmDecides => {
                let trimmed = output.trim();
                EXACT_MARKER.is_match(trimmed) || FUZZY_MARKER.is_match(trimmed)
            }
            ExitMatcher::Pattern(Some(regex)) => regex.is_match(output),
            ExitMatcher::Pattern(None) => false,
        }
    }
}

/// Runtime state of one loop invocation
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub iteration: u32,
    pub initial_input: String,
    pub previous_output: String,
    pub history: Vec<HistoryEntry>,
    pub started_at: DateTime<Utc>,
}

impl LoopContext {
    pub fn new(initial_input: impl Into<String>) -> Self {
        Self {
            iteration: 0,
            initial_input: initial_input.into(),
            previous_output: String::new(),
            history: Vec::new(),
            started_at: Utc::now(),
        }
    }

    fn from_state(state: &LoopState) -> Self {
        Self {
            iteration: state.iteration,
            initial_input: state.initial_input.clone(),
            previous_output: state.previous_output.clone(),
            history: state.history.clone(),
            started_at: state.started_at,
        }
    }

    /// Raw input for the next iteration, before history is added
    pub fn current_input(&self) -> &str {
        if self.history.is_empty() {
            &self.initial_input
        } else {
            &self.previous_output
        }
    }

    /// Record an iteration, evicting the oldest entries beyond `retain`
    pub fn push_history(&mut self, output: &str, retain: usize) {
        self.history.push(HistoryEntry {
            index: self.iteration,
            output: output.to_string(),
            timestamp: Utc::now(),
        });
        if self.history.len() > retain {
            let excess = self.history.len() - retain;
            self.history.drain(..excess);
        }
        self.previous_output = output.to_string();
    }
}

/// Input for the next iteration: recent history, then the current input
pub fn build_iteration_context(
    history: &[HistoryEntry],
    context_window: usize,
    current_input: &str,
) -> String {
    if history.is_empty() || context_window == 0 {
        return current_input.to_string();
    }
    let start = history.len().saturating_sub(context_window);
    let mut out = String::from("Previous iterations:\n");
    for entry in &history[start..] {
        out.push_str(&format!("Iteration {}: {}\n", entry.index, entry.output.trim_end()));
    }
    out.push('\n');
    out.push_str(CURRENT_INPUT_MARKER);
    out.push('\n');
    out.push_str(current_input);
    out
}

/// Runs one loop configuration
pub struct AgenticLoopEngine<'a> {
    dispatcher: StepDispatcher,
    exec: Arc<ExecutionContext>,
    name: String,
    config: &'a AgenticLoopConfig,
}

impl<'a> AgenticLoopEngine<'a> {
    pub fn new(
        exec: Arc<ExecutionContext>,
        name: impl Into<String>,
        config: &'a AgenticLoopConfig,
    ) -> Self {
        Self {
            dispatcher: StepDispatcher::new(exec.clone()),
            exec,
            name: name.into(),
            config,
        }
    }

    fn state_key(&self, run: &RunContext) -> String {
        if run.workflow_name().is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", run.workflow_name(), self.name)
        }
    }

    fn state_error(&self, source: LoopStateError) -> LoopError {
        LoopError::State {
            loop_name: self.name.clone(),
            source,
        }
    }

    /// Run the loop to completion
    pub async fn run(
        &self,
        run: &mut RunContext,
        initial_input: String,
    ) -> Result<LoopOutcome, LoopError> {
        if self.config.steps.is_empty() {
            return Err(LoopError::NoSteps {
                loop_name: self.name.clone(),
            });
        }
        let matcher = ExitMatcher::new(self.config.exit_condition, self.config.exit_pattern.as_deref())
            .map_err(|e| LoopError::InvalidPattern {
                loop_name: self.name.clone(),
                message: e.to_string(),
            })?;

        let key = self.state_key(run);
        let checksum = match (self.config.stateful, run.workflow_path.as_deref()) {
            (true, Some(path)) => {
                compute_workflow_checksum(path).map_err(|e| self.state_error(e))?
            }
            _ => String::new(),
        };

        let mut ctx = LoopContext::new(initial_input);
        if self.config.stateful && self.exec.resume {
            match self.exec.state_manager.load_state(&key) {
                Ok(state) => {
                    validate_workflow_checksum(&state).map_err(|e| self.state_error(e))?;
                    if state.status == LoopStatus::Completed {
                        tracing::info!(loop_name = %self.name, iterations = state.iteration, "loop already completed");
                        return Ok(LoopOutcome {
                            output: state.previous_output,
                            iterations: state.iteration,
                            exit: LoopExit::AlreadyCompleted,
                        });
                    }
                    tracing::info!(
                        loop_name = %self.name,
                        iteration = state.iteration + 1,
                        "resuming loop from checkpoint"
                    );
                    ctx = LoopContext::from_state(&state);
                    run.variables.restore(state.variables);
                }
                Err(LoopStateError::NotFound { .. }) => {
                    tracing::debug!(loop_name = %self.name, "no checkpoint, starting fresh");
                }
                Err(e) => return Err(self.state_error(e)),
            }
        }

        let outer_loop_vars = std::mem::take(&mut run.loop_vars);
        let result = self.iterate(run, &mut ctx, &matcher, &key, &checksum).await;
        run.loop_vars = outer_loop_vars;

        let status = match result {
            Ok(_) => LoopStatus::Completed,
            Err(LoopError::Timeout { .. }) => LoopStatus::Paused,
            Err(_) => LoopStatus::Failed,
        };
        if self.config.stateful
            && let Err(e) = self.checkpoint(&key, &checksum, &ctx, run, status)
        {
            match result {
                Ok(_) => return Err(e),
                Err(ref original) => tracing::warn!(
                    loop_name = %self.name,
                    error = %e,
                    loop_error = %original,
                    "could not save final checkpoint"
                ),
            }
        }
        result
    }

    async fn iterate(
        &self,
        run: &mut RunContext,
        ctx: &mut LoopContext,
        matcher: &ExitMatcher,
        key: &str,
        checksum: &str,
    ) -> Result<LoopOutcome, LoopError> {
        let started = Instant::now();
        let deadline = (self.config.timeout_seconds > 0)
            .then(|| started + Duration::from_secs(self.config.timeout_seconds));
        let retain = self.config.retained_history();

        tracing::info!(
            loop_name = %self.name,
            max_iterations = self.config.max_iterations,
            timeout_seconds = self.config.timeout_seconds,
            "starting loop"
        );

        loop {
            if ctx.iteration >= self.config.max_iterations {
                return Ok(LoopOutcome {
                    output: ctx.previous_output.clone(),
                    iterations: ctx.iteration,
                    exit: LoopExit::MaxIterations,
                });
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                tracing::warn!(loop_name = %self.name, iterations = ctx.iteration, "loop timed out");
                return Err(LoopError::Timeout {
                    loop_name: self.name.clone(),
                    elapsed: started.elapsed(),
                    iterations: ctx.iteration,
                    best_output: ctx.previous_output.clone(),
                });
            }

            ctx.iteration += 1;
            let input = build_iteration_context(
                &ctx.history,
                self.config.context_window,
                ctx.current_input(),
            );
            self.publish_loop_vars(run, ctx, started.elapsed());

            tracing::debug!(loop_name = %self.name, iteration = ctx.iteration, "running iteration");
            let output = self.run_iteration(run, ctx.iteration, input).await?;
            ctx.push_history(&output, retain);

            if self.config.stateful && ctx.iteration % self.config.checkpoint_interval.max(1) == 0 {
                self.checkpoint(key, checksum, ctx, run, LoopStatus::Running)?;
            }

            if matcher.check_exit_condition(&output) {
                tracing::info!(loop_name = %self.name, iterations = ctx.iteration, "exit condition met");
                return Ok(LoopOutcome {
                    output,
                    iterations: ctx.iteration,
                    exit: LoopExit::ConditionMet,
                });
            }
            if ctx.iteration >= self.config.max_iterations {
                tracing::info!(loop_name = %self.name, iterations = ctx.iteration, "max iterations reached");
                return Ok(LoopOutcome {
                    output,
                    iterations: ctx.iteration,
                    exit: LoopExit::MaxIterations,
                });
            }
        }
    }

    /// Chain the sub-steps; the last one's output is the iteration output
    async fn run_iteration(
        &self,
        run: &mut RunContext,
        iteration: u32,
        input: String,
    ) -> Result<String, LoopError> {
        run.last_output = input;
        for step in &self.config.steps {
            self.dispatcher
                .dispatch(step, run)
                .await
                .map_err(|e| LoopError::Step {
                    loop_name: self.name.clone(),
                    iteration,
                    step: step.name.clone(),
                    source: Box::new(e),
                })?;
        }
        Ok(run.last_output.clone())
    }

    fn publish_loop_vars(&self, run: &mut RunContext, ctx: &LoopContext, elapsed: Duration) {
        run.loop_vars = HashMap::from([
            ("name".to_string(), self.name.clone()),
            ("iteration".to_string(), ctx.iteration.to_string()),
            ("previous_output".to_string(), ctx.previous_output.clone()),
            ("max_iterations".to_string(), self.config.max_iterations.to_string()),
            ("elapsed".to_string(), elapsed.as_secs().to_string()),
        ]);
    }

    fn checkpoint(
        &self,
        key: &str,
        checksum: &str,
        ctx: &LoopContext,
        run: &RunContext,
        status: LoopStatus,
    ) -> Result<(), LoopError> {
        let mut state = LoopState::new(self.name.clone(), run.workflow_name());
        state.workflow_file = run.workflow_path.clone();
        state.workflow_checksum = checksum.to_string();
        state.iteration = ctx.iteration;
        state.status = status;
        state.initial_input = ctx.initial_input.clone();
        state.previous_output = ctx.previous_output.clone();
        state.history = ctx.history.clone();
        state.variables = run.variables.snapshot();
        state.started_at = ctx.started_at;
        self.exec
            .state_manager
            .save_state(key, &state)
            .map_err(|e| self.state_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, OutputSpec, StepConfig, WorkflowConfig};
    use crate::provider::{ModelProvider, ProviderError, ProviderRegistry, ProviderRequest, ProviderResponse};
    use crate::workflow::loop_state::LoopStateManager;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replies with a fixed script, recording every prompt
    struct Scripted {
        replies: Mutex<Vec<String>>,
        prompts: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> (Self, Arc<Mutex<Vec<String>>>) {
            let prompts = Arc::new(Mutex::new(Vec::new()));
            let provider = Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                prompts: prompts.clone(),
                delay: Duration::ZERO,
            };
            (provider, prompts)
        }
    }

    #[async_trait]
    impl ModelProvider for Scripted {
        async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let reply = self.replies.lock().unwrap().pop().unwrap_or_else(|| "again".into());
            Ok(ProviderResponse::new(reply, "mock", Duration::ZERO))
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    fn exec_with(provider: Scripted, dir: &std::path::Path, resume: bool) -> Arc<ExecutionContext> {
        let mut providers = ProviderRegistry::new();
        providers.register("mock", Arc::new(provider));
        Arc::new(
            ExecutionContext::new(Arc::new(EngineConfig::default()), providers, dir)
                .with_state_manager(LoopStateManager::new(dir.join("state")))
                .with_resume(resume),
        )
    }

    fn loop_config(max_iterations: u32) -> AgenticLoopConfig {
        AgenticLoopConfig {
            max_iterations,
            steps: vec![StepConfig {
                name: "think".into(),
                model: Some("mock".into()),
                action: Some("Iteration {{ loop.iteration }} of {{ loop.max_iterations }}".into()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn run_ctx(dir: &std::path::Path) -> RunContext {
        let workflow = WorkflowConfig {
            name: "wf".into(),
            ..Default::default()
        };
        RunContext::new(Arc::new(workflow), dir)
    }

    fn entry(index: u32) -> HistoryEntry {
        HistoryEntry {
            index,
            output: format!("out{}", index),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_llm_decides_markers() {
        let matcher = ExitMatcher::new(ExitCondition::LlmDecides, None).unwrap();
        for done in ["DONE", "  DONE  ", "COMPLETE", "FINISHED", "TASK_COMPLETE", "task complete", "done\n"] {
            assert!(matcher.check_exit_condition(done), "{done:?} should exit");
        }
        assert!(!matcher.check_exit_condition("Here is the next step of the analysis"));
        assert!(!matcher.check_exit_condition("Not DONE yet"));
    }

    #[test]
    fn test_pattern_match() {
        let matcher =
            ExitMatcher::new(ExitCondition::PatternMatch, Some(r"CODE_REVIEW_\d+_DONE")).unwrap();
        assert!(matcher.check_exit_condition("CODE_REVIEW_123_DONE"));
        assert!(!matcher.check_exit_condition("CODE_REVIEW_DONE"));

        let empty = ExitMatcher::new(ExitCondition::PatternMatch, Some("")).unwrap();
        assert!(!empty.check_exit_condition("CODE_REVIEW_123_DONE"));
        assert!(!empty.check_exit_condition(""));
    }

    #[test]
    fn test_build_context_first_iteration() {
        assert_eq!(build_iteration_context(&[], 5, "start"), "start");
    }

    #[test]
    fn test_build_context_window() {
        let history: Vec<_> = (1..=6).map(entry).collect();
        let ctx = build_iteration_context(&history, 3, "current");

        assert!(!ctx.contains("Iteration 3:"));
        assert!(ctx.contains("Iteration 4: out4"));
        assert!(ctx.contains("Iteration 6: out6"));
        assert!(ctx.ends_with(&format!("{}\ncurrent", CURRENT_INPUT_MARKER)));
        assert_eq!(ctx.matches("Iteration ").count(), 3);
    }

    #[test]
    fn test_history_is_capped() {
        let mut ctx = LoopContext::new("in");
        for i in 1..=10 {
            ctx.iteration = i;
            ctx.push_history(&format!("o{}", i), 4);
        }
        assert_eq!(ctx.history.len(), 4);
        assert_eq!(ctx.history[0].index, 7);
        assert_eq!(ctx.previous_output, "o10");
        assert_eq!(ctx.current_input(), "o10");
    }

    #[tokio::test]
    async fn test_single_iteration_never_matching() {
        let dir = TempDir::new().unwrap();
        let (provider, _) = Scripted::new(&["first pass"]);
        let exec = exec_with(provider, dir.path(), false);
        let mut config = loop_config(1);
        config.exit_condition = ExitCondition::PatternMatch;
        config.exit_pattern = Some("NEVER".into());

        let mut run = run_ctx(dir.path());
        let outcome = AgenticLoopEngine::new(exec, "review", &config)
            .run(&mut run, "start".into())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.output, "first pass");
        assert_eq!(outcome.exit, LoopExit::MaxIterations);
    }

    #[tokio::test]
    async fn test_exits_on_marker_and_chains_history() {
        let dir = TempDir::new().unwrap();
        let (provider, prompts) = Scripted::new(&["draft", "better", "DONE"]);
        let exec = exec_with(provider, dir.path(), false);
        let config = loop_config(10);

        let mut run = run_ctx(dir.path());
        let outcome = AgenticLoopEngine::new(exec, "refine", &config)
            .run(&mut run, "topic".into())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.exit, LoopExit::ConditionMet);

        let prompts = prompts.lock().unwrap();
        assert!(prompts[0].starts_with("Iteration 1 of 10"));
        assert!(prompts[0].ends_with("topic"));
        assert!(prompts[2].contains("Iteration 2: better"));
        assert!(run.loop_vars.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_returns_best_output() {
        let dir = TempDir::new().unwrap();
        let (mut provider, _) = Scripted::new(&["partial"]);
        provider.delay = Duration::from_millis(1200);
        let exec = exec_with(provider, dir.path(), false);
        let mut config = loop_config(10);
        config.timeout_seconds = 1;

        let mut run = run_ctx(dir.path());
        let err = AgenticLoopEngine::new(exec, "slow", &config)
            .run(&mut run, "go".into())
            .await
            .unwrap_err();

        match err {
            LoopError::Timeout {
                best_output,
                iterations,
                ..
            } => {
                assert_eq!(iterations, 1);
                assert_eq!(best_output, "partial");
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_sub_step_failure_aborts() {
        let dir = TempDir::new().unwrap();
        let (provider, _) = Scripted::new(&[]);
        let exec = exec_with(provider, dir.path(), false);
        let mut config = loop_config(3);
        config.steps[0].model = Some("missing".into());

        let mut run = run_ctx(dir.path());
        let err = AgenticLoopEngine::new(exec, "broken", &config)
            .run(&mut run, "go".into())
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::Step { iteration: 1, .. }));
    }

    #[tokio::test]
    async fn test_stateful_timeout_leaves_checkpoint_paused() {
        let dir = TempDir::new().unwrap();
        let (mut provider, _) = Scripted::new(&["partial"]);
        provider.delay = Duration::from_millis(1200);
        let exec = exec_with(provider, dir.path(), false);
        let mut config = loop_config(10);
        config.timeout_seconds = 1;
        config.stateful = true;

        let mut run = run_ctx(dir.path());
        let err = AgenticLoopEngine::new(exec.clone(), "slow", &config)
            .run(&mut run, "go".into())
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::Timeout { .. }));

        let state = exec.state_manager.load_state("wf.slow").unwrap();
        assert_eq!(state.status, LoopStatus::Paused);
        assert_eq!(state.iteration, 1);
        assert_eq!(state.previous_output, "partial");
    }

    #[tokio::test]
    async fn test_stateful_step_failure_leaves_checkpoint_failed() {
        let dir = TempDir::new().unwrap();
        let (provider, _) = Scripted::new(&[]);
        let exec = exec_with(provider, dir.path(), false);
        let mut config = loop_config(3);
        config.stateful = true;
        config.steps[0].model = Some("missing".into());

        let mut run = run_ctx(dir.path());
        AgenticLoopEngine::new(exec.clone(), "broken", &config)
            .run(&mut run, "go".into())
            .await
            .unwrap_err();

        let state = exec.state_manager.load_state("wf.broken").unwrap();
        assert_eq!(state.status, LoopStatus::Failed);
        assert_eq!(state.iteration, 1);
    }

    #[tokio::test]
    async fn test_resume_of_completed_loop_skips_iterations() {
        let dir = TempDir::new().unwrap();
        let mut config = loop_config(2);
        config.stateful = true;

        let (provider, _) = Scripted::new(&["one", "two"]);
        let exec = exec_with(provider, dir.path(), false);
        let mut run = run_ctx(dir.path());
        AgenticLoopEngine::new(exec, "done", &config)
            .run(&mut run, "seed".into())
            .await
            .unwrap();

        let (provider, prompts) = Scripted::new(&["unexpected"]);
        let exec = exec_with(provider, dir.path(), true);
        let mut run = run_ctx(dir.path());
        let outcome = AgenticLoopEngine::new(exec, "done", &config)
            .run(&mut run, "seed".into())
            .await
            .unwrap();

        assert_eq!(outcome.exit, LoopExit::AlreadyCompleted);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.output, "two");
        assert!(prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_failure_keeps_timeout_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let (mut provider, _) = Scripted::new(&["partial"]);
        provider.delay = Duration::from_millis(1200);
        let mut providers = ProviderRegistry::new();
        providers.register("mock", Arc::new(provider));
        let exec = Arc::new(
            ExecutionContext::new(Arc::new(EngineConfig::default()), providers, dir.path())
                .with_state_manager(LoopStateManager::new(blocker.join("state"))),
        );
        let mut config = loop_config(10);
        config.timeout_seconds = 1;
        config.stateful = true;
        config.checkpoint_interval = 100;

        let mut run = run_ctx(dir.path());
        let err = AgenticLoopEngine::new(exec, "slow", &config)
            .run(&mut run, "go".into())
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::Timeout { ref best_output, .. } if best_output == "partial"));
    }

    #[tokio::test]
    async fn test_stateful_resume_continues() {
        let dir = TempDir::new().unwrap();
        let wf_file = dir.path().join("wf.toml");
        std::fs::write(&wf_file, "name = \"wf\"\n").unwrap();

        let mut config = loop_config(2);
        config.stateful = true;
        config.steps[0].output = Some(OutputSpec::Single("$LAST".into()));

        let (provider, _) = Scripted::new(&["one", "two"]);
        let exec = exec_with(provider, dir.path(), false);
        let mut run = run_ctx(dir.path()).with_workflow_path(Some(wf_file.clone()));
        AgenticLoopEngine::new(exec.clone(), "grow", &config)
            .run(&mut run, "seed".into())
            .await
            .unwrap();

        let state = exec.state_manager.load_state("wf.grow").unwrap();
        assert_eq!(state.status, LoopStatus::Completed);
        assert_eq!(state.iteration, 2);
        assert_eq!(state.variables.get("LAST").map(String::as_str), Some("two"));

        // Pretend the run was interrupted after iteration 1, then extend the limit
        let mut paused = state.clone();
        paused.status = LoopStatus::Paused;
        paused.iteration = 1;
        paused.history.truncate(1);
        paused.previous_output = "one".into();
        exec.state_manager.save_state("wf.grow", &paused).unwrap();

        let (provider, prompts) = Scripted::new(&["resumed"]);
        let exec = exec_with(provider, dir.path(), true);
        let mut run = run_ctx(dir.path()).with_workflow_path(Some(wf_file.clone()));
        let outcome = AgenticLoopEngine::new(exec.clone(), "grow", &config)
            .run(&mut run, "ignored".into())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.output, "resumed");
        assert!(prompts.lock().unwrap()[0].starts_with("Iteration 2 of 2"));

        std::fs::write(&wf_file, "name = \"changed\"\n").unwrap();
        let mut paused = paused;
        paused.status = LoopStatus::Paused;
        exec.state_manager.save_state("wf.grow", &paused).unwrap();
        let mut run = run_ctx(dir.path()).with_workflow_path(Some(wf_file));
        let err = AgenticLoopEngine::new(exec, "grow", &config)
            .run(&mut run, "x".into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LoopError::State {
                source: LoopStateError::ChecksumMismatch { .. },
                ..
            }
        ));
    }
}
