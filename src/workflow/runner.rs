//! Workflow runner - orchestrates step execution
//!
//! A run validates the whole workflow, runs every parallel group, runs
//! the loops (named loops through the orchestrator, or the legacy single
//! loop), then runs the remaining sequential steps in declaration order.

use super::agentic::AgenticLoopEngine;
use super::context::{ExecutionContext, RunContext};
use super::dispatcher::StepDispatcher;
use super::error::WorkflowError;
use super::orchestrator::{LoopOrchestrator, pre_loop_steps};
use super::parallel::run_group;
use super::state::{LoopSummary, WorkflowResult};
use super::validator::validate;
use super::variables::VariableStore;
use crate::config::WorkflowConfig;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Name the legacy single loop is recorded under
pub const LEGACY_LOOP_NAME: &str = "agentic_loop";

type RunFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<LoopSummary>, WorkflowError>> + Send + 'a>>;

/// Inputs for one workflow run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// `--var` values, visible as `{{ name }}` and `$name`
    pub vars: HashMap<String, String>,

    /// Initial implicit input for the first `STDIN` step
    pub input: String,

    pub working_dir: PathBuf,

    /// Workflow file, for sub-workflow paths and loop checksums
    pub workflow_path: Option<PathBuf>,
}

/// Workflow runner
pub struct WorkflowRunner {
    exec: Arc<ExecutionContext>,
}

impl WorkflowRunner {
    pub fn new(exec: Arc<ExecutionContext>) -> Self {
        Self { exec }
    }

    /// Run a workflow
    pub async fn run(
        &self,
        workflow: WorkflowConfig,
        options: RunOptions,
    ) -> Result<WorkflowResult, WorkflowError> {
        let started = Instant::now();
        let mut run = RunContext::new(Arc::new(workflow), options.working_dir)
            .with_workflow_path(options.workflow_path)
            .with_variables(VariableStore::from_map(options.vars.clone()))
            .with_cli_vars(options.vars)
            .with_input(options.input);

        tracing::info!(workflow = %run.workflow_name(), "starting workflow");
        let loops = self.run_in_context(&mut run).await?;

        let result = WorkflowResult::from_run(run, loops, started.elapsed());
        tracing::info!(
            workflow = %result.name,
            duration_ms = result.duration.as_millis() as u64,
            "workflow finished"
        );
        Ok(result)
    }

    /// Run the workflow held by `run`; also used for sub-workflows
    pub(crate) fn run_in_context<'a>(&'a self, run: &'a mut RunContext) -> RunFuture<'a> {
        Box::pin(async move {
            let workflow = run.workflow.clone();
            validate(&workflow)?;

            for (name, group) in &workflow.parallel {
                run_group(&self.exec, name, group, run).await?;
            }

            let dispatcher = StepDispatcher::new(self.exec.clone());
            let mut loops = Vec::new();
            let mut done = BTreeSet::new();

            if !workflow.loops.is_empty() {
                let pre = pre_loop_steps(&workflow);
                for &index in &pre {
                    self.run_step(&dispatcher, &workflow, index, run).await?;
                }
                done = pre;

                let outcomes = LoopOrchestrator::new(self.exec.clone())
                    .run(&workflow, run)
                    .await?;
                loops.extend(outcomes.iter().map(|(name, o)| LoopSummary::new(name, o)));
            } else if let Some(ref config) = workflow.agentic_loop {
                let initial = run.last_output.clone();
                let outcome = AgenticLoopEngine::new(self.exec.clone(), LEGACY_LOOP_NAME, config)
                    .run(run, initial)
                    .await?;
                run.record_output(LEGACY_LOOP_NAME, &outcome.output);
                loops.push(LoopSummary::new(LEGACY_LOOP_NAME, &outcome));
            }

            for index in 0..workflow.steps.len() {
                if !done.contains(&index) {
                    self.run_step(&dispatcher, &workflow, index, run).await?;
                }
            }
            Ok(loops)
        })
    }

    async fn run_step(
        &self,
        dispatcher: &StepDispatcher,
        workflow: &WorkflowConfig,
        index: usize,
        run: &mut RunContext,
    ) -> Result<(), WorkflowError> {
        let step = &workflow.steps[index];
        dispatcher
            .dispatch(step, run)
            .await
            .map(|_| ())
            .map_err(|source| WorkflowError::Step {
                step: step.name.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::provider::{ModelProvider, ProviderError, ProviderRegistry, ProviderRequest, ProviderResponse};
    use crate::workflow::agentic::LoopExit;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Echoes the prompt; prompts containing "FAIL" error out
    struct Echo;

    #[async_trait]
    impl ModelProvider for Echo {
        async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            if request.prompt.contains("FAIL") {
                return Err(ProviderError::network("refused"));
            }
            Ok(ProviderResponse::new(request.prompt.clone(), "echo", Duration::ZERO))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn runner(dir: &std::path::Path) -> WorkflowRunner {
        let mut providers = ProviderRegistry::new();
        providers.register("echo", Arc::new(Echo));
        WorkflowRunner::new(Arc::new(ExecutionContext::new(
            Arc::new(EngineConfig::default()),
            providers,
            dir,
        )))
    }

    fn options(dir: &std::path::Path) -> RunOptions {
        RunOptions {
            working_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_variable_flows_between_steps() {
        let dir = TempDir::new().unwrap();
        let workflow = WorkflowConfig::from_toml(
            r#"
            name = "chain"

            [[steps]]
            name = "a"
            input = "NA"
            model = "echo"
            action = "hello"
            output = "$X"

            [[steps]]
            name = "b"
            input = "$X"
            model = "echo"
            action = "say"
            output = "STDOUT"
            "#,
        )
        .unwrap();

        let result = runner(dir.path()).run(workflow, options(dir.path())).await.unwrap();
        assert_eq!(result.variables.get("X").map(String::as_str), Some("hello"));
        assert_eq!(result.console, vec!["say\n\nhello".to_string()]);
        assert_eq!(result.output, "say\n\nhello");
    }

    #[tokio::test]
    async fn test_initial_input_and_cli_vars() {
        let dir = TempDir::new().unwrap();
        let workflow = WorkflowConfig::from_toml(
            r#"
            name = "greet"

            [[steps]]
            name = "only"
            input = "STDIN"
            model = "echo"
            action = "greet {{ who }}"
            output = "STDOUT"
            "#,
        )
        .unwrap();

        let mut opts = options(dir.path());
        opts.input = "piped".into();
        opts.vars.insert("who".into(), "world".into());
        let result = runner(dir.path()).run(workflow, opts).await.unwrap();
        assert_eq!(result.output, "greet world\n\npiped");
    }

    #[tokio::test]
    async fn test_legacy_loop_stops_at_max_iterations() {
        let dir = TempDir::new().unwrap();
        let workflow = WorkflowConfig::from_toml(
            r#"
            name = "once"

            [agentic_loop]
            max_iterations = 1
            exit_condition = "pattern_match"
            exit_pattern = "NEVER"

            [[agentic_loop.steps]]
            name = "think"
            model = "echo"
            action = "iterate"
            "#,
        )
        .unwrap();

        let mut opts = options(dir.path());
        opts.input = "seed".into();
        let result = runner(dir.path()).run(workflow, opts).await.unwrap();
        assert_eq!(result.loops.len(), 1);
        assert_eq!(result.loops[0].name, LEGACY_LOOP_NAME);
        assert_eq!(result.loops[0].iterations, 1);
        assert_eq!(result.loops[0].exit, LoopExit::MaxIterations);
        assert_eq!(result.step_output(LEGACY_LOOP_NAME), Some("iterate\n\nseed"));
    }

    #[tokio::test]
    async fn test_collision_fails_before_execution() {
        let dir = TempDir::new().unwrap();
        let workflow = WorkflowConfig::from_toml(
            r#"
            name = "clash"

            [[steps]]
            name = "first"
            input = "NA"
            model = "echo"
            action = "x"
            output = "first.txt"

            [[parallel.g.steps]]
            name = "p1"
            input = "NA"
            model = "echo"
            action = "one"
            output = "same.txt"

            [[parallel.g.steps]]
            name = "p2"
            input = "NA"
            model = "echo"
            action = "two"
            output = "same.txt"
            "#,
        )
        .unwrap();

        let err = runner(dir.path()).run(workflow, options(dir.path())).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert!(!dir.path().join("first.txt").exists());
        assert!(!dir.path().join("same.txt").exists());
    }

    #[tokio::test]
    async fn test_parallel_failure_stops_workflow() {
        let dir = TempDir::new().unwrap();
        let workflow = WorkflowConfig::from_toml(
            r#"
            name = "fails"

            [[steps]]
            name = "after"
            input = "NA"
            model = "echo"
            action = "after"
            output = "after.txt"

            [[parallel.g.steps]]
            name = "good"
            input = "NA"
            model = "echo"
            action = "fine"
            output = "$GOOD"

            [[parallel.g.steps]]
            name = "bad"
            input = "NA"
            model = "echo"
            action = "FAIL now"
            output = "$BAD"
            "#,
        )
        .unwrap();

        let err = runner(dir.path()).run(workflow, options(dir.path())).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Parallel { ref step, .. } if step == "bad"));
        assert!(!dir.path().join("after.txt").exists());
    }

    #[tokio::test]
    async fn test_parallel_outputs_feed_sequential_steps() {
        let dir = TempDir::new().unwrap();
        let workflow = WorkflowConfig::from_toml(
            r#"
            name = "gather"

            [[steps]]
            name = "merge"
            input = ["a.txt", "b.txt"]
            model = "echo"
            action = "merge"
            output = "STDOUT"

            [[parallel.research.steps]]
            name = "a"
            input = "NA"
            model = "echo"
            action = "alpha"
            output = "a.txt"

            [[parallel.research.steps]]
            name = "b"
            input = "NA"
            model = "echo"
            action = "beta"
            output = "b.txt"
            "#,
        )
        .unwrap();

        let result = runner(dir.path()).run(workflow, options(dir.path())).await.unwrap();
        assert_eq!(result.step_output("a"), Some("alpha"));
        assert_eq!(result.step_output("b"), Some("beta"));
        let merged = result.step_output("merge").unwrap();
        assert!(merged.contains("merge\n\nalpha"));
        assert!(merged.contains("merge\n\nbeta"));
    }

    #[tokio::test]
    async fn test_pre_loop_steps_loops_then_rest() {
        let dir = TempDir::new().unwrap();
        let workflow = WorkflowConfig::from_toml(
            r#"
            name = "hybrid"

            [[steps]]
            name = "report"
            input = "$REVIEW"
            model = "echo"
            action = "final"
            output = "STDOUT"

            [[steps]]
            name = "seed"
            input = "NA"
            model = "echo"
            action = "topics"
            output = "$TOPICS"

            [loops.review]
            input_state = "TOPICS"
            output_state = "REVIEW"
            max_iterations = 1

            [[loops.review.steps]]
            name = "check"
            model = "echo"
            action = "review"
            "#,
        )
        .unwrap();

        let result = runner(dir.path()).run(workflow, options(dir.path())).await.unwrap();
        assert_eq!(result.variables.get("REVIEW").map(String::as_str), Some("review\n\ntopics"));
        assert_eq!(result.output, "final\n\nreview\n\ntopics");
        assert_eq!(result.loops.len(), 1);
        assert_eq!(result.loops[0].name, "review");
    }
}
