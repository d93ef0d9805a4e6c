//! Parallel group executor
//!
//! Every member of a group runs on its own task with a forked run
//! context. Workers report on an ok channel and an error channel, both
//! sized to the group. A supervisor owns the tasks, turns panics into
//! errors and closes both channels once every worker has finished. The
//! first error aborts the remaining workers and fails the workflow.

use super::context::{ExecutionContext, RunContext};
use super::dispatcher::{StepDispatcher, StepResult};
use super::error::{StepError, WorkflowError};
use crate::config::ParallelGroup;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

type Finished = (usize, RunContext, StepResult);
type Failed = (usize, StepError);

/// Run every step of `group` concurrently and merge the results into `run`
pub async fn run_group(
    exec: &Arc<ExecutionContext>,
    group_name: &str,
    group: &ParallelGroup,
    run: &mut RunContext,
) -> Result<(), WorkflowError> {
    let n = group.steps.len();
    if n == 0 {
        return Ok(());
    }
    let started = Instant::now();
    tracing::info!(group = %group_name, steps = n, "starting parallel group");

    let (ok_tx, mut ok_rx) = mpsc::channel::<Finished>(n);
    let (err_tx, mut err_rx) = mpsc::channel::<Failed>(n);
    let (abort_tx, abort_rx) = oneshot::channel::<()>();

    let mut workers = JoinSet::new();
    let mut task_steps = HashMap::new();
    for (index, step) in group.steps.iter().enumerate() {
        let dispatcher = StepDispatcher::new(exec.clone());
        let step = step.clone();
        let mut child = run.fork();
        let ok_tx = ok_tx.clone();
        let err_tx = err_tx.clone();
        let handle = workers.spawn(async move {
            match dispatcher.dispatch(&step, &mut child).await {
                Ok(result) => {
                    let _ = ok_tx.send((index, child, result)).await;
                }
                Err(e) => {
                    let _ = err_tx.send((index, e)).await;
                }
            }
        });
        task_steps.insert(handle.id(), index);
    }

    let names: Vec<String> = group.steps.iter().map(|s| s.name.clone()).collect();
    let supervisor = tokio::spawn(supervise(workers, task_steps, names, ok_tx, err_tx, abort_rx));

    let mut abort_tx = Some(abort_tx);
    let mut first_error: Option<Failed> = None;
    let mut finished: Vec<Option<(RunContext, StepResult)>> = (0..n).map(|_| None).collect();
    let (mut ok_open, mut err_open) = (true, true);

    while ok_open || err_open {
        tokio::select! {
            biased;
            received = err_rx.recv(), if err_open => match received {
                Some((index, error)) => {
                    tracing::error!(
                        group = %group_name,
                        step = %group.steps[index].name,
                        error = %error,
                        "parallel step failed"
                    );
                    if first_error.is_none() {
                        if let Some(tx) = abort_tx.take() {
                            let _ = tx.send(());
                        }
                        first_error = Some((index, error));
                    }
                }
                None => err_open = false,
            },
            received = ok_rx.recv(), if ok_open => match received {
                Some((index, child, result)) => finished[index] = Some((child, result)),
                None => ok_open = false,
            },
        }
    }
    if let Err(e) = supervisor.await {
        tracing::warn!(group = %group_name, error = %e, "parallel supervisor did not finish cleanly");
    }

    if let Some((index, source)) = first_error {
        return Err(WorkflowError::Parallel {
            group: group_name.to_string(),
            step: group.steps[index].name.clone(),
            source,
        });
    }

    // Declaration order, so console output is deterministic
    for (child, result) in finished.into_iter().flatten() {
        run.step_outputs.insert(result.step, result.output);
        run.console.extend(child.console);
    }
    tracing::info!(
        group = %group_name,
        duration_ms = started.elapsed().as_millis() as u64,
        "parallel group finished"
    );
    Ok(())
}

/// Wait for every worker, then drop both senders so the receivers close
async fn supervise(
    mut workers: JoinSet<()>,
    task_steps: HashMap<tokio::task::Id, usize>,
    names: Vec<String>,
    ok_tx: mpsc::Sender<Finished>,
    err_tx: mpsc::Sender<Failed>,
    mut abort_rx: oneshot::Receiver<()>,
) {
    let mut abort_seen = false;
    loop {
        tokio::select! {
            joined = workers.join_next_with_id() => match joined {
                Some(Err(e)) if e.is_panic() => {
                    let index = task_steps.get(&e.id()).copied().unwrap_or(0);
                    let step = names.get(index).cloned().unwrap_or_default();
                    let _ = err_tx.send((index, StepError::WorkerPanicked { step })).await;
                }
                Some(_) => {}
                None => break,
            },
            signal = &mut abort_rx, if !abort_seen => {
                abort_seen = true;
                if signal.is_ok() {
                    tracing::debug!(workers = workers.len(), "aborting remaining parallel workers");
                    workers.abort_all();
                }
            }
        }
    }
    drop(ok_tx);
    drop(err_tx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgenticLoopConfig, EngineConfig, InputSpec, OutputSpec, StepConfig, WorkflowConfig};
    use crate::provider::{ModelProvider, ProviderError, ProviderRegistry, ProviderRequest, ProviderResponse};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Sleeps, then echoes the prompt; prompts containing "fail" error out
    struct Worker {
        delay: Duration,
    }

    #[async_trait]
    impl ModelProvider for Worker {
        async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            if request.prompt.contains("panic") {
                panic!("worker exploded");
            }
            if request.prompt.contains("fail") {
                return Err(ProviderError::network("backend unavailable"));
            }
            tokio::time::sleep(self.delay).await;
            Ok(ProviderResponse::new(request.prompt.clone(), "worker", Duration::ZERO))
        }

        fn name(&self) -> &str {
            "worker"
        }
    }

    fn exec(dir: &std::path::Path) -> Arc<ExecutionContext> {
        let mut providers = ProviderRegistry::new();
        providers.register("fast", Arc::new(Worker { delay: Duration::from_millis(10) }));
        providers.register("medium", Arc::new(Worker { delay: Duration::from_millis(200) }));
        providers.register("slow", Arc::new(Worker { delay: Duration::from_secs(30) }));
        Arc::new(ExecutionContext::new(Arc::new(EngineConfig::default()), providers, dir))
    }

    fn step(name: &str, model: &str, action: &str, output: &str) -> StepConfig {
        StepConfig {
            name: name.into(),
            input: Some(InputSpec::Single("NA".into())),
            model: Some(model.into()),
            action: Some(action.into()),
            output: Some(OutputSpec::Single(output.into())),
            ..Default::default()
        }
    }

    fn run_in(dir: &std::path::Path) -> RunContext {
        RunContext::new(Arc::new(WorkflowConfig::default()), dir)
    }

    #[tokio::test]
    async fn test_group_merges_outputs() {
        let dir = TempDir::new().unwrap();
        let group = ParallelGroup {
            steps: vec![
                step("a", "fast", "alpha", "$A"),
                step("b", "fast", "beta", "b.txt"),
                step("c", "fast", "gamma", "STDOUT"),
            ],
        };
        let mut run = run_in(dir.path());
        run_group(&exec(dir.path()), "g", &group, &mut run).await.unwrap();

        assert_eq!(run.variables.get("A").as_deref(), Some("alpha"));
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "beta");
        assert_eq!(run.console, vec!["gamma".to_string()]);
        assert_eq!(run.step_outputs.get("b").map(String::as_str), Some("beta"));
        assert_eq!(run.step_outputs.len(), 3);
    }

    fn inline_loop(name: &str, output: &str, steps: Vec<StepConfig>) -> StepConfig {
        StepConfig {
            name: name.into(),
            input: Some(InputSpec::Single("NA".into())),
            output: Some(OutputSpec::Single(output.into())),
            agentic_loop: Some(Box::new(AgenticLoopConfig {
                max_iterations: 1,
                steps,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_inline_loops_keep_their_own_loop_values() {
        let dir = TempDir::new().unwrap();
        let group = ParallelGroup {
            steps: vec![
                inline_loop("a", "$A", vec![step("a1", "fast", "quick {{ loop.name }}", "$A1")]),
                inline_loop(
                    "b",
                    "$B",
                    vec![
                        step("b1", "medium", "wait", "$B1"),
                        step("b2", "fast", "pass {{ loop.iteration }} of {{ loop.name }}", "$B2"),
                    ],
                ),
            ],
        };
        let mut run = run_in(dir.path());
        run_group(&exec(dir.path()), "g", &group, &mut run).await.unwrap();

        assert_eq!(run.variables.get("A").as_deref(), Some("quick a"));
        assert_eq!(run.variables.get("B").as_deref(), Some("pass 1 of b"));
        assert!(run.loop_vars.is_empty());
    }

    #[tokio::test]
    async fn test_first_error_aborts_group() {
        let dir = TempDir::new().unwrap();
        let group = ParallelGroup {
            steps: vec![
                step("slow", "slow", "never finishes", "slow.txt"),
                step("bad", "fast", "please fail", "bad.txt"),
            ],
        };
        let mut run = run_in(dir.path());
        let started = Instant::now();
        let err = run_group(&exec(dir.path()), "g", &group, &mut run).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            WorkflowError::Parallel { group, step, .. } => {
                assert_eq!(group, "g");
                assert_eq!(step, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dir.path().join("slow.txt").exists());
        assert!(run.step_outputs.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_worker_is_reported() {
        let dir = TempDir::new().unwrap();
        let group = ParallelGroup {
            steps: vec![step("ok", "fast", "fine", "$OK"), step("boom", "fast", "panic", "$BOOM")],
        };
        let mut run = run_in(dir.path());
        let err = run_group(&exec(dir.path()), "g", &group, &mut run).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Parallel { ref step, source: StepError::WorkerPanicked { .. }, .. } if step == "boom"
        ));
    }

    #[tokio::test]
    async fn test_empty_group_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mut run = run_in(dir.path());
        run_group(&exec(dir.path()), "empty", &ParallelGroup::default(), &mut run)
            .await
            .unwrap();
        assert!(run.step_outputs.is_empty());
    }
}
