//! CLI command implementations

use super::output::{OutputEvent, OutputHandler};
use super::signals::{CancellationToken, setup_signal_handlers, with_cancellation};
use crate::config::{EngineConfig, load_workflow};
use crate::memory::MemoryStore;
use crate::provider::ProviderRegistry;
use crate::workflow::{ExecutionContext, LoopStateManager, RunOptions, WorkflowRunner, validate};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Exit code for an interrupted run
const EXIT_INTERRUPTED: i32 = 130;

/// Options for `run`
#[derive(Debug, Default)]
pub struct RunArgs {
    pub vars: Vec<String>,
    pub resume: bool,
    pub input: String,
}

/// Run a workflow
pub async fn run_workflow(
    workflow_name: &str,
    args: RunArgs,
    working_dir: &Path,
    config: Arc<EngineConfig>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let (workflow, path) = load_workflow(workflow_name, Some(working_dir))
        .with_context(|| format!("Failed to load workflow '{}'", workflow_name))?;
    let vars = parse_vars(&args.vars)?;

    let providers = ProviderRegistry::from_config(&config);
    let mut exec = ExecutionContext::new(config.clone(), providers, working_dir).with_resume(args.resume);
    if workflow.uses_memory() {
        exec = exec.with_memory(MemoryStore::open(&config.memory_db(working_dir))?);
    }

    handler.emit(OutputEvent::WorkflowStart {
        name: workflow.name.clone(),
        steps: workflow.steps.len(),
        parallel_groups: workflow.parallel.len(),
        loops: workflow.loops.len() + usize::from(workflow.agentic_loop.is_some()),
    });

    let options = RunOptions {
        vars,
        input: args.input,
        working_dir: working_dir.to_path_buf(),
        workflow_path: Some(path),
    };
    let runner = WorkflowRunner::new(Arc::new(exec));

    let token = CancellationToken::new();
    tokio::spawn(setup_signal_handlers(token.clone()));
    let Some(outcome) = with_cancellation(&token, runner.run(workflow, options)).await else {
        handler.emit(OutputEvent::WorkflowError {
            error: "interrupted; stateful loops can continue with --resume".into(),
        });
        return Ok(EXIT_INTERRUPTED);
    };

    match outcome {
        Ok(result) => {
            for summary in &result.loops {
                handler.emit(OutputEvent::LoopFinished {
                    name: summary.name.clone(),
                    iterations: summary.iterations,
                    exit: summary.exit.to_string(),
                });
            }
            handler.emit(OutputEvent::WorkflowComplete {
                success: true,
                duration_ms: result.duration.as_millis() as u64,
                steps_completed: result.step_outputs.len(),
            });
            let console = result.console_text();
            handler.result(true, (!console.is_empty()).then_some(console.as_str()));
            Ok(0)
        }
        Err(e) => {
            handler.emit(OutputEvent::WorkflowError {
                error: e.to_string(),
            });
            handler.result(false, e.best_output());
            Ok(1)
        }
    }
}

/// Parse `--var name=value` pairs
pub fn parse_vars(args: &[String]) -> Result<HashMap<String, String>> {
    let mut parsed = HashMap::new();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            anyhow::bail!("invalid --var '{}', expected name=value", arg);
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("invalid --var '{}', name is empty", arg);
        }
        parsed.insert(key.to_string(), value.to_string());
    }
    Ok(parsed)
}

/// Validate a workflow
pub fn validate_workflow(workflow_name: &str, working_dir: &Path, handler: &dyn OutputHandler) -> i32 {
    let workflow = match load_workflow(workflow_name, Some(working_dir)) {
        Ok((workflow, _)) => workflow,
        Err(e) => {
            handler.emit(OutputEvent::WorkflowError {
                error: format!("Failed to load workflow: {:#}", e),
            });
            return 1;
        }
    };

    match validate(&workflow) {
        Ok(()) => {
            handler.emit(OutputEvent::Info {
                message: format!(
                    "✓ Workflow '{}' is valid ({} steps, {} parallel groups, {} loops)",
                    workflow.name,
                    workflow.steps.len(),
                    workflow.parallel.len(),
                    workflow.loops.len() + usize::from(workflow.agentic_loop.is_some()),
                ),
            });
            0
        }
        Err(errors) => {
            handler.emit(OutputEvent::Info {
                message: format!("✗ Workflow '{}' has {} error(s):", workflow.name, errors.len()),
            });
            for err in errors.iter() {
                handler.emit(OutputEvent::Info {
                    message: format!("  - {}", err),
                });
            }
            1
        }
    }
}

/// List saved loop states, most recent first
pub fn list_states(manager: &LoopStateManager, handler: &dyn OutputHandler) -> Result<()> {
    let states = manager.list_states()?;
    if states.is_empty() {
        handler.emit(OutputEvent::Info {
            message: format!("(no saved loop states in {})", manager.dir().display()),
        });
        return Ok(());
    }

    for state in states {
        let key = if state.workflow.is_empty() {
            state.loop_name.clone()
        } else {
            format!("{}.{}", state.workflow, state.loop_name)
        };
        handler.emit(OutputEvent::Info {
            message: format!(
                "{}  {}  iteration {}  updated {}",
                key,
                state.status,
                state.iteration,
                state.updated_at.format("%Y-%m-%d %H:%M:%S")
            ),
        });
    }
    Ok(())
}

/// Print one saved loop state as JSON
pub fn show_state(manager: &LoopStateManager, key: &str, handler: &dyn OutputHandler) -> Result<()> {
    let state = manager.load_state(key)?;
    let json = serde_json::to_string_pretty(&state)?;
    handler.result(true, Some(&json));
    Ok(())
}

/// Delete a saved loop state and its backups
pub fn delete_state(manager: &LoopStateManager, key: &str, handler: &dyn OutputHandler) -> Result<()> {
    manager.delete_state(key)?;
    handler.emit(OutputEvent::Info {
        message: format!("Deleted loop state '{}'", key),
    });
    Ok(())
}

/// List configured models
pub fn list_models(config: &EngineConfig, handler: &dyn OutputHandler) {
    if config.models.is_empty() {
        handler.emit(OutputEvent::Info {
            message: "(no models configured)".into(),
        });
        return;
    }

    let mut names: Vec<_> = config.models.keys().collect();
    names.sort();
    for name in names {
        let model = &config.models[name];
        let enabled = if model.enabled { "✓" } else { "✗" };
        let kind = if model.is_http() { "http" } else { "cli" };
        handler.emit(OutputEvent::Info {
            message: format!("{} {} ({}: {})", enabled, name, kind, model.command),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::workflow::LoopStatus;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockHandler {
        events: Mutex<Vec<OutputEvent>>,
        results: Mutex<Vec<String>>,
    }

    impl MockHandler {
        fn messages(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    OutputEvent::Info { message } => Some(message.clone()),
                    OutputEvent::WorkflowError { error } => Some(error.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl OutputHandler for MockHandler {
        fn emit(&self, event: OutputEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn result(&self, _success: bool, output: Option<&str>) {
            if let Some(out) = output {
                self.results.lock().unwrap().push(out.to_string());
            }
        }
    }

    #[test]
    fn test_parse_vars() {
        let args = vec!["name=test".to_string(), "expr=a=b".to_string()];
        let parsed = parse_vars(&args).unwrap();
        assert_eq!(parsed.get("name").map(String::as_str), Some("test"));
        assert_eq!(parsed.get("expr").map(String::as_str), Some("a=b"));

        assert!(parse_vars(&["positional".to_string()]).is_err());
        assert!(parse_vars(&["=value".to_string()]).is_err());
    }

    fn write_workflow(dir: &Path, name: &str, body: &str) {
        let workflows = dir.join(".llmflow/workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(workflows.join(format!("{}.toml", name)), body).unwrap();
    }

    #[test]
    fn test_validate_reports_every_error() {
        let dir = TempDir::new().unwrap();
        write_workflow(
            dir.path(),
            "broken",
            r#"
            [[steps]]
            name = "a"
            model = "m"

            [[steps]]
            name = "a"
            input = "NA"
            model = "m"
            action = "x"
            output = "STDOUT"
            "#,
        );
        let handler = MockHandler::default();
        assert_eq!(validate_workflow("broken", dir.path(), &handler), 1);
        let messages = handler.messages();
        assert!(messages[0].contains("error(s)"));
        assert!(messages.len() >= 3);
    }

    #[test]
    fn test_validate_ok_and_missing() {
        let dir = TempDir::new().unwrap();
        write_workflow(
            dir.path(),
            "fine",
            r#"
            [[steps]]
            name = "a"
            input = "NA"
            model = "m"
            action = "x"
            output = "STDOUT"
            "#,
        );
        let handler = MockHandler::default();
        assert_eq!(validate_workflow("fine", dir.path(), &handler), 0);
        assert_eq!(validate_workflow("nope", dir.path(), &handler), 1);
    }

    #[test]
    fn test_state_commands() {
        let dir = TempDir::new().unwrap();
        let manager = LoopStateManager::new(dir.path().join("state"));
        let handler = MockHandler::default();

        list_states(&manager, &handler).unwrap();
        assert!(handler.messages()[0].contains("no saved loop states"));

        let mut state = crate::workflow::LoopState::new("refine", "essay");
        state.iteration = 4;
        state.status = LoopStatus::Paused;
        manager.save_state("essay.refine", &state).unwrap();

        list_states(&manager, &handler).unwrap();
        assert!(handler.messages()[1].starts_with("essay.refine  paused  iteration 4"));

        show_state(&manager, "essay.refine", &handler).unwrap();
        assert!(handler.results.lock().unwrap()[0].contains("\"iteration\": 4"));

        delete_state(&manager, "essay.refine", &handler).unwrap();
        assert!(show_state(&manager, "essay.refine", &handler).is_err());
    }

    #[test]
    fn test_list_models_sorted() {
        let mut config = EngineConfig::default();
        for name in ["zeta", "alpha"] {
            config.models.insert(
                name.into(),
                ModelConfig {
                    command: name.into(),
                    ..Default::default()
                },
            );
        }
        let handler = MockHandler::default();
        list_models(&config, &handler);
        let messages = handler.messages();
        assert!(messages[0].contains("alpha"));
        assert!(messages[1].contains("zeta"));
    }

    #[tokio::test]
    async fn test_run_unknown_workflow_fails() {
        let dir = TempDir::new().unwrap();
        let handler = MockHandler::default();
        let result = run_workflow(
            "missing",
            RunArgs::default(),
            dir.path(),
            Arc::new(EngineConfig::default()),
            &handler,
        )
        .await;
        assert!(result.is_err());
    }
}
