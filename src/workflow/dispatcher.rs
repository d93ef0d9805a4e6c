//! Step dispatcher
//!
//! Resolves a step's kind and runs the matching handler. Every handler
//! returns a `StepResult`; the dispatcher then writes outputs, updates
//! memory and records the output for later steps.
//!
//! A step whose output is `{"step": "<deferred>", "input": "..."}` hands
//! off to a deferred step. Hand-offs run in a bounded loop, not by
//! recursion.

use super::agentic::AgenticLoopEngine;
use super::context::{ExecutionContext, RunContext};
use super::error::{StepError, WorkflowError};
use super::inputs::{InputItem, ResolvedInput, resolve_input};
use super::repo_index::build_repo_index;
use super::runner::WorkflowRunner;
use super::validator::validate;
use super::variables::{VariableStore, as_var_ref};
use crate::config::{
    ApiStepConfig, GenerateConfig, InputSpec, OutputSpec, ProcessConfig, RepoIndexConfig,
    ResponseFormat, STDIN, STDOUT, StepConfig, StepKind, WorkflowConfig, load_workflow_file,
};
use crate::memory::format_memory_context;
use crate::provider::{ModelProvider, ProviderRequest, extract_code_block, extract_json};
use serde::Deserialize;
use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Memory entries prepended to a prompt
const MEMORY_CONTEXT_ENTRIES: usize = 10;

/// Output of one fanned-out item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutput {
    /// Position in the resolved input
    pub index: usize,
    pub source: String,
    pub output: String,
}

/// A fanned-out item that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub index: usize,
    pub source: String,
    pub error: String,
}

/// Normalized result of executing a step
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub step: String,
    pub kind: &'static str,

    /// Combined output
    pub output: String,

    /// Individual outputs, in input order
    pub items: Vec<ItemOutput>,
    pub failures: Vec<ItemFailure>,

    /// True when the input fanned out over several items
    pub fan_out: bool,

    pub model: Option<String>,
    pub duration: Duration,
}

impl StepResult {
    fn single(step: &StepConfig, kind: &'static str, output: String) -> Self {
        Self {
            step: step.name.clone(),
            kind,
            items: vec![ItemOutput {
                index: 0,
                source: step.name.clone(),
                output: output.clone(),
            }],
            output,
            ..Default::default()
        }
    }

    /// Number of input items, successful or not
    pub fn total_items(&self) -> usize {
        self.items.len() + self.failures.len()
    }
}

/// A deferred hand-off request
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeferredRequest {
    step: String,
    input: String,
}

/// Prompt settings shared by standard and API steps
struct ModelCall {
    model: String,
    action: String,
    system: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>>;

/// Executes steps of every kind
#[derive(Clone)]
pub struct StepDispatcher {
    exec: Arc<ExecutionContext>,
}

impl StepDispatcher {
    pub fn new(exec: Arc<ExecutionContext>) -> Self {
        Self { exec }
    }

    /// Run a step, following deferred hand-offs
    pub fn dispatch<'a>(&'a self, step: &'a StepConfig, run: &'a mut RunContext) -> StepFuture<'a> {
        Box::pin(async move {
            let started = Instant::now();
            let max_hops = self.exec.config.defaults.max_deferred_hops;
            let mut current: Cow<'a, StepConfig> = Cow::Borrowed(step);
            let mut hops = 0;

            loop {
                tracing::debug!(step = %current.name, kind = current.kind().label(), "dispatching step");
                let mut result = self.execute(&current, run).await?;

                if let Some(request) = deferred_request(&run.workflow, &result.output) {
                    hops += 1;
                    if hops > max_hops {
                        return Err(StepError::DeferredHopsExceeded {
                            step: step.name.clone(),
                            max: max_hops,
                        });
                    }
                    let Some(target) = run.workflow.deferred.get(&request.step) else {
                        return Err(StepError::UnknownDeferred {
                            step: current.name.clone(),
                            target: request.step,
                        });
                    };
                    tracing::info!(step = %current.name, deferred = %request.step, hop = hops, "handing off to deferred step");
                    let mut next = target.clone();
                    next.input = Some(InputSpec::Single(STDIN.into()));
                    run.last_output = request.input;
                    current = Cow::Owned(next);
                    continue;
                }

                self.write_outputs(&current, &result, run).await?;
                if current.memory {
                    self.remember(&current, run, &result.output)?;
                }
                run.record_output(&current.name, &result.output);
                if current.name != step.name {
                    run.step_outputs
                        .insert(step.name.clone(), result.output.clone());
                }

                result.duration = started.elapsed();
                tracing::info!(
                    step = %step.name,
                    kind = result.kind,
                    items = result.total_items(),
                    failures = result.failures.len(),
                    duration_ms = result.duration.as_millis() as u64,
                    "step completed"
                );
                return Ok(result);
            }
        })
    }

    async fn execute(&self, step: &StepConfig, run: &mut RunContext) -> Result<StepResult, StepError> {
        match step.kind() {
            StepKind::Api(api) => self.run_api(step, api, run).await,
            StepKind::Generate(generate) => self.run_generate(step, generate, run).await,
            StepKind::Process(process) => self.run_process(step, process, run).await,
            StepKind::InlineLoop(config) => {
                let initial = resolve_input(&self.exec, step, run).await?.combined();
                let outcome = AgenticLoopEngine::new(self.exec.clone(), step.name.clone(), config)
                    .run(run, initial)
                    .await
                    .map_err(|e| StepError::Loop {
                        step: step.name.clone(),
                        source: Box::new(e),
                    })?;
                Ok(StepResult::single(step, "agentic_loop", outcome.output))
            }
            StepKind::RepoIndex(index) => self.run_repo_index(step, index, run).await,
            StepKind::Standard => self.run_standard(step, run).await,
        }
    }

    async fn run_standard(&self, step: &StepConfig, run: &RunContext) -> Result<StepResult, StepError> {
        let call = ModelCall {
            model: run.render(&self.exec.templates, required(step, step.model.as_deref(), "model")?)?,
            action: run.render(&self.exec.templates, required(step, step.action.as_deref(), "action")?)?,
            system: None,
            temperature: None,
            max_tokens: None,
        };
        let input = resolve_input(&self.exec, step, run).await?;
        self.call_model(step, "standard", &call, &input, run).await
    }

    async fn run_api(
        &self,
        step: &StepConfig,
        api: &ApiStepConfig,
        run: &RunContext,
    ) -> Result<StepResult, StepError> {
        let templates = &self.exec.templates;
        let call = ModelCall {
            model: run.render(templates, required(step, api.model.as_deref(), "api.model")?)?,
            action: run.render(templates, required(step, api.action.as_deref(), "api.action")?)?,
            system: api
                .system
                .as_deref()
                .map(|s| run.render(templates, s))
                .transpose()?,
            temperature: api.temperature,
            max_tokens: api.max_tokens,
        };
        let input = resolve_input(&self.exec, step, run).await?;
        let mut result = self.call_model(step, "api", &call, &input, run).await?;

        if api.response_format == ResponseFormat::Json {
            for item in result.items.iter_mut() {
                let json = extract_json(&item.output).ok_or_else(|| StepError::InvalidJson {
                    step: step.name.clone(),
                    message: format!("no JSON found in output for {}", item.source),
                })?;
                item.output = serde_json::to_string_pretty(&json).map_err(|e| StepError::InvalidJson {
                    step: step.name.clone(),
                    message: e.to_string(),
                })?;
            }
            result.output = combine(&result.items, result.fan_out);
        }
        Ok(result)
    }

    /// Send the action over every input item
    async fn call_model(
        &self,
        step: &StepConfig,
        kind: &'static str,
        call: &ModelCall,
        input: &ResolvedInput,
        run: &RunContext,
    ) -> Result<StepResult, StepError> {
        let provider = self
            .exec
            .providers
            .get(&call.model)
            .map_err(|source| StepError::Provider {
                step: step.name.clone(),
                model: call.model.clone(),
                source,
            })?;
        let memory = if step.memory { self.memory_context(step, run)? } else { None };

        let mut items = Vec::new();
        let mut failures = Vec::new();
        for (index, item) in input.items.iter().enumerate() {
            let request = build_request(call, item, memory.as_deref(), provider.as_ref(), run);
            match provider.complete(&request).await {
                Ok(response) => items.push(ItemOutput {
                    index,
                    source: item.source.clone(),
                    output: response.text,
                }),
                Err(e) if input.fan_out => {
                    tracing::warn!(step = %step.name, source = %item.source, error = %e, "input item failed");
                    failures.push(ItemFailure {
                        index,
                        source: item.source.clone(),
                        error: e.to_string(),
                    });
                }
                Err(source) => {
                    return Err(StepError::Provider {
                        step: step.name.clone(),
                        model: call.model.clone(),
                        source,
                    });
                }
            }
        }

        if let Some(first) = failures.first() {
            if items.is_empty() {
                return Err(StepError::AllFailed {
                    step: step.name.clone(),
                    count: failures.len(),
                    first: first.error.clone(),
                });
            }
            if !step.tolerate_partial_failure {
                return Err(StepError::PartialFailure {
                    step: step.name.clone(),
                    failed: failures.len(),
                    total: input.items.len(),
                    first: first.error.clone(),
                });
            }
        }

        Ok(StepResult {
            step: step.name.clone(),
            kind,
            output: combine(&items, input.fan_out),
            items,
            failures,
            fan_out: input.fan_out,
            model: Some(call.model.clone()),
            duration: Duration::ZERO,
        })
    }

    async fn run_generate(
        &self,
        step: &StepConfig,
        generate: &GenerateConfig,
        run: &RunContext,
    ) -> Result<StepResult, StepError> {
        let templates = &self.exec.templates;
        let call = ModelCall {
            model: run.render(templates, required(step, generate.model.as_deref(), "generate.model")?)?,
            action: run.render(templates, required(step, generate.action.as_deref(), "generate.action")?)?,
            system: None,
            temperature: None,
            max_tokens: None,
        };
        let target = run.render(templates, required(step, generate.output.as_deref(), "generate.output")?)?;

        let context = resolve_input(&self.exec, step, run).await?;
        let item = InputItem::text("context", context.combined());
        let single = ResolvedInput {
            items: vec![item],
            fan_out: false,
        };
        let response = self.call_model(step, "generate", &call, &single, run).await?;

        let text = extract_code_block(&response.output, &["toml", ""])
            .unwrap_or_else(|| response.output.trim().to_string());
        let workflow = WorkflowConfig::from_toml(&text).map_err(|e| StepError::InvalidGenerated {
            step: step.name.clone(),
            message: e.to_string(),
        })?;
        validate(&workflow).map_err(|e| StepError::InvalidGenerated {
            step: step.name.clone(),
            message: e.to_string(),
        })?;

        let path = run.resolve_path(target.trim());
        write_file(&step.name, &path, &text).await?;
        tracing::info!(step = %step.name, path = %path.display(), "wrote generated workflow");

        let mut result = StepResult::single(step, "generate", text);
        result.model = Some(call.model);
        Ok(result)
    }

    async fn run_process(
        &self,
        step: &StepConfig,
        process: &ProcessConfig,
        run: &mut RunContext,
    ) -> Result<StepResult, StepError> {
        let raw = required(step, process.workflow.as_deref(), "process.workflow")?;
        let rendered = run.render(&self.exec.templates, raw)?;
        let expanded = shellexpand::tilde(rendered.trim()).into_owned();
        let path = run.workflow_dir().join(expanded);

        let child = load_workflow_file(&path).map_err(|e| StepError::SubWorkflow {
            step: step.name.clone(),
            source: Box::new(WorkflowError::Load {
                path: path.clone(),
                message: format!("{:#}", e),
            }),
        })?;

        let child_vars = VariableStore::new();
        for (name, value) in &process.input_map {
            let value = match as_var_ref(value) {
                Some(parent) => run.variables.get(parent).ok_or_else(|| StepError::UndefinedVariable {
                    step: step.name.clone(),
                    name: parent.to_string(),
                })?,
                None => run.render(&self.exec.templates, value)?,
            };
            child_vars.set(name.clone(), value);
        }
        let initial = resolve_input(&self.exec, step, run).await?.combined();

        let mut child_run = RunContext::new(Arc::new(child), run.working_dir.clone())
            .with_workflow_path(Some(path.clone()))
            .with_variables(child_vars)
            .with_input(initial);
        child_run.cli_vars = run.cli_vars.clone();

        tracing::info!(step = %step.name, workflow = %path.display(), "running sub-workflow");
        WorkflowRunner::new(self.exec.clone())
            .run_in_context(&mut child_run)
            .await
            .map_err(|e| StepError::SubWorkflow {
                step: step.name.clone(),
                source: Box::new(e),
            })?;

        for (parent, child_name) in &process.output_map {
            let value = child_run
                .variables
                .get(child_name)
                .ok_or_else(|| StepError::UndefinedVariable {
                    step: step.name.clone(),
                    name: child_name.clone(),
                })?;
            run.variables.set(parent.clone(), value);
        }
        run.console.append(&mut child_run.console);

        Ok(StepResult::single(step, "process", child_run.last_output))
    }

    async fn run_repo_index(
        &self,
        step: &StepConfig,
        index: &RepoIndexConfig,
        run: &RunContext,
    ) -> Result<StepResult, StepError> {
        let label = run.render(&self.exec.templates, &index.path)?;
        let root = run.resolve_path(label.trim());
        if !root.is_dir() {
            return Err(StepError::RepoIndex {
                step: step.name.clone(),
                message: format!("{} is not a directory", root.display()),
            });
        }

        let extensions = index.extensions.clone();
        let max_files = index.max_files;
        let text = tokio::task::spawn_blocking(move || {
            build_repo_index(&root, &label, &extensions, max_files)
        })
        .await
        .map_err(|e| StepError::RepoIndex {
            step: step.name.clone(),
            message: e.to_string(),
        })?
        .map_err(|e| StepError::RepoIndex {
            step: step.name.clone(),
            message: e.to_string(),
        })?;

        Ok(StepResult::single(step, "index_repo", text))
    }

    async fn write_outputs(
        &self,
        step: &StepConfig,
        result: &StepResult,
        run: &mut RunContext,
    ) -> Result<(), StepError> {
        let Some(ref spec) = step.output else {
            return Ok(());
        };
        match spec {
            OutputSpec::Single(target) => self.write_target(step, target, &result.output, run).await,
            OutputSpec::Many(targets) => {
                if targets.len() != result.total_items() {
                    return Err(StepError::OutputMismatch {
                        step: step.name.clone(),
                        outputs: targets.len(),
                        items: result.total_items(),
                    });
                }
                for item in &result.items {
                    self.write_target(step, &targets[item.index], &item.output, run)
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn write_target(
        &self,
        step: &StepConfig,
        target: &str,
        text: &str,
        run: &mut RunContext,
    ) -> Result<(), StepError> {
        let rendered = run.render_template(&self.exec.templates, target)?;
        let rendered = rendered.trim();
        if rendered == STDOUT {
            run.console.push(text.to_string());
            return Ok(());
        }
        if let Some(name) = as_var_ref(rendered) {
            tracing::debug!(step = %step.name, variable = name, "storing output");
            run.variables.set(name, text);
            return Ok(());
        }
        let path = run.resolve_path(&run.variables.substitute(rendered));
        write_file(&step.name, &path, text).await?;
        tracing::debug!(step = %step.name, path = %path.display(), "wrote output");
        Ok(())
    }

    fn memory_context(&self, step: &StepConfig, run: &RunContext) -> Result<Option<String>, StepError> {
        let Some(ref memory) = self.exec.memory else {
            return Ok(None);
        };
        let store = memory.lock().unwrap_or_else(|e| e.into_inner());
        let entries = store
            .recent(run.workflow_name(), MEMORY_CONTEXT_ENTRIES)
            .map_err(|e| StepError::Memory {
                step: step.name.clone(),
                message: format!("{:#}", e),
            })?;
        Ok((!entries.is_empty()).then(|| format_memory_context(&entries)))
    }

    fn remember(&self, step: &StepConfig, run: &RunContext, output: &str) -> Result<(), StepError> {
        let Some(ref memory) = self.exec.memory else {
            tracing::debug!(step = %step.name, "memory requested but no store configured");
            return Ok(());
        };
        let mut store = memory.lock().unwrap_or_else(|e| e.into_inner());
        store
            .append(run.workflow_name(), &step.name, output)
            .map_err(|e| StepError::Memory {
                step: step.name.clone(),
                message: format!("{:#}", e),
            })?;
        Ok(())
    }
}

fn required<'a>(step: &StepConfig, value: Option<&'a str>, field: &'static str) -> Result<&'a str, StepError> {
    value.ok_or_else(|| StepError::MissingField {
        step: step.name.clone(),
        field,
    })
}

/// Parse a hand-off request, only when the workflow has deferred steps
fn deferred_request(workflow: &WorkflowConfig, output: &str) -> Option<DeferredRequest> {
    if workflow.deferred.is_empty() {
        return None;
    }
    let trimmed = output.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn build_request(
    call: &ModelCall,
    item: &InputItem,
    memory: Option<&str>,
    provider: &dyn ModelProvider,
    run: &RunContext,
) -> ProviderRequest {
    let mut prompt = String::new();
    if let Some(memory) = memory {
        prompt.push_str(memory);
        prompt.push('\n');
    }
    prompt.push_str(&call.action);

    let mut request = ProviderRequest::default().with_working_dir(run.working_dir.clone());
    match item.path {
        Some(ref path) if provider.supports_attachments() => {
            request = request.with_attachment(path.clone());
        }
        _ if !item.content.is_empty() => {
            prompt.push_str("\n\n");
            prompt.push_str(&item.content);
        }
        _ => {}
    }
    request.prompt = prompt;
    request.system = call.system.clone();
    request.temperature = call.temperature;
    request.max_tokens = call.max_tokens;
    request
}

/// One output for a single item; labelled sections for a fan-out
fn combine(items: &[ItemOutput], fan_out: bool) -> String {
    if !fan_out {
        return items.first().map(|i| i.output.clone()).unwrap_or_default();
    }
    items
        .iter()
        .map(|i| format!("### {}\n{}", i.source, i.output.trim_end()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn write_file(step: &str, path: &std::path::Path, text: &str) -> Result<(), StepError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StepError::io(step, parent, e))?;
    }
    tokio::fs::write(path, text)
        .await
        .map_err(|e| StepError::io(step, path, e))
}
