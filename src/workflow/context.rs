//! Execution and run contexts
//!
//! `ExecutionContext` holds everything shared by a whole invocation
//! (config, providers, tools, templates, memory, checkpoints).
//! `RunContext` is the mutable per-run state threaded through steps.

use super::error::StepError;
use super::loop_state::LoopStateManager;
use super::variables::VariableStore;
use crate::config::{EngineConfig, WorkflowConfig};
use crate::memory::MemoryStore;
use crate::provider::ProviderRegistry;
use crate::template::{TemplateContext, TemplateEngine};
use crate::tools::{ShellToolExecutor, ToolExecutor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared collaborators for one engine invocation
pub struct ExecutionContext {
    pub config: Arc<EngineConfig>,
    pub providers: ProviderRegistry,
    pub tools: Arc<dyn ToolExecutor>,
    pub templates: TemplateEngine,
    pub memory: Option<Arc<Mutex<MemoryStore>>>,
    pub state_manager: LoopStateManager,

    /// Resume stateful loops from their checkpoints
    pub resume: bool,
}

impl ExecutionContext {
    pub fn new(config: Arc<EngineConfig>, providers: ProviderRegistry, base_dir: &Path) -> Self {
        let state_manager = LoopStateManager::new(config.state_dir(base_dir));
        Self {
            tools: Arc::new(
                ShellToolExecutor::new(base_dir)
                    .with_timeout(std::time::Duration::from_secs(config.defaults.timeout)),
            ),
            config,
            providers,
            templates: TemplateEngine::new(),
            memory: None,
            state_manager,
            resume: false,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_memory(mut self, memory: MemoryStore) -> Self {
        self.memory = Some(Arc::new(Mutex::new(memory)));
        self
    }

    pub fn with_state_manager(mut self, manager: LoopStateManager) -> Self {
        self.state_manager = manager;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// Mutable state of one workflow run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub workflow: Arc<WorkflowConfig>,
    pub workflow_path: Option<PathBuf>,
    pub working_dir: PathBuf,

    /// Shared with every fork of this context
    pub variables: VariableStore,

    pub cli_vars: Arc<HashMap<String, String>>,

    /// Output of the most recent step, fed to the next `STDIN` input
    pub last_output: String,

    /// Step name -> output, for `{{ steps.<name> }}`
    pub step_outputs: HashMap<String, String>,

    /// Text written to `STDOUT` outputs, in order
    pub console: Vec<String>,

    /// `{{ loop.* }}` values of the innermost running loop, private to this fork
    pub loop_vars: HashMap<String, String>,
}

impl RunContext {
    pub fn new(workflow: Arc<WorkflowConfig>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            workflow,
            workflow_path: None,
            working_dir: working_dir.into(),
            variables: VariableStore::new(),
            cli_vars: Arc::new(HashMap::new()),
            last_output: String::new(),
            step_outputs: HashMap::new(),
            console: Vec::new(),
            loop_vars: HashMap::new(),
        }
    }

    pub fn with_workflow_path(mut self, path: Option<PathBuf>) -> Self {
        self.workflow_path = path;
        self
    }

    pub fn with_cli_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.cli_vars = Arc::new(vars);
        self
    }

    pub fn with_variables(mut self, variables: VariableStore) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.last_output = input.into();
        self
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow.name
    }

    /// Private copy for a parallel worker; only the variable store is shared
    pub fn fork(&self) -> Self {
        Self {
            console: Vec::new(),
            ..self.clone()
        }
    }

    /// Template context for the current state of the run
    pub fn template_context(&self) -> TemplateContext {
        let mut ctx = TemplateContext::with_cli_vars((*self.cli_vars).clone())
            .with_variables(self.variables.snapshot())
            .with_loop_vars(self.loop_vars.clone());
        for (name, output) in &self.step_outputs {
            ctx.add_step(name.clone(), output.clone());
        }
        ctx.set_workflow(self.workflow.name.clone());
        ctx
    }

    /// Render templates, then substitute `$VAR` references
    pub fn render(&self, templates: &TemplateEngine, text: &str) -> Result<String, StepError> {
        let rendered = self.render_template(templates, text)?;
        Ok(self.variables.substitute(&rendered))
    }

    /// Render templates only, leaving `$VAR` references in place
    pub fn render_template(
        &self,
        templates: &TemplateEngine,
        text: &str,
    ) -> Result<String, StepError> {
        if !TemplateEngine::needs_render(text) {
            return Ok(text.to_string());
        }
        Ok(templates.render(text, &self.template_context())?)
    }

    /// Resolve a path against the working directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        let path = Path::new(expanded.as_ref());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Directory relative sub-workflow paths are resolved against
    pub fn workflow_dir(&self) -> PathBuf {
        self.workflow_path
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.working_dir.clone())
    }

    /// Record a finished step
    pub fn record_output(&mut self, step: &str, output: &str) {
        self.step_outputs.insert(step.to_string(), output.to_string());
        self.last_output = output.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> RunContext {
        let workflow = WorkflowConfig {
            name: "demo".into(),
            ..Default::default()
        };
        RunContext::new(Arc::new(workflow), "/work")
    }

    #[test]
    fn test_fork_shares_variables_only() {
        let mut parent = run();
        parent.console.push("printed".into());
        let mut child = parent.fork();

        child.variables.set("X", "1");
        child.step_outputs.insert("a".into(), "out".into());

        child.loop_vars.insert("iteration".into(), "2".into());

        assert_eq!(parent.variables.get("X").as_deref(), Some("1"));
        assert!(parent.step_outputs.is_empty());
        assert!(parent.loop_vars.is_empty());
        assert!(child.console.is_empty());
    }

    #[test]
    fn test_render_templates_then_vars() {
        let mut ctx = run().with_cli_vars(HashMap::from([("topic".into(), "rust".into())]));
        ctx.variables.set("DIR", "out");
        ctx.record_output("fetch", "data");
        let templates = TemplateEngine::new();

        let rendered = ctx
            .render(&templates, "{{ topic }} {{ steps.fetch }} $DIR/{{ workflow }}")
            .unwrap();
        assert_eq!(rendered, "rust data out/demo");
    }

    #[test]
    fn test_resolve_path() {
        let ctx = run();
        assert_eq!(ctx.resolve_path("a/b.md"), PathBuf::from("/work/a/b.md"));
        assert_eq!(ctx.resolve_path("/abs"), PathBuf::from("/abs"));
    }

    #[test]
    fn test_workflow_dir() {
        let ctx = run();
        assert_eq!(ctx.workflow_dir(), PathBuf::from("/work"));
        let ctx = run().with_workflow_path(Some(PathBuf::from("/flows/main.toml")));
        assert_eq!(ctx.workflow_dir(), PathBuf::from("/flows"));
    }
}
