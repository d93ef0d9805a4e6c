//! Configuration loading with multi-layer merge

use super::{ModelConfig, ToolPermissions, WorkflowConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Global defaults
    #[serde(default)]
    pub defaults: Defaults,

    /// Model definitions, referenced by name from steps
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Engine-wide tool permissions, merged with per-step permissions
    #[serde(default)]
    pub tools: ToolPermissions,
}

/// Global default settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Directory holding loop checkpoints
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// SQLite file used for step memory
    #[serde(default = "default_memory_db")]
    pub memory_db: String,

    /// Maximum deferred step hand-offs per dispatch
    #[serde(default = "default_max_deferred_hops")]
    pub max_deferred_hops: usize,

    /// Default provider timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_state_dir() -> String {
    ".llmflow/state".into()
}

fn default_memory_db() -> String {
    ".llmflow/memory.db".into()
}

fn default_max_deferred_hops() -> usize {
    8
}

fn default_timeout() -> u64 {
    300
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            memory_db: default_memory_db(),
            max_deferred_hops: default_max_deferred_hops(),
            timeout: default_timeout(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/llm-flow/config.toml
    /// 3. .llmflow/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(user_config_path) = Self::user_config_path()
            && user_config_path.exists()
        {
            let user_config = Self::load_file(&user_config_path)
                .with_context(|| format!("loading {}", user_config_path.display()))?;
            config.merge(user_config);
        }

        let project_config_path = project_dir
            .map(|p| p.join(".llmflow/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".llmflow/config.toml"));

        if project_config_path.exists() {
            let project_config = Self::load_file(&project_config_path)
                .with_context(|| format!("loading {}", project_config_path.display()))?;
            config.merge(project_config);
        }

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Get the user config path (~/.config/llm-flow/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("llm-flow/config.toml"))
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: Self) {
        if other.defaults.state_dir != default_state_dir() {
            self.defaults.state_dir = other.defaults.state_dir;
        }
        if other.defaults.memory_db != default_memory_db() {
            self.defaults.memory_db = other.defaults.memory_db;
        }
        if other.defaults.max_deferred_hops != default_max_deferred_hops() {
            self.defaults.max_deferred_hops = other.defaults.max_deferred_hops;
        }
        if other.defaults.timeout != default_timeout() {
            self.defaults.timeout = other.defaults.timeout;
        }

        for (name, model) in other.models {
            self.models.insert(name, model);
        }

        self.tools = self.tools.merged(&other.tools);
    }

    /// Get a model by name
    pub fn get_model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    /// Get all enabled models
    pub fn enabled_models(&self) -> impl Iterator<Item = (&String, &ModelConfig)> {
        self.models.iter().filter(|(_, m)| m.enabled)
    }

    /// State directory with `~` expanded, relative to `base` when not absolute
    pub fn state_dir(&self, base: &Path) -> PathBuf {
        expand_under(&self.defaults.state_dir, base)
    }

    /// Memory database path with `~` expanded, relative to `base` when not absolute
    pub fn memory_db(&self, base: &Path) -> PathBuf {
        expand_under(&self.defaults.memory_db, base)
    }
}

fn expand_under(raw: &str, base: &Path) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(raw).into_owned());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Load a workflow by path or name
///
/// Search order (first match wins):
/// 1. The argument as a file path
/// 2. .llmflow/workflows/{name}.toml (project)
/// 3. ~/.config/llm-flow/workflows/{name}.toml (user)
///
/// Returns the workflow along with the file it came from.
pub fn load_workflow(name: &str, project_dir: Option<&Path>) -> Result<(WorkflowConfig, PathBuf)> {
    let direct = PathBuf::from(shellexpand::tilde(name).into_owned());
    if direct.is_file() {
        return Ok((load_workflow_file(&direct)?, direct));
    }

    let filename = format!("{}.toml", name);

    let project_path = project_dir
        .map(|p| p.join(".llmflow/workflows").join(&filename))
        .unwrap_or_else(|| PathBuf::from(".llmflow/workflows").join(&filename));

    if project_path.exists() {
        return Ok((load_workflow_file(&project_path)?, project_path));
    }

    if let Some(user_dir) = dirs::config_dir() {
        let user_path = user_dir.join("llm-flow/workflows").join(&filename);
        if user_path.exists() {
            return Ok((load_workflow_file(&user_path)?, user_path));
        }
    }

    anyhow::bail!("workflow '{}' not found", name)
}

/// Parse a workflow file without validating it
pub fn load_workflow_file(path: &Path) -> Result<WorkflowConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut workflow = WorkflowConfig::from_toml(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;

    if workflow.name.is_empty()
        && let Some(stem) = path.file_stem()
    {
        workflow.name = stem.to_string_lossy().into_owned();
    }

    Ok(workflow)
}
