//! Step configuration and kind resolution

use super::agentic::AgenticLoopConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker input meaning "the previous step's output"
pub const STDIN: &str = "STDIN";

/// Marker input meaning "no input"
pub const NO_INPUT: &str = "NA";

/// Marker output meaning "print to the console"
pub const STDOUT: &str = "STDOUT";

/// Typed input kinds
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// Run a shell command, previous output piped to stdin
    Tool,
    /// Inline text
    Text,
    /// A single file path
    File,
}

/// Where a step reads its input from
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum InputSpec {
    /// `STDIN`, `NA`, `$VAR`, a file or a directory
    Single(String),
    /// Several files, each processed individually
    Many(Vec<String>),
    /// Explicitly typed input
    Typed {
        #[serde(rename = "type")]
        kind: InputKind,
        value: String,
    },
}

impl InputSpec {
    /// Names this input refers to, for dependency inference
    pub fn references(&self) -> Vec<&str> {
        match self {
            InputSpec::Single(s) => vec![s.as_str()],
            InputSpec::Many(items) => items.iter().map(|s| s.as_str()).collect(),
            InputSpec::Typed {
                kind: InputKind::File,
                value,
            } => vec![value.as_str()],
            InputSpec::Typed { .. } => Vec::new(),
        }
    }
}

impl Default for InputSpec {
    fn default() -> Self {
        InputSpec::Single(STDIN.into())
    }
}

/// Where a step writes its output
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OutputSpec {
    /// `STDOUT`, `$VAR` or a file path
    Single(String),
    /// One target per fanned-out input
    Many(Vec<String>),
}

impl OutputSpec {
    /// All output targets
    pub fn targets(&self) -> Vec<&str> {
        match self {
            OutputSpec::Single(s) => vec![s.as_str()],
            OutputSpec::Many(items) => items.iter().map(|s| s.as_str()).collect(),
        }
    }

    /// Targets that are not the console
    pub fn non_console_targets(&self) -> Vec<&str> {
        self.targets().into_iter().filter(|t| *t != STDOUT).collect()
    }
}

/// Line-bounded chunking of text input
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChunkingConfig {
    /// Maximum characters per chunk
    pub max_chars: usize,
}

/// Per-step tool permissions, merged with engine defaults
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolPermissions {
    #[serde(default)]
    pub allowed: Vec<String>,

    #[serde(default)]
    pub denied: Vec<String>,
}

impl ToolPermissions {
    /// Merge another permission set into this one
    pub fn merged(&self, other: &ToolPermissions) -> ToolPermissions {
        let mut merged = self.clone();
        for a in &other.allowed {
            if !merged.allowed.contains(a) {
                merged.allowed.push(a.clone());
            }
        }
        for d in &other.denied {
            if !merged.denied.contains(d) {
                merged.denied.push(d.clone());
            }
        }
        merged
    }
}

/// Response format for API steps
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// Specialized API call with structured parameters
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ApiStepConfig {
    pub model: Option<String>,
    pub action: Option<String>,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub response_format: ResponseFormat,
}

/// Ask a model to write a new workflow definition
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GenerateConfig {
    pub model: Option<String>,
    pub action: Option<String>,
    /// File the generated workflow is written to
    pub output: Option<String>,
}

/// Run another workflow file as a sub-workflow
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    pub workflow: Option<String>,

    /// Child variable name -> parent value (`$VAR` or literal)
    #[serde(default)]
    pub input_map: BTreeMap<String, String>,

    /// Parent variable name <- child variable name
    #[serde(default)]
    pub output_map: BTreeMap<String, String>,
}

/// Build a file index of a repository
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RepoIndexConfig {
    #[serde(default = "default_index_path")]
    pub path: String,

    /// Only include these extensions (without the dot); empty means all
    #[serde(default)]
    pub extensions: Vec<String>,

    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_index_path() -> String {
    ".".into()
}

fn default_max_files() -> usize {
    1000
}

impl Default for RepoIndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            extensions: Vec::new(),
            max_files: default_max_files(),
        }
    }
}

/// Configuration for a workflow step
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Step name (filled from the map key for deferred steps)
    #[serde(default)]
    pub name: String,

    pub input: Option<InputSpec>,
    pub model: Option<String>,
    pub action: Option<String>,
    pub output: Option<OutputSpec>,

    pub chunking: Option<ChunkingConfig>,
    pub tools: Option<ToolPermissions>,

    /// Inject and append persistent memory context
    #[serde(default)]
    pub memory: bool,

    /// Only an all-failed fan-out is fatal
    #[serde(default)]
    pub tolerate_partial_failure: bool,

    pub api: Option<ApiStepConfig>,
    pub generate: Option<GenerateConfig>,
    pub process: Option<ProcessConfig>,
    pub agentic_loop: Option<Box<AgenticLoopConfig>>,
    pub index_repo: Option<RepoIndexConfig>,
}

/// A step resolved to exactly one kind
#[derive(Debug, Clone, Copy)]
pub enum StepKind<'a> {
    Api(&'a ApiStepConfig),
    Generate(&'a GenerateConfig),
    Process(&'a ProcessConfig),
    InlineLoop(&'a AgenticLoopConfig),
    RepoIndex(&'a RepoIndexConfig),
    Standard,
}

impl StepKind<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Api(_) => "api",
            StepKind::Generate(_) => "generate",
            StepKind::Process(_) => "process",
            StepKind::InlineLoop(_) => "agentic_loop",
            StepKind::RepoIndex(_) => "index_repo",
            StepKind::Standard => "standard",
        }
    }
}

impl StepConfig {
    /// Resolve the step kind, in dispatch precedence order
    pub fn kind(&self) -> StepKind<'_> {
        if let Some(ref api) = self.api {
            StepKind::Api(api)
        } else if let Some(ref generate) = self.generate {
            StepKind::Generate(generate)
        } else if let Some(ref process) = self.process {
            StepKind::Process(process)
        } else if let Some(ref agentic) = self.agentic_loop {
            StepKind::InlineLoop(agentic)
        } else if let Some(ref index) = self.index_repo {
            StepKind::RepoIndex(index)
        } else {
            StepKind::Standard
        }
    }

    /// Names of every kind this step declares fields for
    pub fn declared_kinds(&self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        if self.api.is_some() {
            kinds.push("api");
        }
        if self.generate.is_some() {
            kinds.push("generate");
        }
        if self.process.is_some() {
            kinds.push("process");
        }
        if self.agentic_loop.is_some() {
            kinds.push("agentic_loop");
        }
        if self.index_repo.is_some() {
            kinds.push("index_repo");
        }
        if self.model.is_some() || self.action.is_some() {
            kinds.push("standard");
        }
        kinds
    }

    /// Input, defaulting to the previous output
    pub fn input_or_stdin(&self) -> InputSpec {
        self.input.clone().unwrap_or_default()
    }

    /// Every file or variable this step writes
    pub fn produced_outputs(&self) -> Vec<String> {
        let mut produced: Vec<String> = self
            .output
            .as_ref()
            .map(|o| {
                o.non_console_targets()
                    .into_iter()
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        if let Some(ref generate) = self.generate {
            if let Some(ref out) = generate.output {
                produced.push(out.clone());
            }
        }
        if let Some(ref process) = self.process {
            produced.extend(process.output_map.keys().map(|k| format!("${}", k)));
        }
        produced
    }
}
