//! Step input resolution
//!
//! Turns an `InputSpec` into the concrete items a step is run over. A
//! directory, a list of files or chunking all fan out into several items.

use super::context::{ExecutionContext, RunContext};
use super::error::StepError;
use super::variables::as_var_ref;
use crate::config::{InputKind, InputSpec, NO_INPUT, STDIN, StepConfig, ToolPermissions};
use std::path::{Path, PathBuf};

/// One unit of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputItem {
    /// Where the content came from, used to label fanned-out results
    pub source: String,
    pub content: String,

    /// Set for whole files, so providers that accept attachments can take the path
    pub path: Option<PathBuf>,
}

impl InputItem {
    pub fn text(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
            path: None,
        }
    }
}

/// Every item a step runs over
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedInput {
    pub items: Vec<InputItem>,

    /// True when each item is processed and reported individually
    pub fan_out: bool,
}

impl ResolvedInput {
    fn single(item: InputItem) -> Self {
        Self {
            items: vec![item],
            fan_out: false,
        }
    }

    /// All item contents joined, for consumers that need one string
    pub fn combined(&self) -> String {
        self.items
            .iter()
            .map(|i| i.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Resolve a step's input, applying chunking if configured
pub async fn resolve_input(
    exec: &ExecutionContext,
    step: &StepConfig,
    run: &RunContext,
) -> Result<ResolvedInput, StepError> {
    let spec = step.input_or_stdin();
    let resolved = resolve_spec(exec, step, run, &spec).await?;
    Ok(match step.chunking {
        Some(ref chunking) => apply_chunking(resolved, chunking.max_chars),
        None => resolved,
    })
}

async fn resolve_spec(
    exec: &ExecutionContext,
    step: &StepConfig,
    run: &RunContext,
    spec: &InputSpec,
) -> Result<ResolvedInput, StepError> {
    match spec {
        InputSpec::Single(raw) => {
            let text = run.render_template(&exec.templates, raw)?;
            let text = text.trim();
            if text == STDIN {
                return Ok(ResolvedInput::single(InputItem::text(
                    STDIN,
                    run.last_output.clone(),
                )));
            }
            if text == NO_INPUT {
                return Ok(ResolvedInput::single(InputItem::text(NO_INPUT, "")));
            }
            if let Some(name) = as_var_ref(text) {
                let value = run
                    .variables
                    .get(name)
                    .ok_or_else(|| StepError::UndefinedVariable {
                        step: step.name.clone(),
                        name: name.to_string(),
                    })?;
                return Ok(ResolvedInput::single(InputItem::text(
                    format!("${}", name),
                    value,
                )));
            }
            let path = run.resolve_path(&run.variables.substitute(text));
            resolve_path_input(&step.name, &path).await
        }
        InputSpec::Many(paths) => {
            let mut items = Vec::with_capacity(paths.len());
            for raw in paths {
                let rendered = run.render(&exec.templates, raw)?;
                let path = run.resolve_path(rendered.trim());
                items.push(read_file_item(&step.name, &path).await?);
            }
            Ok(ResolvedInput {
                items,
                fan_out: true,
            })
        }
        InputSpec::Typed { kind, value } => match kind {
            InputKind::Text => {
                let text = run.render(&exec.templates, value)?;
                Ok(ResolvedInput::single(InputItem::text("text", text)))
            }
            InputKind::File => {
                let rendered = run.render(&exec.templates, value)?;
                let path = run.resolve_path(rendered.trim());
                resolve_path_input(&step.name, &path).await
            }
            InputKind::Tool => {
                let command = run.render(&exec.templates, value)?;
                let permissions = exec
                    .config
                    .tools
                    .merged(step.tools.as_ref().unwrap_or(&ToolPermissions::default()));
                let piped = (!run.last_output.is_empty()).then_some(run.last_output.as_str());
                let output = exec
                    .tools
                    .run(&command, piped, &permissions)
                    .await
                    .map_err(|source| StepError::Tool {
                        step: step.name.clone(),
                        source,
                    })?;
                Ok(ResolvedInput::single(InputItem::text(command, output)))
            }
        },
    }
}

/// A file becomes one item, a directory fans out into its files
async fn resolve_path_input(step: &str, path: &Path) -> Result<ResolvedInput, StepError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StepError::InputNotFound {
                step: step.to_string(),
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(StepError::io(step, path, e)),
    };

    if !metadata.is_dir() {
        return Ok(ResolvedInput::single(read_file_item(step, path).await?));
    }

    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| StepError::io(step, path, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StepError::io(step, path, e))?
    {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
        if is_file && !hidden {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut items = Vec::with_capacity(files.len());
    for file in files {
        items.push(read_file_item(step, &file).await?);
    }
    tracing::debug!(step, dir = %path.display(), files = items.len(), "fanning out directory input");
    Ok(ResolvedInput {
        items,
        fan_out: true,
    })
}

async fn read_file_item(step: &str, path: &Path) -> Result<InputItem, StepError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StepError::InputNotFound {
                step: step.to_string(),
                path: path.to_path_buf(),
            }
        } else {
            StepError::io(step, path, e)
        }
    })?;
    Ok(InputItem {
        source: path.display().to_string(),
        content,
        path: Some(path.to_path_buf()),
    })
}

/// Split every item into line-bounded chunks of at most `max_chars`
pub fn apply_chunking(input: ResolvedInput, max_chars: usize) -> ResolvedInput {
    let mut items = Vec::new();
    for item in input.items {
        let chunks = chunk_text(&item.content, max_chars);
        if chunks.len() == 1 {
            items.push(item);
            continue;
        }
        for (i, chunk) in chunks.into_iter().enumerate() {
            items.push(InputItem::text(format!("{}#{}", item.source, i + 1), chunk));
        }
    }
    let fan_out = input.fan_out || items.len() > 1;
    ResolvedInput { items, fan_out }
}

/// Split text on line boundaries; a single overlong line is split by characters
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
