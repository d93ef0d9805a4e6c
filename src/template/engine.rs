//! Template engine for rendering step inputs, actions and outputs

use super::context::TemplateContext;
use super::errors::TemplateError;
use super::filters;
use minijinja::Environment;
use regex::Regex;
use std::sync::LazyLock;

/// Leading dotted path of a `{{ ... }}` expression
static PLACEHOLDER_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{-?\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)")
        .unwrap_or_else(|e| panic!("invalid placeholder regex: {e}"))
});

/// Template rendering engine
///
/// Wraps minijinja with custom filters and strict undefined handling.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        filters::register_filters(&mut env);
        Self { env }
    }

    /// True if the text contains template markup
    pub fn needs_render(text: &str) -> bool {
        text.contains("{{") || text.contains("{%")
    }

    /// Render a template string with the given context
    ///
    /// Plain text without markup is returned unchanged, so prompts that
    /// merely mention braces are never reparsed.
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
        if !Self::needs_render(template) {
            return Ok(template.to_string());
        }

        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| TemplateError::syntax(e.to_string(), e.line().unwrap_or(0)))?;

        tmpl.render(ctx.to_value())
            .map_err(|e| convert_minijinja_error(e, template, ctx))
    }

    /// Check if a template is syntactically valid
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        if !Self::needs_render(template) {
            return Ok(());
        }
        self.env
            .template_from_str(template)
            .map(|_| ())
            .map_err(|e| TemplateError::syntax(e.to_string(), e.line().unwrap_or(0)))
    }
}

fn convert_minijinja_error(
    err: minijinja::Error,
    template: &str,
    ctx: &TemplateContext,
) -> TemplateError {
    let line = err.line().unwrap_or(0);

    match err.kind() {
        minijinja::ErrorKind::UndefinedError => {
            let name = err
                .detail()
                .and_then(extract_var_from_detail)
                .or_else(|| undefined_placeholder(template, line, ctx))
                .unwrap_or_else(|| "unknown".to_string());
            TemplateError::undefined_variable_at(name, line, &ctx.known_variables())
        }
        minijinja::ErrorKind::UnknownFilter => {
            TemplateError::filter("unknown", err.to_string())
        }
        minijinja::ErrorKind::SyntaxError => TemplateError::syntax(err.to_string(), line),
        _ => TemplateError::Internal(err),
    }
}

/// Pull the variable name out of a detail like "variable is `steps.foo`"
fn extract_var_from_detail(detail: &str) -> Option<String> {
    let start = detail.find('`')?;
    let end = detail[start + 1..].find('`')?;
    Some(detail[start + 1..start + 1 + end].to_string())
}

/// Placeholder on `line` whose root the context cannot resolve,
/// else the first placeholder on that line
fn undefined_placeholder(template: &str, line: usize, ctx: &TemplateContext) -> Option<String> {
    let text = match line {
        0 => template,
        n => template.lines().nth(n - 1).unwrap_or(template),
    };
    let paths: Vec<&str> = PLACEHOLDER_PATH
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let known = ctx.known_variables();
    paths
        .iter()
        .find(|path| {
            let root = path.split('.').next().unwrap_or_default();
            !known.contains(&root)
        })
        .or_else(|| paths.first())
        .map(|path| path.to_string())
}
