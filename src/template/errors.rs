//! Template error types with suggestions

use thiserror::Error;

/// Template rendering errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Referenced variable doesn't exist
    #[error("undefined variable '{name}' at line {line}{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
    UndefinedVariable {
        name: String,
        line: usize,
        suggestion: Option<String>,
    },

    /// Template syntax error
    #[error("syntax error at line {line}: {message}")]
    SyntaxError { message: String, line: usize },

    /// Filter execution error
    #[error("filter '{filter}' failed: {message}")]
    FilterError { filter: String, message: String },

    /// Wrapped minijinja error
    #[error("template error: {0}")]
    Internal(#[from] minijinja::Error),
}

impl TemplateError {
    /// Create an undefined variable error with an optional suggestion
    pub fn undefined_variable_at(
        name: impl Into<String>,
        line: usize,
        known_vars: &[&str],
    ) -> Self {
        let name = name.into();
        let root = name.split('.').next().unwrap_or(&name).to_string();
        let suggestion = if known_vars.contains(&root.as_str()) {
            None
        } else {
            suggest_correction(&root, known_vars)
        };
        Self::UndefinedVariable {
            name,
            line,
            suggestion,
        }
    }

    /// Create a syntax error
    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self::SyntaxError {
            message: message.into(),
            line,
        }
    }

    /// Create a filter error
    pub fn filter(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FilterError {
            filter: filter.into(),
            message: message.into(),
        }
    }
}

/// Suggest a correction for a typo using Levenshtein distance
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    let max_distance = (typo.len() / 2).max(2);

    candidates
        .iter()
        .map(|c| (levenshtein_distance(typo, c), *c))
        .filter(|(d, _)| *d <= max_distance)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.to_string())
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
