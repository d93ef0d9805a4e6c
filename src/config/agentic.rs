//! Agentic loop configuration

use super::step::StepConfig;
use serde::{Deserialize, Serialize};

/// How a loop decides it is finished
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitCondition {
    /// The model emits a completion marker (DONE, COMPLETE, ...)
    #[default]
    LlmDecides,
    /// The output matches `exit_pattern`
    PatternMatch,
}

/// Configuration for one agentic loop
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgenticLoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock limit in seconds; 0 disables it
    #[serde(default)]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub exit_condition: ExitCondition,

    /// Regular expression, required for `pattern_match`
    pub exit_pattern: Option<String>,

    /// How many recent iterations are rendered into the next input
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// How many iterations are retained in memory and checkpoints
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Sub-steps run in order on every iteration
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Loops that must finish before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Variable seeding this loop's initial input
    pub input_state: Option<String>,

    /// Variable receiving this loop's final output
    pub output_state: Option<String>,

    /// Checkpoint runtime state so the loop can be resumed
    #[serde(default)]
    pub stateful: bool,

    /// Iterations between checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_context_window() -> usize {
    5
}

fn default_history_limit() -> usize {
    100
}

fn default_checkpoint_interval() -> u32 {
    1
}

impl Default for AgenticLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            timeout_seconds: 0,
            exit_condition: ExitCondition::default(),
            exit_pattern: None,
            context_window: default_context_window(),
            history_limit: default_history_limit(),
            steps: Vec::new(),
            depends_on: Vec::new(),
            input_state: None,
            output_state: None,
            stateful: false,
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

impl AgenticLoopConfig {
    /// Number of history entries actually retained
    pub fn retained_history(&self) -> usize {
        self.history_limit.max(self.context_window).max(1)
    }

    /// Problems with the exit configuration, if any
    pub fn exit_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match self.exit_condition {
            ExitCondition::PatternMatch => match self.exit_pattern.as_deref() {
                None | Some("") => {
                    problems.push("exit_condition 'pattern_match' requires 'exit_pattern'".into())
                }
                Some(pattern) => {
                    if let Err(e) = regex::Regex::new(pattern) {
                        problems.push(format!("invalid exit_pattern '{}': {}", pattern, e));
                    }
                }
            },
            ExitCondition::LlmDecides => {}
        }
        if self.max_iterations == 0 {
            problems.push("max_iterations must be at least 1".into());
        }
        if self.checkpoint_interval == 0 {
            problems.push("checkpoint_interval must be at least 1".into());
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AgenticLoopConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.timeout_seconds, 0);
        assert_eq!(config.exit_condition, ExitCondition::LlmDecides);
        assert_eq!(config.context_window, 5);
        assert!(!config.stateful);
        assert!(config.exit_problems().is_empty());
    }

    #[test]
    fn test_pattern_match_requires_pattern() {
        let config = AgenticLoopConfig {
            exit_condition: ExitCondition::PatternMatch,
            ..Default::default()
        };
        let problems = config.exit_problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("exit_pattern"));

        let config = AgenticLoopConfig {
            exit_condition: ExitCondition::PatternMatch,
            exit_pattern: Some("(unclosed".into()),
            ..Default::default()
        };
        assert!(config.exit_problems()[0].contains("invalid exit_pattern"));
    }

    #[test]
    fn test_dag_fields() {
        let toml = r#"
            max_iterations = 3
            exit_condition = "pattern_match"
            exit_pattern = "CODE_REVIEW_\\d+_DONE"
            depends_on = ["research"]
            input_state = "FINDINGS"
            output_state = "REVIEW"
            stateful = true

            [[steps]]
            name = "review"
            model = "claude"
            action = "Review"
        "#;
        let config: AgenticLoopConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.depends_on, vec!["research"]);
        assert_eq!(config.input_state.as_deref(), Some("FINDINGS"));
        assert_eq!(config.steps.len(), 1);
        assert!(config.exit_problems().is_empty());
    }

    #[test]
    fn test_retained_history_never_below_window() {
        let config = AgenticLoopConfig {
            context_window: 20,
            history_limit: 5,
            ..Default::default()
        };
        assert_eq!(config.retained_history(), 20);
    }
}
