//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON, and quiet output modes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

/// Events emitted while running CLI commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutputEvent {
    WorkflowStart {
        name: String,
        steps: usize,
        parallel_groups: usize,
        loops: usize,
    },
    LoopFinished {
        name: String,
        iterations: u32,
        exit: String,
    },
    WorkflowComplete {
        success: bool,
        duration_ms: u64,
        steps_completed: usize,
    },
    WorkflowError {
        error: String,
    },
    Info {
        message: String,
    },
    Debug {
        message: String,
    },
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    /// Emit an event
    fn emit(&self, event: OutputEvent);

    /// Write final result
    fn result(&self, success: bool, output: Option<&str>);
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", Duration::from_millis(ms).as_secs_f64())
    }
}

/// Console output handler
pub struct ConsoleHandler {
    debug: bool,
}

impl ConsoleHandler {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::WorkflowStart {
                name,
                steps,
                parallel_groups,
                loops,
            } => {
                eprintln!(
                    "Running workflow '{}' ({} steps, {} parallel groups, {} loops)",
                    name, steps, parallel_groups, loops
                );
            }
            OutputEvent::LoopFinished {
                name,
                iterations,
                exit,
            } => {
                eprintln!("  loop '{}': {} iterations ({})", name, iterations, exit);
            }
            OutputEvent::WorkflowComplete {
                success,
                duration_ms,
                steps_completed,
            } => {
                eprintln!();
                if success {
                    eprintln!(
                        "✓ Workflow completed successfully ({} steps in {})",
                        steps_completed,
                        format_duration(duration_ms)
                    );
                } else {
                    eprintln!(
                        "✗ Workflow failed after {} steps ({})",
                        steps_completed,
                        format_duration(duration_ms)
                    );
                }
            }
            OutputEvent::WorkflowError { error } => {
                eprintln!("Error: {}", error);
            }
            OutputEvent::Info { message } => {
                eprintln!("{}", message);
            }
            OutputEvent::Debug { message } => {
                if self.debug {
                    eprintln!("[debug] {}", message);
                }
            }
        }
    }

    fn result(&self, _success: bool, output: Option<&str>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

/// JSON output handler, one object per line
pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn print_json<T: Serialize>(&self, value: &T) {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };

        if let Ok(s) = json {
            println!("{}", s);
        }
    }
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        self.print_json(&event);
    }

    fn result(&self, success: bool, output: Option<&str>) {
        #[derive(Serialize)]
        struct FinalResult<'a> {
            success: bool,
            output: Option<&'a str>,
        }

        self.print_json(&FinalResult { success, output });
    }
}

/// Quiet handler: only the final output
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, _event: OutputEvent) {}

    fn result(&self, _success: bool, output: Option<&str>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

/// Create an output handler based on mode
pub fn create_handler(mode: OutputMode, debug: bool) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler::new(debug)),
        OutputMode::Json => Box::new(JsonHandler::new(false)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}
