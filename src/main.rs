mod cli;
mod config;
mod logging;
mod memory;
mod process;
mod provider;
mod template;
mod tools;
mod workflow;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::OutputMode;
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "llmflow")]
#[command(about = "Workflow engine for LLM pipelines - steps, parallel groups and agentic loops")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Working directory (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// How progress and results are printed
    #[arg(long, global = true, value_enum, default_value_t = OutputMode::Console)]
    output: OutputMode,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow
    Run {
        /// Workflow name or path
        workflow: String,

        /// Workflow variable, as name=value
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Resume stateful loops from their last checkpoint
        #[arg(long)]
        resume: bool,
    },

    /// Validate a workflow without running it
    Validate {
        /// Workflow name or path
        workflow: String,
    },

    /// Inspect saved loop states
    States {
        #[command(subcommand)]
        action: StateCommands,
    },

    /// List configured models
    Models,
}

#[derive(Subcommand)]
enum StateCommands {
    /// List saved loop states
    List,

    /// Show one loop state
    Show {
        /// State key, `<workflow>.<loop>`
        key: String,
    },

    /// Delete one loop state and its backups
    Delete {
        /// State key, `<workflow>.<loop>`
        key: String,
    },
}

/// Piped stdin, or empty when attached to a terminal
fn read_piped_stdin() -> Result<String> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(String::new());
    }
    let mut input = String::new();
    stdin.read_to_string(&mut input)?;
    Ok(input)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let working_dir = match cli.dir {
        Some(ref dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let log_file = match (&cli.log_file, &cli.command) {
        (Some(path), _) => Some(path.clone()),
        (None, Commands::Run { workflow, .. }) if cli.debug => Some(logging::default_log_path(workflow)?),
        _ => None,
    };
    let log_guard = logging::init_logging(cli.debug, cli.quiet, log_file.as_deref())?;

    let config = Arc::new(config::EngineConfig::load(Some(&working_dir))?);
    let mode = if cli.quiet && cli.output == OutputMode::Console {
        OutputMode::Quiet
    } else {
        cli.output
    };
    let handler = cli::create_handler(mode, cli.debug);

    let exit_code = match cli.command {
        Commands::Run {
            workflow,
            vars,
            resume,
        } => {
            let args = cli::RunArgs {
                vars,
                resume,
                input: read_piped_stdin()?,
            };
            cli::run_workflow(&workflow, args, &working_dir, config, &*handler).await?
        }

        Commands::Validate { workflow } => cli::validate_workflow(&workflow, &working_dir, &*handler),

        Commands::States { action } => {
            let manager = workflow::LoopStateManager::new(config.state_dir(&working_dir));
            match action {
                StateCommands::List => cli::list_states(&manager, &*handler)?,
                StateCommands::Show { key } => cli::show_state(&manager, &key, &*handler)?,
                StateCommands::Delete { key } => cli::delete_state(&manager, &key, &*handler)?,
            }
            0
        }

        Commands::Models => {
            cli::list_models(&config, &*handler);
            0
        }
    };

    if exit_code != 0 {
        drop(log_guard);
        std::process::exit(exit_code);
    }
    Ok(())
}
