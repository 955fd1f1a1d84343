//! rulegate - rule and lifecycle definition tooling
//!
//! Loads rule and state machine bundles, validates them, and runs rule
//! pipelines or transitions against JSON input from the command line.

mod commands;
mod config;
mod definitions;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use definitions::Definitions;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rulegate")]
#[command(about = "Validate and exercise rule and state machine definitions")]
#[command(version)]
pub struct Cli {
    /// Config file (YAML)
    #[arg(short, long, env = "RULEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Definition bundle (JSON or YAML); repeatable, replaces configured paths
    #[arg(short, long = "definitions")]
    definitions: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by commands that build a context.
#[derive(clap::Args, Debug, Clone)]
pub struct ContextArgs {
    /// Entity data JSON (or @file.json to read from file)
    #[arg(long, default_value = "{}")]
    data: String,

    /// Previous entity data JSON
    #[arg(long)]
    previous: Option<String>,

    /// Acting user id
    #[arg(short, long)]
    user: Option<String>,

    /// Acting user roles
    #[arg(short, long, value_delimiter = ',')]
    roles: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load bundles and report problems
    Check,

    /// Show the execution order of an entity's rules
    Order {
        /// Entity name
        #[arg(short, long)]
        entity: String,

        /// Restrict to these categories
        #[arg(short, long, value_delimiter = ',')]
        categories: Vec<String>,
    },

    /// Run the rule pipeline for an entity
    Eval {
        /// Entity name
        #[arg(short, long)]
        entity: String,

        /// Operation: create, update, delete, read or transition
        #[arg(short, long, default_value = "update")]
        operation: String,

        /// Restrict to these categories
        #[arg(short, long, value_delimiter = ',')]
        categories: Vec<String>,

        /// Keep evaluating after a deny
        #[arg(long)]
        no_stop: bool,

        #[command(flatten)]
        ctx: ContextArgs,
    },

    /// Print a machine as a Mermaid state diagram
    Mermaid {
        /// Machine entity
        #[arg(short, long)]
        machine: String,
    },

    /// Take a named transition
    Transition {
        /// Machine entity
        #[arg(short, long)]
        machine: String,

        /// Current state
        #[arg(short, long)]
        state: String,

        /// Transition name
        #[arg(short, long)]
        name: String,

        /// Entity id
        #[arg(long, default_value = "cli")]
        id: String,

        #[command(flatten)]
        ctx: ContextArgs,
    },

    /// Dispatch an event
    Send {
        /// Machine entity
        #[arg(short, long)]
        machine: String,

        /// Current state
        #[arg(short, long)]
        state: String,

        /// Event name
        #[arg(short, long)]
        event: String,

        /// Event payload JSON
        #[arg(short, long)]
        payload: Option<String>,

        /// Entity id
        #[arg(long, default_value = "cli")]
        id: String,

        #[command(flatten)]
        ctx: ContextArgs,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.logging.level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let paths = if cli.definitions.is_empty() {
        config.definitions.paths.clone()
    } else {
        cli.definitions.clone()
    };
    if paths.is_empty() {
        eprintln!(
            "{}: no definition bundles given (use --definitions or RULEGATE_DEFINITIONS)",
            "Error".red()
        );
        std::process::exit(1);
    }

    let defs = match Definitions::load(&paths, config.engine.track_history) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{}: {}", "Load failed".red(), e);
            std::process::exit(1);
        }
    };

    match commands::execute(&defs, &config, cli.command).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
