//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;
pub mod config;
pub mod errors;
pub mod health;
pub mod say;


use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::chat::run_chat;
use crate::cli::config::run_config;
use crate::cli::errors::run_errors;
use crate::cli::health::{run_health, run_watch};
use crate::cli::say::run_say;
use crate::core::config::Config;
use crate::utils::logging::init_logging;

#[derive(Parser)]
#[command(name = "palaver")]
#[command(version)]
#[command(about = "A resilient terminal client for the MCP chatbot backend")]
#[command(
    long_about = "Palaver talks to the MCP chatbot backend over HTTP. Requests are \
deduplicated, retried with backoff, guarded by per-operation circuit breakers and \
served from cache when the backend is unreachable.\n\n\
Environment Variables:\n\
  PALAVER_BASE_URL  Backend URL (overrides backend.base_url in the config file)\n\
  PALAVER_LOG       Diagnostic log filter, e.g. 'debug' or 'palaver::core::health=trace'\n\n\
Chat commands:\n\
  /new              Start a new conversation\n\
  /status           Show backend health and recovery state\n\
  /quit             Leave the chat"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Write diagnostic logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Start an interactive chat (default)
    Chat {
        /// Continue an existing conversation
        #[arg(short = 'c', long)]
        conversation: Option<String>,
    },
    /// Send one message and print the reply
    Say {
        /// Continue an existing conversation
        #[arg(short = 'c', long)]
        conversation: Option<String>,
        /// Message text; multiple words are joined with spaces
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        prompt: Vec<String>,
    },
    /// Probe the backend once and report its health
    Health,
    /// Keep probing the backend and print every status change
    Watch {
        /// Stop after this many status changes
        #[arg(short = 'n', long)]
        changes: Option<usize>,
    },
    /// Show the backend's error statistics
    Errors {
        /// Also list up to this many recent backend errors
        #[arg(short = 'r', long, value_name = "COUNT")]
        recent: Option<usize>,
        /// Summarize the local error log file instead of asking the backend
        #[arg(long)]
        local: bool,
    },
    /// Show or change configuration values
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigCommands {
    /// Print every setting (default)
    Show,
    /// Print one setting
    Get { key: String },
    /// Change one setting
    Set { key: String, value: String },
    /// Reset one setting to its default
    Unset { key: String },
    /// Print the location of the config file
    Path,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.log.as_deref())?;

    match args.command.unwrap_or(Commands::Chat { conversation: None }) {
        Commands::Config { command } => run_config(command.unwrap_or(ConfigCommands::Show)),
        Commands::Chat { conversation } => run_chat(&Config::load()?, conversation).await,
        Commands::Say {
            conversation,
            prompt,
        } => run_say(&Config::load()?, prompt, conversation).await,
        Commands::Health => run_health(&Config::load()?).await,
        Commands::Watch { changes } => run_watch(&Config::load()?, changes).await,
        Commands::Errors { recent, local } => run_errors(&Config::load()?, recent, local).await,
    }
}
