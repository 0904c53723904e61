//! # docflow CLI Module
//!
//! This module implements the CLI interface for docflow.
//!
//! ## Available Commands
//!
//! - `run` - Build a document, replay actions, print the resolved state
//! - `check` - Build a document and report its diagnostics
//! - `server` - Serve one document over HTTP

mod commands;

use clap::{Parser, Subcommand};
use docflow_core::DocError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// docflow - interactive document engine
///
/// Resolves state variables of a component tree, applies actions through
/// inverse definitions and keeps composite expansions reconciled.
#[derive(Parser, Debug)]
#[command(name = "docflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a document, apply actions and print the resolved state
    Run {
        /// Component tree (JSON)
        #[arg(short, long)]
        document: PathBuf,

        /// Actions to apply in order (JSON array)
        #[arg(short, long)]
        actions: Option<PathBuf>,

        /// Restore essential state before applying actions
        #[arg(long)]
        restore_state: Option<PathBuf>,

        /// Save essential state after applying actions
        #[arg(long)]
        save_state: Option<PathBuf>,
    },

    /// Build a document and report diagnostics
    Check {
        /// Component tree (JSON)
        #[arg(short, long)]
        document: PathBuf,
    },

    /// Start HTTP server
    Server {
        /// Component tree (JSON)
        #[arg(short, long)]
        document: PathBuf,

        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), DocError> {
    let app_config = crate::config::AppConfig::load(cli.config.as_deref())?;
    let config = app_config.engine_config();
    let json_mode = cli.json_mode;

    match cli.command {
        Commands::Run {
            document,
            actions,
            restore_state,
            save_state,
        } => cmd_run(
            &document,
            config,
            json_mode,
            actions.as_deref(),
            restore_state.as_deref(),
            save_state.as_deref(),
        ),
        Commands::Check { document } => cmd_check(&document, config, json_mode),
        Commands::Server {
            document,
            host,
            port,
        } => {
            let settings = app_config.server.with_env_overrides();
            cmd_server(&document, config, settings, &host, port).await
        }
    }
}
