//! # docflow - Interactive Document Engine
//!
//! The main binary for the docflow state engine.
//!
//! This application provides:
//! - CLI interface: build a document, replay actions, save/restore state
//! - HTTP action boundary (axum-based)
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                apps/docflow (THE BINARY)              │
//! │                                                       │
//! │   ┌─────────────┐              ┌─────────────┐        │
//! │   │    CLI      │              │  HTTP API   │        │
//! │   │   (clap)    │              │   (axum)    │        │
//! │   └──────┬──────┘              └──────┬──────┘        │
//! │          └──────────────┬─────────────┘               │
//! │                         ▼                             │
//! │                 ┌───────────────┐                     │
//! │                 │ docflow-core  │                     │
//! │                 │ (THE ENGINE)  │                     │
//! │                 └───────────────┘                     │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Build a document, replay actions and print the resolved state
//! docflow run -d demos/line.json -a demos/line-actions.json
//!
//! # Report diagnostics only
//! docflow check -d demos/line.json
//!
//! # Serve one document over HTTP
//! docflow server -d demos/line.json --port 8080
//! ```

use clap::Parser;
use docflow::cli;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // DOCFLOW_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("DOCFLOW_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = EnvFilter::try_from_env("DOCFLOW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "docflow=info,docflow_core=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    eprintln!(
        r#"
  docflow v{}
  demand-driven state for interactive documents
"#,
        env!("CARGO_PKG_VERSION")
    );
}
