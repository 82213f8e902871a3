//! DBGp debugger bridge for LLM coding agents
//!
//! Listens for an inbound DBGp connection from an XDebug-enabled
//! interpreter and exposes high-level debugging tools to an agent over
//! stdio.

use clap::{Parser, Subcommand};

use xdebug_bridge::common::{logging, Config};
use xdebug_bridge::server;

#[derive(Parser)]
#[command(name = "xdebug-bridge", about = "DBGp debugger bridge for LLM coding agents")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge, reading tool requests from stdin (default)
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Some(log_path) = logging::init(&config.data_dir(), config.debug) {
        tracing::debug!(path = %log_path.display(), "file logging enabled");
    }

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => server::serve(config).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
