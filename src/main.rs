use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;

use daydigest_lib::commands;
use daydigest_lib::state::{self, AppState, CONFIG_ENV};

/// Calendar feed and inbox, triaged into one daily digest
#[derive(Parser)]
#[command(name = "daydigest", version, about)]
struct Cli {
    /// Config file (defaults to ~/.daydigest/config.json)
    #[arg(long, env = CONFIG_ENV, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daily schedule in the foreground (default)
    Daemon,

    /// Build a digest now and push it
    RunNow,

    /// Print today's digest as JSON
    Today {
        /// Rebuild even if a fresh digest exists
        #[arg(long)]
        refresh: bool,
    },

    /// Show whether the mailbox is connected
    AuthStatus,

    /// Show run phase and the next scheduled time
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => state::config_path()?,
    };
    let config = state::load_config_from(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;
    let state = Arc::new(AppState::from_config(config)?);

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            log::info!("daydigest started (config: {})", config_path.display());
            daydigest_lib::run_daemon(state).await;
            Ok(())
        }
        Commands::RunNow => print_json(&commands::run_now(&state).await),
        Commands::Today { refresh } => print_json(&commands::get_today(&state, refresh).await),
        Commands::AuthStatus => print_json(&commands::auth_status(&state)),
        Commands::Status => print_json(&commands::get_status(&state)),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
