//! Entitlement Sync - keeps a signed-in session and its entitlement current.

mod app;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use engine_config_and_utils::{init_logging, parse_level, Config, Paths};

/// Entitlement sync command-line interface.
#[derive(Parser)]
#[command(name = "entitlement-sync")]
#[command(about = "Token lifecycle and entitlement sync engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, store and tab exports. Defaults to ~/.entitlement-sync
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a long-lived context until Ctrl-C
    Run,
    /// Print the persisted auth state
    Status,
    /// Run one check now and print the result
    Check,
    /// Hand over a session obtained from the web app sign-in
    Import {
        #[arg(long)]
        access_token: String,

        #[arg(long)]
        refresh_token: Option<String>,

        /// RFC 3339 expiry. Taken from the access token when omitted
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Drop local credentials and the persisted state
    Logout,
    /// Write the effective configuration to config.json
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(level);
    if parse_level(level).is_none() {
        tracing::debug!(filter = %level, "Log level is not a plain level, used as a filter");
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => app::run(config, paths).await?,
        Commands::Status => app::status(&paths)?,
        Commands::Check => app::check(config, paths).await?,
        Commands::Import {
            access_token,
            refresh_token,
            expires_at,
        } => app::import(config, paths, access_token, refresh_token, expires_at).await?,
        Commands::Logout => app::logout(config, paths).await?,
        Commands::InitConfig => app::init_config(&config, &paths)?,
    }

    Ok(())
}
