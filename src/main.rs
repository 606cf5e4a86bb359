use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use leadflow::config::{CONFIG_FILE, LeadflowToml};
use leadflow_core::Month;

mod cmd;

#[derive(Parser)]
#[command(name = "leadflow")]
#[command(version, about = "Multi-tenant lead management and sales incentive service")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a local front-end dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its schema, then exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Calculate monthly incentives for an organization's sales reps
    Recalculate {
        #[arg(long)]
        organization_id: i64,

        /// Month as YYYY-MM (defaults to the previous month)
        #[arg(long)]
        month: Option<Month>,

        /// Only this sales rep
        #[arg(long)]
        user_id: Option<i64>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default leadflow.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config, command.clone());
    }

    let mut config = LeadflowToml::load_or_default(&cli.config)?;
    config.apply_process_env()?;
    let _log_guard = leadflow::logging::init_tracing(&config.logging, cli.verbose);

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(db_path) = db_path {
                config.server.db_path = db_path;
            }
            config.server.dev_mode |= dev;
            cmd::cmd_serve(&config).await?;
        }
        Commands::InitDb { db_path } => {
            let db_path = db_path.unwrap_or(config.server.db_path);
            cmd::cmd_init_db(&db_path)?;
        }
        Commands::Recalculate {
            organization_id,
            month,
            user_id,
            db_path,
        } => {
            let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
            cmd::cmd_recalculate(&db_path, &config.incentives, organization_id, month, user_id)?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
