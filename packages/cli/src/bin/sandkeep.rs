use clap::{Parser, Subcommand};
use colored::*;
use sandkeep_cli::context::AppContext;
use sandkeep_config::SandkeepConfig;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::session::SessionCommand;
use cli::tool::ToolCommands;

#[derive(Parser)]
#[command(name = "sandkeep")]
#[command(about = "Persistent per-caller sandboxes for running untrusted code")]
#[command(version)]
struct Cli {
    /// Override SANDKEEP_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Override SANDKEEP_BASE_IMAGE
    #[arg(long = "default-image", global = true)]
    default_image: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Session(SessionCommand),
    /// Run an agent tool in a caller's live sandbox
    #[command(subcommand)]
    Tool(ToolCommands),
    /// Run one repair sweep over failed sessions
    Repair,
    /// Run one eviction sweep over inactive sessions and orphaned containers
    Evict,
    /// Run the repair and eviction sweeps periodically until Ctrl-C
    Daemon,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    match handle_command(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

async fn handle_command(cli: Cli) -> anyhow::Result<i32> {
    let mut config = SandkeepConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(image) = cli.default_image {
        config.default_base_image = image;
    }

    let ctx = AppContext::connect(config).await?;

    match cli.command {
        Commands::Session(command) => cli::session::handle(&ctx, command).await,
        Commands::Tool(command) => cli::tool::handle(&ctx, command).await,
        Commands::Repair => cli::maintenance::repair(&ctx).await,
        Commands::Evict => cli::maintenance::evict(&ctx).await,
        Commands::Daemon => cli::maintenance::daemon(&ctx).await,
    }
}
