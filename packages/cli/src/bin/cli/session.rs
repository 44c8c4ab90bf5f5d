// ABOUTME: CLI commands that run code or commands for a caller and inspect sessions
// ABOUTME: Wraps resolve_and_run, exec_command, get_session and list_sessions

use super::emit_outcome;
use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use sandkeep_cli::context::AppContext;
use sandkeep_cli::render;
use sandkeep_sandbox::tools;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum SessionCommand {
    /// Run code in the caller's persistent sandbox, provisioning it if needed
    Run {
        /// Caller whose sandbox to use
        #[arg(long)]
        caller: String,

        /// Base image; defaults to the configured image
        #[arg(long)]
        image: Option<String>,

        /// Code to execute
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        code: Option<String>,

        /// Read the code from a file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Print the session record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a literal shell command in the caller's live sandbox
    Exec {
        #[arg(long)]
        caller: String,

        /// Command line, passed to sh -c
        command: String,
    },

    /// Show one session
    Status {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// List all sessions
    List {
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle(ctx: &AppContext, command: SessionCommand) -> Result<i32> {
    match command {
        SessionCommand::Run {
            caller,
            image,
            code,
            file,
            json,
        } => {
            let code = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => anyhow::bail!("Either --code or --file is required"),
            };

            let session = ctx
                .reconciler
                .resolve_and_run(&caller, &code, image.as_deref())
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                println!("{}", tools::summarize(&session));
            }
            Ok(if session.exit_code == Some(0) { 0 } else { 1 })
        }
        SessionCommand::Exec { caller, command } => {
            let outcome = ctx.reconciler.exec_command(&caller, &command).await?;
            if outcome.timed_out {
                eprintln!("{} command timed out", "Warning:".yellow().bold());
            }
            Ok(emit_outcome(&outcome))
        }
        SessionCommand::Status { id, json } => {
            let session = ctx.reconciler.get_session(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                println!("{}", render::session_detail(&session));
            }
            Ok(0)
        }
        SessionCommand::List { json } => {
            let sessions = ctx.reconciler.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No sandbox sessions.");
            } else {
                println!("{}", render::sessions_table(&sessions));
            }
            Ok(0)
        }
    }
}
