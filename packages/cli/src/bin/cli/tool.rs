// ABOUTME: CLI commands exposing the agent tool layer against a caller's live sandbox
// ABOUTME: Each command is built by the escaping command builders, then run with exec_command

use super::emit_outcome;
use anyhow::Result;
use clap::Subcommand;
use sandkeep_cli::context::AppContext;
use sandkeep_sandbox::tools;

#[derive(Subcommand)]
pub enum ToolCommands {
    /// Print a file
    Read {
        #[arg(long)]
        caller: String,
        path: String,
    },

    /// Write text to a file, replacing it
    Write {
        #[arg(long)]
        caller: String,
        path: String,
        content: String,
    },

    /// List a directory; defaults to the shared mount
    Ls {
        #[arg(long)]
        caller: String,
        path: Option<String>,
    },

    /// Search file contents
    Grep {
        #[arg(long)]
        caller: String,
        pattern: String,
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },

    /// Download an http(s) URL into the sandbox
    Download {
        #[arg(long)]
        caller: String,
        url: String,
        dest: String,
    },

    /// List processes running in the sandbox
    Ps {
        #[arg(long)]
        caller: String,
    },
}

fn build(ctx: &AppContext, command: &ToolCommands) -> tools::Result<(String, String)> {
    let built = match command {
        ToolCommands::Read { caller, path } => (caller, tools::read_file(path)?),
        ToolCommands::Write {
            caller,
            path,
            content,
        } => (caller, tools::write_file(path, content)?),
        ToolCommands::Ls { caller, path } => {
            let path = path
                .as_deref()
                .unwrap_or(&ctx.config.shared_mount.container_path);
            (caller, tools::list_dir(path)?)
        }
        ToolCommands::Grep {
            caller,
            pattern,
            path,
            recursive,
        } => (caller, tools::grep(pattern, path, *recursive)?),
        ToolCommands::Download { caller, url, dest } => (caller, tools::download_url(url, dest)?),
        ToolCommands::Ps { caller } => (caller, tools::list_processes()),
    };
    Ok((built.0.clone(), built.1))
}

pub async fn handle(ctx: &AppContext, command: ToolCommands) -> Result<i32> {
    let (caller, shell) = build(ctx, &command)?;
    let outcome = ctx.reconciler.exec_command(&caller, &shell).await?;
    Ok(emit_outcome(&outcome))
}
