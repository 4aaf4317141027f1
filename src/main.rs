use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codecompass::server::{run, ServerOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "codecompass")]
#[command(version)]
#[command(about = "Local code-intelligence MCP server (semantic repository search + agentic queries)")]
struct Cli {
    /// Path to the Git repository to serve (defaults to the current directory).
    #[arg(long, value_name = "PATH")]
    repo: Option<PathBuf>,

    /// When the utility port is owned by a CodeCompass peer, keep running as
    /// a relay proxy on a free port instead of exiting.
    #[arg(long)]
    proxy_on_conflict: bool,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the MCP stdio server (the default when no subcommand is given).
    Start,
}

fn main() -> Result<()> {
    // stdout is the MCP channel; every log line goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let repo_path = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };

    match cli.cmd {
        Some(Command::Start) | None => run(ServerOptions {
            repo_path,
            proxy_on_conflict: cli.proxy_on_conflict,
        }),
    }
}
