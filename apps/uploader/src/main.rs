//! PaperDrop uploader entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "paperdrop")]
#[command(author, version, about = "Resumable chunked uploads for research papers", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the XDG config location)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more files
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Queue priority; higher is admitted first
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,

        /// Declared MIME type, checked against the file contents
        #[arg(short, long, value_name = "TYPE")]
        mime: Option<String>,
    },

    /// Inspect or clear saved resume sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },

    /// Print the chunk plan for a file
    Plan {
        file: PathBuf,

        /// Also compute per-chunk digests
        #[arg(long)]
        digests: bool,
    },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List saved sessions
    List,

    /// Delete saved sessions
    Clear {
        /// Only delete sessions older than this many hours
        #[arg(long, value_name = "HOURS")]
        older_than: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config::Config::load(cli.config.as_deref())?;
    tracing::debug!(endpoint = %config.endpoint, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Upload {
            files,
            priority,
            mime,
        } => rt.block_on(app::upload(&config, files, priority, mime))?,
        Commands::Sessions { command } => match command {
            SessionsCommand::List => app::list_sessions(&config)?,
            SessionsCommand::Clear { older_than } => app::clear_sessions(&config, older_than)?,
        },
        Commands::Plan { file, digests } => app::print_plan(&config, &file, digests)?,
    }
    Ok(())
}
