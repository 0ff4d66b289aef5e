//! folio CLI - execute and cache Jupyter notebooks.

mod cache;
mod colors;
mod execute;
mod kernels;
mod stats;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use folio_core::ExecutionMode;

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Execute and cache Jupyter notebooks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute notebooks and report the results
    Execute {
        /// Paths to the notebooks (.ipynb files)
        #[arg(required = true)]
        notebooks: Vec<PathBuf>,

        /// Execution mode (off, auto, force, cache, inline)
        #[arg(short, long)]
        mode: Option<ExecutionMode>,

        /// Per-cell timeout in seconds, -1 for none
        #[arg(short, long, allow_hyphen_values = true)]
        timeout: Option<i64>,

        /// Keep executing after a cell error
        #[arg(long)]
        allow_errors: bool,

        /// Run kernels in a temporary directory
        #[arg(long)]
        in_temp: bool,

        /// Cache directory (default: ./.folio_cache)
        #[arg(long)]
        cache_path: Option<PathBuf>,

        /// Glob pattern of notebooks to leave unexecuted (repeatable)
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// Abort on the first failed notebook
        #[arg(long)]
        raise_on_error: bool,

        /// Print tracebacks of failed notebooks
        #[arg(long)]
        show_tb: bool,

        /// Merge consecutive stream outputs
        #[arg(long)]
        merge_streams: bool,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write executed notebooks to this directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Inspect or clear the execution cache
    Cache {
        /// Cache directory (default: ./.folio_cache)
        #[arg(long, global = true)]
        cache_path: Option<PathBuf>,

        #[command(subcommand)]
        command: CacheCommand,
    },

    /// List installed kernel specs
    Kernels,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List committed records
    List {
        /// List staged notebooks instead
        #[arg(long)]
        staged: bool,
    },

    /// Show a committed record or a staged notebook
    Show {
        /// Record ID (a unique prefix is enough) or staged notebook path
        id: String,

        /// Print the cached notebook JSON
        #[arg(long)]
        notebook: bool,
    },

    /// Remove every record
    Clear,

    /// Remove a staged notebook
    Unstage {
        /// Path of the staged notebook
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Helper to format folio-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(folio_err) = err.downcast_ref::<folio_core::Error>() {
            anyhow::anyhow!("{}", folio_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Execute {
            notebooks,
            mode,
            timeout,
            allow_errors,
            in_temp,
            cache_path,
            exclude,
            raise_on_error,
            show_tb,
            merge_streams,
            config,
            output_dir,
        } => {
            let args = execute::ExecuteArgs {
                mode,
                timeout,
                allow_errors,
                in_temp,
                cache_path,
                exclude,
                raise_on_error,
                show_tb,
                merge_streams,
                config,
                output_dir,
            };
            execute::execute(&notebooks, &args).map_err(format_error)?;
        }

        Commands::Cache {
            cache_path,
            command,
        } => {
            let root = cache::resolve_root(cache_path)?;
            let result = match command {
                CacheCommand::List { staged } => cache::list(&root, staged),
                CacheCommand::Show { id, notebook } => cache::show(&root, &id, notebook),
                CacheCommand::Clear => cache::clear(&root),
                CacheCommand::Unstage { path } => cache::unstage(&root, &path),
            };
            result.map_err(format_error)?;
        }

        Commands::Kernels => kernels::execute(),
    }

    Ok(())
}
