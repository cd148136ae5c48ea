//! patchrun CLI - evaluate patch submissions and clean up environments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cleanup;
mod submit;

/// patchrun - run untrusted patches against hidden tests
#[derive(Parser)]
#[command(name = "patchrun")]
#[command(about = "Evaluate patch submissions against a task dataset", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a file of submissions and write the results
    Submit(submit::SubmitArgs),

    /// Remove environments provisioned by earlier runs
    Cleanup {
        /// Work directory of a persisted run; without it every harness
        /// environment known to conda is removed
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Concurrent removals
        #[arg(long, default_value_t = 5)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit(args) => {
            submit::run(args).await?;
        }
        Commands::Cleanup {
            work_dir,
            yes,
            workers,
        } => {
            cleanup::run(work_dir, yes, workers).await?;
        }
    }

    Ok(())
}
