use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dlh_core::LeadStatus;
use dlh_storage::JsonFileStore;
use dlh_sync::{ConfigError, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dlh")]
#[command(about = "Daily Lead Hunter command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search for new leads and update the store
    Run,
    /// Advance the store with raw leads saved to a JSON file
    Ingest {
        /// Array of raw leads or a saved search response
        file: PathBuf,
    },
    /// Print the current store
    Show {
        /// Only show leads with this status (New, Best_Archived)
        #[arg(short, long)]
        status: Option<LeadStatus>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = dlh_sync::run_sync_once(config).await?;
            println!(
                "run complete: run_id={} profile={} queries={} failed_queries={} fetched={} admitted={} archived={} expired={} total={}",
                summary.run_id,
                summary.profile,
                summary.queries,
                summary.failed_queries,
                summary.fetched,
                summary.ingest.report.admitted,
                summary.ingest.report.archived,
                summary.ingest.report.expired,
                summary.ingest.total
            );
        }
        Commands::Ingest { file } => {
            let summary = dlh_sync::ingest_file(config, &file).await?;
            println!(
                "ingest complete: file={} admitted={} archived={} expired={} total={}",
                file.display(),
                summary.report.admitted,
                summary.report.archived,
                summary.report.expired,
                summary.total
            );
        }
        Commands::Show { status } => {
            let store = JsonFileStore::new(config.store_path.clone());
            let snapshot = store.load_read_only().await?;
            let leads = snapshot
                .leads
                .iter()
                .filter(|lead| status.map_or(true, |s| lead.status == s))
                .collect::<Vec<_>>();
            for lead in &leads {
                println!(
                    "{:<13} {}  {} | {}\n    {}",
                    lead.status.as_str(), lead.found_at, lead.company, lead.title, lead.url
                );
            }
            println!(
                "{} of {} leads in {}",
                leads.len(),
                snapshot.leads.len(),
                store.path().display()
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.downcast_ref::<ConfigError>().is_some() => {
            eprintln!("configuration error: {err}");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
