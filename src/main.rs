//! Command-line front end for usenet-indexer

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use usenet_indexer::{Config, Indexer, Result, run_until_signal};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, env = "USENET_INDEXER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan active groups (or one group) forward and build releases
    Update {
        /// Only update this group
        group: Option<String>,
        /// Run a single cycle instead of looping
        #[arg(long)]
        once: bool,
    },
    /// Scan backward into older articles
    Backfill {
        /// Only backfill this group
        group: Option<String>,
        /// Oldest posting date to reach, YYYY-MM-DD (default: backfill_days ago)
        #[arg(long, value_parser = parse_date)]
        date: Option<DateTime<Utc>>,
    },
    /// Assemble and finalize what is already stored, without scanning
    Process,
    /// Import an NZB file or a directory of NZB files
    Import {
        /// File or directory path
        path: PathBuf,
    },
    /// Manage newsgroups
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// Register a group (re-activates an existing one)
    Add { name: String },
    /// Remove a group that no release references
    Remove { name: String },
    /// Include a group in updates
    Enable { name: String },
    /// Exclude a group from updates
    Disable { name: String },
    /// Forget a group's scan position
    Reset { name: String },
    /// List groups
    List {
        /// Only show active groups
        #[arg(long)]
        active: bool,
    },
    /// Show one group
    Info { name: String },
}

fn parse_date(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
        .and_then(|date| {
            date.and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc())
                .ok_or_else(|| "invalid date".to_string())
        })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "usenet-indexer failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    let indexer = Indexer::new(config).await?;
    let cancel = indexer.cancel_token();

    match cli.command {
        Commands::Update { group, once } => {
            if once {
                run_until_signal(cancel, indexer.update_cycle(group.as_deref())).await?;
            } else {
                run_until_signal(cancel, indexer.run_update(group.as_deref())).await?;
            }
        }
        Commands::Backfill { group, date } => {
            let report = run_until_signal(cancel, indexer.backfill(group.as_deref(), date)).await?;
            for summary in &report.completed {
                println!(
                    "{}: {} windows, {} articles, {} parts",
                    summary.group, summary.windows, summary.received, summary.parts
                );
            }
            for (group, error) in &report.failed {
                println!("{}: failed: {}", group, error);
            }
        }
        Commands::Process => {
            let (assembled, finalized) = run_until_signal(cancel, indexer.process()).await?;
            println!(
                "{} parts processed, {} binaries formed, {} releases created",
                assembled.processed, assembled.formed, finalized.created
            );
        }
        Commands::Import { path } => {
            let report = run_until_signal(cancel, indexer.import_path(&path)).await?;
            println!("{} imported", report.imported.len());
            for (path, reason) in &report.rejected {
                println!("{}: {}", path.display(), reason);
            }
        }
        Commands::Group { action } => group_command(&indexer, action).await?,
    }

    Ok(())
}

async fn group_command(indexer: &Indexer, action: GroupAction) -> Result<()> {
    match action {
        GroupAction::Add { name } => {
            indexer.add_group(&name).await?;
        }
        GroupAction::Remove { name } => indexer.remove_group(&name).await?,
        GroupAction::Enable { name } => indexer.set_group_active(&name, true).await?,
        GroupAction::Disable { name } => indexer.set_group_active(&name, false).await?,
        GroupAction::Reset { name } => indexer.reset_group(&name).await?,
        GroupAction::List { active } => {
            for group in indexer.list_groups(active).await? {
                println!(
                    "{}\t{}\t{}",
                    group.name,
                    if group.active { "active" } else { "inactive" },
                    cursor(group.first, group.last)
                );
            }
        }
        GroupAction::Info { name } => {
            let group = indexer.group_info(&name).await?;
            println!("name:   {}", group.name);
            println!("active: {}", group.active);
            println!("range:  {}", cursor(group.first, group.last));
        }
    }
    Ok(())
}

fn cursor(first: Option<i64>, last: Option<i64>) -> String {
    match (first, last) {
        (Some(first), Some(last)) => format!("{}-{}", first, last),
        _ => "not scanned".to_string(),
    }
}
