use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mrc_adapters::EditEvent;
use mrc_core::SYSTEM_USER;
use mrc_sync::{ManualEntry, RunOutcome, SyncConfig, Workspace};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mrc-cli")]
#[command(about = "Master record consolidation command-line interface")]
struct Cli {
    /// Workspace directory; overrides MRC_WORKSPACE.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// Recorded as the triggering user in log entries.
    #[arg(long, global = true)]
    user: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import new rows from every enabled source.
    Import,
    /// Sync the rows covered by an edit.
    Edit(EditArgs),
    /// Clear master, log, cursors and flags, then import everything.
    Rebuild,
    /// Reset cursors and flags and import again, keeping master rows.
    Reimport,
    /// Mark every existing source row as already processed.
    SeedCursors,
    /// Forget which duplicate groups were reported.
    ResetFlags,
    /// Run a duplicate grouping pass over the master table.
    Duplicates,
    /// Add a record by hand.
    Manual(ManualArgs),
    /// Run the scheduled import until interrupted.
    Schedule,
}

#[derive(Debug, Args)]
struct EditArgs {
    #[arg(long)]
    source: String,
    #[arg(long, default_value_t = 0)]
    table: u64,
    #[arg(long)]
    row: usize,
    #[arg(long, default_value_t = 1)]
    rows: usize,
    #[arg(long)]
    column: usize,
    #[arg(long, default_value_t = 1)]
    columns: usize,
}

#[derive(Debug, Args)]
struct ManualArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    /// YYYY-MM-DD
    #[arg(long)]
    dob: String,
    #[arg(long)]
    origin: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mrc=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn print_outcome<T: Serialize>(outcome: &RunOutcome<T>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome).context("encoding outcome")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(root) = cli.workspace {
        config.workspace_root = root;
    }
    let user = cli.user.unwrap_or_else(|| SYSTEM_USER.to_string());
    let command = cli.command.unwrap_or(Commands::Import);
    if matches!(command, Commands::Schedule) {
        config.scheduler_enabled = true;
    }

    let workspace = Workspace::open(config).await?;
    let engine = &workspace.consolidator;

    match command {
        Commands::Import => print_outcome(&engine.run_batch_import(&user).await)?,
        Commands::Edit(args) => {
            let event = EditEvent {
                source_id: args.source,
                table_id: args.table,
                start_row: args.row,
                num_rows: args.rows,
                start_column: args.column,
                num_columns: args.columns,
                user: Some(user.clone()),
            };
            print_outcome(&engine.handle_edit(event).await)?;
        }
        Commands::Rebuild => print_outcome(&engine.rebuild_full_reset(&user).await)?,
        Commands::Reimport => print_outcome(&engine.reimport_without_clearing(&user).await)?,
        Commands::SeedCursors => print_outcome(&engine.seed_cursors(&user).await)?,
        Commands::ResetFlags => print_outcome(&engine.reset_duplicate_flags(&user).await)?,
        Commands::Duplicates => print_outcome(&engine.run_duplicate_pass(&user).await)?,
        Commands::Manual(args) => {
            let entry = ManualEntry {
                first_name: args.first_name,
                last_name: args.last_name,
                dob: args.dob,
                origin: args.origin,
                user: Some(user.clone()),
            };
            print_outcome(&engine.add_manual_record(entry).await)?;
        }
        Commands::Schedule => {
            let Some(mut sched) = engine.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %engine.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }
    Ok(())
}
