use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use legacy_migrate::{
    checkpoint::CheckpointStore,
    config::{MigrateConfig, RunOptions, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE, MIN_BATCH_SIZE},
    db::Connection,
    error::codes,
    init_logging,
    lock::RunLock,
    migration::{BatchObserver, BatchStats, ConfirmDrop, MigrationRunner, RunControl, RunPlan},
    report,
    steps::{default_registry, StepRegistry},
    AppError,
};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "migrate",
    about = "Move legacy collections into the new schema in resumable batches"
)]
struct Cli {
    /// Compute what would happen without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Continue each step from its last committed batch
    #[arg(long)]
    resume: bool,

    /// Documents per batch
    #[arg(long = "batch", value_name = "N", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Run only this step
    #[arg(long, value_name = "NAME")]
    step: Option<String>,

    /// Drop the legacy collections after every step completed cleanly
    #[arg(long)]
    drop_old: bool,

    /// Answer yes to the --drop-old confirmation
    #[arg(long)]
    yes: bool,

    /// Forget stored checkpoints for the selected steps before running
    #[arg(long)]
    reset_checkpoint: bool,

    /// Clear a run lock left behind by a killed process
    #[arg(long)]
    force_unlock: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// List registered steps with their checkpoint state and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {}", format_cli_error(&err));
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    // Everything that can be checked without a database is checked first.
    let config = MigrateConfig::from_env()?;
    let options = RunOptions {
        batch_size: cli.batch_size,
        dry_run: cli.dry_run,
        resume: cli.resume,
    };
    options.validate()?;
    let registry = default_registry().map_err(AppError::from)?;
    if let Some(name) = cli.step.as_deref() {
        registry.select(Some(name)).map_err(AppError::from)?;
    }

    let conn = Connection::connect(&config).await?;
    let code = with_connection(&cli, options, &registry, &conn).await;
    conn.disconnect().await;
    code
}

async fn with_connection(
    cli: &Cli,
    options: RunOptions,
    registry: &StepRegistry,
    conn: &Connection,
) -> Result<i32> {
    if cli.list {
        print_step_list(registry, conn).await;
        return Ok(0);
    }

    if cli.force_unlock {
        if options.dry_run {
            warn!(
                target: "legacy_migrate",
                event = "force_unlock_ignored",
                reason = "dry_run"
            );
            eprintln!("Ignoring --force-unlock: a dry run does not take the lock.");
        } else if RunLock::force_clear(conn).await? {
            eprintln!("Cleared a stale run lock.");
        }
    }

    let lock = if options.dry_run {
        None
    } else {
        Some(RunLock::acquire(conn).await?)
    };

    let result = run_steps(cli, options, registry, conn).await;

    if let Some(lock) = lock {
        if let Err(err) = lock.release().await {
            warn!(
                target: "legacy_migrate",
                event = "lock_release_failed",
                error = %err
            );
        }
    }

    let outcome = result?;
    if cli.json {
        println!("{}", report::render_json(&outcome).context("serialize summary")?);
    } else {
        print!("{}", report::render_outcome(&outcome));
    }
    Ok(outcome.exit_code())
}

async fn run_steps(
    cli: &Cli,
    options: RunOptions,
    registry: &StepRegistry,
    conn: &Connection,
) -> Result<legacy_migrate::migration::RunOutcome> {
    let control = RunControl::new();
    let mut runner = MigrationRunner::new(conn, registry).with_control(control.clone());
    if !cli.json {
        runner = runner.with_observer(progress_observer());
    }

    let plan = RunPlan {
        steps: cli.step.iter().cloned().collect(),
        options,
        reset_checkpoints: cli.reset_checkpoint,
        drop_old: cli.drop_old,
        confirm_drop: cli.drop_old.then(|| confirm_drop(cli.yes)),
    };

    let run_future = runner.run(plan);
    tokio::pin!(run_future);
    let mut listen = true;
    let outcome = loop {
        tokio::select! {
            result = &mut run_future => break result,
            signal = signal::ctrl_c(), if listen => match signal {
                Ok(()) => {
                    if !control.is_cancelled() {
                        eprintln!("Received interrupt. Finishing current batch before exiting…");
                        control.cancel();
                    }
                }
                Err(err) => {
                    warn!(
                        target: "legacy_migrate",
                        event = "signal_handler_unavailable",
                        error = %err
                    );
                    listen = false;
                }
            },
        }
    };
    Ok(outcome?)
}

fn progress_observer() -> BatchObserver {
    Arc::new(|batch: &BatchStats| {
        eprintln!(
            "{:<20} batch {:>5}  scanned {:>6}  inserted {:>6}  duplicates {:>6}  skipped {:>6}  errors {:>6}  {:>6} ms",
            batch.step_name,
            batch.batch_index,
            batch.scanned,
            batch.inserted,
            batch.duplicates,
            batch.skipped,
            batch.errors,
            batch.elapsed_ms
        );
    })
}

fn confirm_drop(assume_yes: bool) -> ConfirmDrop {
    if assume_yes {
        return Box::new(|collections| {
            info!(
                target: "legacy_migrate",
                event = "cleanup_confirmed",
                collections = %collections.join(","),
                via = "flag"
            );
            true
        });
    }
    Box::new(|collections| {
        eprintln!("About to drop legacy collections: {}", collections.join(", "));
        eprint!("Type 'yes' to continue: ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => answer.trim().eq_ignore_ascii_case("yes"),
            Err(_) => false,
        }
    })
}

async fn print_step_list(registry: &StepRegistry, conn: &Connection) {
    let checkpoints = CheckpointStore::new(conn).load().await;
    println!("DB: {}", conn.url());
    println!(
        "{:<16} {:<24} {:<16} {:>10}  Checkpoint",
        "Step", "Source", "Target", "Inserted"
    );
    for step in registry.iter() {
        let (inserted, state) = match checkpoints.get(step.name()) {
            Some(checkpoint) => (
                checkpoint.inserted_count.to_string(),
                format!(
                    "after {} ({})",
                    checkpoint.last_cursor.as_deref().unwrap_or("<start>"),
                    checkpoint.updated_at.to_rfc3339()
                ),
            ),
            None => ("-".to_string(), "none".to_string()),
        };
        println!(
            "{:<16} {:<24} {:<16} {:>10}  {}",
            step.name(),
            step.source_collection(),
            step.target_collection(),
            inserted,
            state
        );
    }
}

fn format_cli_error(err: &anyhow::Error) -> String {
    let Some(err) = err.downcast_ref::<AppError>() else {
        return format!("{err:#}");
    };
    match err.code() {
        codes::CONFIG_INVALID_BATCH => {
            let range = format!("{MIN_BATCH_SIZE}-{MAX_BATCH_SIZE}");
            if let Some(value) = err.context().get("batch_size") {
                return format!("Batch size {value} is outside the supported range ({range}).");
            }
            format!("{} (allowed range: {range})", err.message())
        }
        codes::LOCK_HELD => match err.context().get("holder") {
            Some(holder) => format!(
                "{} Holder {holder} (pid {}) since {}.",
                err.message(),
                err.context().get("pid").map(String::as_str).unwrap_or("?"),
                err.context()
                    .get("acquired_at")
                    .map(String::as_str)
                    .unwrap_or("?")
            ),
            None => err.message().to_string(),
        },
        _ => err.to_string(),
    }
}
