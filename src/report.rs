use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use crate::migration::{CleanupOutcome, MigrationResult, RunOutcome};

/// Column sums across every step of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub source_count: u64,
    pub inserted_count: u64,
    pub skipped_duplicates: u64,
    pub skipped_by_transform: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

pub fn totals(results: &[MigrationResult]) -> Totals {
    results.iter().fold(Totals::default(), |mut acc, result| {
        acc.source_count += result.source_count;
        acc.inserted_count += result.inserted_count;
        acc.skipped_duplicates += result.skipped_duplicates;
        acc.skipped_by_transform += result.skipped_by_transform;
        acc.errors += result.errors;
        acc.duration_ms += millis(result.duration);
        acc
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Fixed-width summary, one row per step followed by a TOTAL row.
pub fn render_table(results: &[MigrationResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<21} {:>10} {:>10} {:>10} {:>10} {:>8} {:>13}",
        "Step", "Status", "Source", "Inserted", "Duplicates", "Skipped", "Errors", "Duration (ms)"
    );
    for result in results {
        let _ = writeln!(
            out,
            "{:<20} {:<21} {:>10} {:>10} {:>10} {:>10} {:>8} {:>13}",
            result.step_name,
            result.status.as_str(),
            result.source_count,
            result.inserted_count,
            result.skipped_duplicates,
            result.skipped_by_transform,
            result.errors,
            millis(result.duration)
        );
    }
    let total = totals(results);
    let _ = writeln!(
        out,
        "{:<20} {:<21} {:>10} {:>10} {:>10} {:>10} {:>8} {:>13}",
        "TOTAL",
        "",
        total.source_count,
        total.inserted_count,
        total.skipped_duplicates,
        total.skipped_by_transform,
        total.errors,
        total.duration_ms
    );

    let failures: Vec<_> = results
        .iter()
        .filter_map(|result| result.failure.as_ref().map(|err| (&result.step_name, err)))
        .collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "\nFailures:");
        for (step, err) in failures {
            let _ = writeln!(out, "{:<20} {}", step, err.to_string().replace('\n', " "));
        }
    }

    let carried: Vec<_> = results
        .iter()
        .filter(|result| result.carried_errors > 0)
        .collect();
    if !carried.is_empty() {
        let _ = writeln!(
            out,
            "\nErrors from earlier runs behind the checkpoint (--reset-checkpoint rescans):"
        );
        for result in carried {
            let _ = writeln!(out, "{:<20} {}", result.step_name, result.carried_errors);
        }
    }
    out
}

/// Full human summary: mode line, step table, and cleanup state.
pub fn render_outcome(outcome: &RunOutcome) -> String {
    let mut out = String::new();
    let mode = if outcome.dry_run { "dry run" } else { "live" };
    let _ = writeln!(out, "Migration summary ({mode})");
    out.push_str(&render_table(&outcome.results));
    if let Some(step) = &outcome.halted_at {
        let _ = writeln!(out, "\nHalted at: {step}");
    }
    if outcome.cleanup != CleanupOutcome::NotRequested {
        let _ = writeln!(out, "\nCleanup: {}", cleanup_label(&outcome.cleanup));
    }
    out
}

pub fn cleanup_label(cleanup: &CleanupOutcome) -> String {
    match cleanup {
        CleanupOutcome::NotRequested => "not requested".into(),
        CleanupOutcome::Ineligible { reason } => format!("skipped ({reason})"),
        CleanupOutcome::Declined => "declined".into(),
        CleanupOutcome::Dropped { collections } if collections.is_empty() => {
            "nothing to drop".into()
        }
        CleanupOutcome::Dropped { collections } => {
            format!("dropped {}", collections.join(", "))
        }
        CleanupOutcome::Failed { dropped, error } => {
            if dropped.is_empty() {
                format!("failed: {error}")
            } else {
                format!("failed after dropping {}: {error}", dropped.join(", "))
            }
        }
    }
}

/// Single JSON object with per-step results, totals, and the exit code.
pub fn render_json(outcome: &RunOutcome) -> serde_json::Result<String> {
    let value = json!({
        "dry_run": outcome.dry_run,
        "results": outcome.results,
        "totals": totals(&outcome.results),
        "halted_at": outcome.halted_at,
        "cleanup": outcome.cleanup,
        "exit_code": outcome.exit_code(),
    });
    serde_json::to_string_pretty(&value)
}
