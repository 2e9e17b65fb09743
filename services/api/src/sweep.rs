use crate::infra::{open_store, LogNotifier};
use clap::Args;
use std::sync::Arc;
use tracing::warn;
use transport_enrollment::config::AppConfig;
use transport_enrollment::enrollment::{EnrollmentService, SweepReport};
use transport_enrollment::error::AppError;
use transport_enrollment::telemetry;

#[derive(Args, Debug, Default)]
pub(crate) struct SweepArgs {
    /// Retention window in days (defaults to ENROLLMENT_RETENTION_DAYS)
    #[arg(long)]
    pub(crate) days: Option<u32>,
    /// List the forms that would be removed without deleting them
    #[arg(long)]
    pub(crate) dry_run: bool,
}

/// Sweeps the configured snapshot directly. Opening the store takes the
/// snapshot lock, so this refuses to run beside a live server.
pub(crate) async fn run_sweep(args: SweepArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let store = open_store(&config.store).await.map_err(|err| {
        warn!(
            error = %err,
            "snapshot unavailable; sweep a running server through POST /api/v1/admin/sweep"
        );
        err
    })?;
    let store = Arc::new(store);
    let service = EnrollmentService::new(store, Arc::new(LogNotifier), &config.enrollment);

    let retention = args
        .days
        .map(|days| chrono::Duration::days(i64::from(days)))
        .unwrap_or_else(|| service.retention());
    let report = service.sweep_expired(retention, args.dry_run).await?;
    render_sweep_report(&report);
    Ok(())
}

pub(crate) fn render_sweep_report(report: &SweepReport) {
    if report.dry_run {
        println!(
            "Dry run: {} pending form(s) submitted before {}",
            report.candidates.len(),
            report.cutoff
        );
        for entry in &report.candidates {
            println!(
                "- guardian {} ({}) national id {} submitted {}",
                entry.guardian_id, entry.identity, entry.national_id, entry.submitted_at
            );
        }
        return;
    }

    println!(
        "Removed {} expired form(s) submitted before {}",
        report.deleted(),
        report.cutoff
    );
    for entry in &report.removed {
        println!(
            "- guardian {} ({}) national id {} submitted {}",
            entry.guardian_id, entry.identity, entry.national_id, entry.submitted_at
        );
    }
    if report.skipped > 0 {
        println!("Skipped {} form(s) decided during the sweep", report.skipped);
    }
    if report.errors > 0 {
        println!("{} form(s) could not be removed; see the log", report.errors);
    }
}
