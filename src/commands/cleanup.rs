use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::CleanupArgs;
use crate::commands::{block_on, build_engine, emit_report, engine_config};

pub fn run(args: CleanupArgs) -> Result<()> {
    let mut config = engine_config(&args.store, Some(&args.network));
    config.cleanup_min_age = Duration::from_secs(args.min_age_secs);
    let engine = build_engine(config)?;

    let report = block_on(engine.cleanup_images(&args.manifest, args.dry_run))?
        .with_context(|| format!("cleanup against {} failed", args.manifest))?;

    info!(
        dry_run = report.dry_run,
        candidates = report.candidates,
        deleted = report.deleted,
        kept_recent = report.kept_recent,
        errors = report.errors,
        image_rows_removed = report.image_rows_removed,
        "cleanup completed"
    );

    emit_report(&report, &args.output)
}
