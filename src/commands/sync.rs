use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::SyncArgs;
use crate::commands::{block_on, build_engine, emit_report, engine_config};

pub fn run(args: SyncArgs) -> Result<()> {
    let engine = build_engine(engine_config(&args.store, Some(&args.network)))?;
    info!(manifest = %args.manifest, "sync requested");

    let report = block_on(engine.sync_from_manifest(&args.manifest))?
        .with_context(|| format!("sync from {} failed", args.manifest))?;

    for failure in &report.failed_images {
        warn!(file = %failure.file, reason = %failure.reason, "image not updated");
    }
    info!(
        updated_db = report.updated_db,
        db_version = report.db_version,
        downloaded_images = report.downloaded_images,
        image_errors = report.image_errors,
        indexed = report.image_index.inserted,
        "sync completed"
    );

    emit_report(&report, &args.output)
}
