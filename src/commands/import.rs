use anyhow::{Context, Result};
use tracing::info;

use crate::cli::ImportArgs;
use crate::commands::{build_engine, emit_report, engine_config};

pub fn run(args: ImportArgs) -> Result<()> {
    let engine = build_engine(engine_config(&args.store, None))?;

    let report = engine
        .import_excel(&args.path)
        .with_context(|| format!("failed to import {}", args.path.display()))?;

    info!(
        processed_rows = report.processed_rows,
        skipped_rows = report.skipped_rows,
        upserted_products = report.upserted_products,
        linked_vehicles = report.linked_vehicles,
        new_db_version = report.new_db_version,
        "import completed"
    );

    emit_report(&report, &args.output)
}
