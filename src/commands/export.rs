use anyhow::{Context, Result};
use tracing::info;

use crate::cli::ExportArgs;
use crate::commands::{build_engine, emit_report, engine_config};

pub fn run(args: ExportArgs) -> Result<()> {
    let engine = build_engine(engine_config(&args.store, None))?;

    let report = engine
        .export_db_to(&args.dest)
        .with_context(|| format!("failed to export store to {}", args.dest.display()))?;

    info!(
        output = %report.output.display(),
        db_version = report.db_version,
        bytes = report.bytes,
        "export completed"
    );

    emit_report(&report, &args.output)
}
