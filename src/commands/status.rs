use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::{build_engine, emit_report, engine_config};

pub fn run(args: StatusArgs) -> Result<()> {
    let engine = build_engine(engine_config(&args.store, None))?;

    if !engine.config().db_path.exists() {
        warn!(path = %engine.config().db_path.display(), "store missing, creating an empty one");
    }

    let status = engine.status().context("failed to read store status")?;

    info!(
        path = %status.db_path.display(),
        db_version = status.db_version,
        schema_version = %status.schema_version.clone().unwrap_or_default(),
        updated_at = %status.updated_at.clone().unwrap_or_default(),
        brands = status.brands,
        vehicles = status.vehicles,
        products = status.products,
        images = status.images,
        image_files = status.image_files,
        "store status"
    );

    emit_report(&status, &args.output)
}
