use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::IndexImagesArgs;
use crate::commands::{block_on, build_engine, emit_report, engine_config};

pub fn run(args: IndexImagesArgs) -> Result<()> {
    let engine = build_engine(engine_config(&args.store, Some(&args.network)))?;

    let report = match (&args.root, &args.manifest) {
        (Some(root), _) => engine
            .index_images_from_dir(root)
            .with_context(|| format!("failed to index images under {}", root.display()))?,
        (None, Some(manifest)) => block_on(engine.index_images_from_manifest(manifest))?
            .with_context(|| format!("failed to index images listed by {manifest}"))?,
        (None, None) => bail!("either --root or --manifest (or CATALOG_MANIFEST_URL) is required"),
    };

    info!(
        scanned = report.scanned,
        matched = report.matched,
        inserted = report.inserted,
        "image indexing completed"
    );

    emit_report(&report, &args.output)
}
