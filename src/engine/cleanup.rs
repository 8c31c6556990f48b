//! Explicit removal of images the manifest no longer declares.
//!
//! Routine syncs never delete; this pass does, and only for files that have
//! been left alone for at least the configured minimum age. It never waits
//! for another writer: a held store lock fails the pass with `StoreLocked`.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use rusqlite::params;
use tracing::{info, warn};

use crate::engine::reconcile::{plan, scan_local_images};
use crate::error::Result;
use crate::model::{CleanupReport, ManifestFile};
use crate::store::{StoreLock, open_store};

pub fn cleanup_images(
    db_path: &Path,
    images_dir: &Path,
    declared: &[ManifestFile],
    min_age: Duration,
    dry_run: bool,
) -> Result<CleanupReport> {
    let mut report = CleanupReport {
        dry_run,
        ..CleanupReport::default()
    };

    let _lock = if dry_run {
        None
    } else {
        Some(StoreLock::try_acquire(db_path)?)
    };

    let listing = scan_local_images(images_dir, &[])?;
    let orphans = plan(declared, &listing).to_delete_optionally;
    let now = SystemTime::now();

    let mut removed_images = Vec::new();
    let targets = orphans
        .iter()
        .map(|file| (file, true))
        .chain(listing.partials.iter().map(|file| (file, false)));

    for (file, indexed) in targets {
        report.candidates += 1;
        let path = images_dir.join(file);

        if !old_enough(&path, now, min_age) {
            report.kept_recent += 1;
            continue;
        }
        if dry_run {
            info!(file = %file, "would remove");
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                report.deleted += 1;
                if indexed {
                    removed_images.push(file.clone());
                }
            }
            Err(err) => {
                report.errors += 1;
                warn!(file = %file, error = %err, "failed to remove orphaned image");
            }
        }
    }

    if !removed_images.is_empty() {
        let mut connection = open_store(db_path)?;
        let tx = connection.transaction()?;
        {
            let mut delete = tx.prepare("DELETE FROM images WHERE file = ?1")?;
            for file in &removed_images {
                report.image_rows_removed += delete.execute(params![file])?;
            }
        }
        tx.commit()?;
    }

    info!(
        dry_run,
        candidates = report.candidates,
        deleted = report.deleted,
        kept_recent = report.kept_recent,
        errors = report.errors,
        "image cleanup finished"
    );
    Ok(report)
}

fn old_enough(path: &Path, now: SystemTime, min_age: Duration) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|meta| meta.modified()) else {
        return false;
    };
    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
    age >= min_age
}
