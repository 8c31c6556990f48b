use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::{CatalogError, Result};
use crate::model::ExportReport;
use crate::store::{read_db_version, sidecar_path};
use crate::util::{ensure_directory, utc_compact_string};

/// Writes a compacted, self-contained snapshot of the store to `dest`.
///
/// `dest` may name a file or an existing directory; in the latter case the
/// snapshot is called `catalog-<UTC timestamp>.db`.
pub fn export_db_to(db_path: &Path, dest: &Path) -> Result<ExportReport> {
    if !db_path.is_file() {
        return Err(CatalogError::ExportFailed(format!(
            "no store at {}",
            db_path.display()
        )));
    }

    let output = resolve_output(dest);
    if same_file(db_path, &output) {
        return Err(CatalogError::ExportFailed(format!(
            "refusing to export over the live store: {}",
            output.display()
        )));
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }

    let partial = sidecar_path(&output, ".partial");
    remove_if_present(&partial);

    match snapshot(db_path, &partial, &output) {
        Ok(report) => {
            info!(
                output = %report.output.display(),
                db_version = report.db_version,
                bytes = report.bytes,
                "store exported"
            );
            Ok(report)
        }
        Err(err) => {
            remove_if_present(&partial);
            Err(match err {
                CatalogError::ExportFailed(_) => err,
                other => CatalogError::ExportFailed(other.to_string()),
            })
        }
    }
}

fn snapshot(db_path: &Path, partial: &Path, output: &Path) -> Result<ExportReport> {
    {
        let live = Connection::open(db_path)?;
        live.busy_timeout(Duration::from_secs(30))?;
        live.execute("VACUUM INTO ?1", [partial.to_string_lossy().as_ref()])?;
    }

    let db_version = {
        let copy = Connection::open(partial)?;
        let _: String =
            copy.pragma_update_and_check(None, "journal_mode", "DELETE", |row| row.get(0))?;
        let verdict: String = copy.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(CatalogError::ExportFailed(format!(
                "snapshot failed integrity check: {verdict}"
            )));
        }
        read_db_version(&copy)?
    };

    fs::rename(partial, output)?;
    let bytes = fs::metadata(output)?.len();

    Ok(ExportReport {
        ok: true,
        output: output.to_path_buf(),
        db_version,
        bytes,
    })
}

fn resolve_output(dest: &Path) -> PathBuf {
    if dest.is_dir() {
        dest.join(format!("catalog-{}.db", utc_compact_string(Utc::now())))
    } else {
        dest.to_path_buf()
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn remove_if_present(path: &Path) {
    if path.exists() {
        if let Err(err) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %err, "failed to remove partial export");
        }
    }
}
