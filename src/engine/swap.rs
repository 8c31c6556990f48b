//! Fail-closed replacement of the active store with a published one.

use std::fs;
use std::path::{Path, PathBuf};

use reqwest::{Client, Url};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::engine::download::fetch_to_path;
use crate::engine::version_gate::should_replace_database;
use crate::error::{CatalogError, Result};
use crate::store::{
    StoreLock, ensure_schema, open_store, read_db_version, sidecar_path, write_db_version,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapOutcome {
    pub updated: bool,
    pub version: i64,
}

pub struct DatabaseSwapper<'a> {
    client: &'a Client,
    retry: RetryPolicy,
    db_path: &'a Path,
}

impl<'a> DatabaseSwapper<'a> {
    pub fn new(client: &'a Client, retry: RetryPolicy, db_path: &'a Path) -> Self {
        Self {
            client,
            retry,
            db_path,
        }
    }

    /// Downloads the published store, verifies it, and renames it over the
    /// active one. On any failure the active store is untouched.
    pub async fn replace(
        &self,
        remote_url: &str,
        remote_version: i64,
        sha256: Option<&str>,
    ) -> Result<SwapOutcome> {
        let staged = staging_path(self.db_path);
        remove_staged(&staged);

        let result = self.stage_and_activate(remote_url, remote_version, sha256, &staged).await;
        if result.is_err() {
            remove_staged(&staged);
        }
        result
    }

    async fn stage_and_activate(
        &self,
        remote_url: &str,
        remote_version: i64,
        sha256: Option<&str>,
        staged: &Path,
    ) -> Result<SwapOutcome> {
        let url = Url::parse(remote_url)
            .map_err(|err| CatalogError::StoreSwapFailed(format!("db.url {remote_url}: {err}")))?;

        let bytes = fetch_to_path(self.client, &self.retry, &url, staged, sha256)
            .await
            .map_err(|err| CatalogError::StoreSwapFailed(format!("download {remote_url}: {err}")))?;
        debug!(bytes, path = %staged.display(), "published store staged");

        let staged_owned = staged.to_path_buf();
        let db_path = self.db_path.to_path_buf();
        let activation =
            tokio::task::spawn_blocking(move || activate(&staged_owned, &db_path, remote_version));
        let outcome = activation
            .await
            .map_err(|err| CatalogError::StoreSwapFailed(format!("activation task: {err}")))??;

        if outcome.updated {
            info!(version = remote_version, path = %self.db_path.display(), "store replaced");
        } else {
            remove_staged(staged);
            info!(
                remote = remote_version,
                local = outcome.version,
                "store advanced while downloading, published copy discarded"
            );
        }
        Ok(outcome)
    }
}

fn staging_path(db_path: &Path) -> PathBuf {
    sidecar_path(db_path, ".incoming")
}

fn remove_staged(staged: &Path) {
    for path in [
        staged.to_path_buf(),
        sidecar_path(staged, "-wal"),
        sidecar_path(staged, "-shm"),
        sidecar_path(staged, "-journal"),
    ] {
        if path.exists() {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "failed to remove staged store");
            }
        }
    }
}

/// Everything that can still fail happens on the staged copy; the rename is last.
///
/// The version gate is applied again under the lock, since a writer may have
/// advanced the active store while the published copy was downloading.
fn activate(staged: &Path, db_path: &Path, version: i64) -> Result<SwapOutcome> {
    let _lock = StoreLock::acquire(db_path)?;

    if db_path.exists() {
        let current = active_version(db_path).map_err(into_swap_failure)?;
        if !should_replace_database(version, current) {
            return Ok(SwapOutcome {
                updated: false,
                version: current,
            });
        }
    }

    prepare_staged(staged, version).map_err(into_swap_failure)?;

    if db_path.exists() {
        checkpoint_active(db_path).map_err(into_swap_failure)?;
    }

    fs::rename(staged, db_path)
        .map_err(|err| CatalogError::StoreSwapFailed(format!("rename into place: {err}")))?;

    // Sidecars of the old store must not be replayed against the new file.
    for suffix in ["-wal", "-shm"] {
        let sidecar = sidecar_path(db_path, suffix);
        if sidecar.exists() {
            if let Err(err) = fs::remove_file(&sidecar) {
                warn!(path = %sidecar.display(), error = %err, "failed to remove stale sidecar");
            }
        }
    }
    Ok(SwapOutcome {
        updated: true,
        version,
    })
}

fn active_version(db_path: &Path) -> Result<i64> {
    let connection = open_store(db_path)?;
    read_db_version(&connection)
}

fn prepare_staged(staged: &Path, version: i64) -> Result<()> {
    let connection = Connection::open(staged)?;
    let verdict: String = connection.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        return Err(CatalogError::StoreSwapFailed(format!(
            "published store failed integrity check: {verdict}"
        )));
    }

    ensure_schema(&connection)?;
    write_db_version(&connection, version)?;
    let mode: String = connection.pragma_update_and_check(None, "journal_mode", "DELETE", |row| {
        row.get(0)
    })?;
    debug!(journal_mode = %mode, "staged store finalized");
    Ok(())
}

fn checkpoint_active(db_path: &Path) -> Result<()> {
    let connection = Connection::open(db_path)?;
    connection.busy_timeout(std::time::Duration::from_secs(30))?;
    let busy: i64 = connection.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))?;
    if busy != 0 {
        warn!(path = %db_path.display(), "active store busy during checkpoint");
    }
    Ok(())
}

fn into_swap_failure(err: CatalogError) -> CatalogError {
    match err {
        CatalogError::StoreSwapFailed(_) => err,
        other => CatalogError::StoreSwapFailed(other.to_string()),
    }
}
