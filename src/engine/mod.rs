//! The synchronization and import engine.
//!
//! `CatalogEngine` owns nothing but its configuration and an HTTP client;
//! all state lives in the store file and the image directory it is pointed at.

pub mod cleanup;
pub mod download;
pub mod export;
pub mod import;
pub mod index;
pub mod manifest;
pub mod reconcile;
pub mod swap;
pub mod version_gate;

#[cfg(test)]
mod test_support;

use std::path::Path;

use reqwest::Client;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{CatalogError, Result};
use crate::model::{
    CleanupReport, ExportReport, ImageIndexReport, ImportReport, Manifest, StoreStatus, SyncReport,
};
use crate::store::{
    META_SCHEMA_VERSION_KEY, META_UPDATED_AT_KEY, StoreLock, count_rows, open_store,
    read_db_version, read_meta,
};

use download::Downloader;
use index::{ImageIndexer, collect_image_files, matcher_for};
use manifest::fetch_manifest;
use reconcile::{plan, scan_local_images};
use swap::DatabaseSwapper;
use version_gate::should_replace_database;

pub struct CatalogEngine {
    config: EngineConfig,
    client: Client,
}

impl CatalogEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("catalog-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| CatalogError::ClientSetup(err.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// One full sync cycle: swap the store if the manifest is newer, fetch
    /// missing or changed images, then index what is on disk.
    pub async fn sync_from_manifest(&self, source: &str) -> Result<SyncReport> {
        let manifest = fetch_manifest(&self.client, source).await?;
        let local_version = self.local_db_version().await?;

        let updated_db = if should_replace_database(manifest.db.version, local_version) {
            info!(
                remote = manifest.db.version,
                local = local_version,
                "newer database published"
            );
            let outcome =
                DatabaseSwapper::new(&self.client, self.config.retry, &self.config.db_path)
                    .replace(
                        &manifest.db.url,
                        manifest.db.version,
                        manifest.db.sha256.as_deref(),
                    )
                    .await?;
            debug!(version = outcome.version, "swap finished");
            outcome.updated
        } else {
            info!(
                remote = manifest.db.version,
                local = local_version,
                "database up to date"
            );
            false
        };

        let downloads = self.reconcile_images(&manifest).await?;
        let present = present_manifest_files(&self.config.images_dir, &manifest);
        let image_index = self.index_files(present).await?;
        let db_version = self.local_db_version().await?;

        Ok(SyncReport {
            updated_db,
            db_version,
            downloaded_images: downloads.downloaded,
            image_errors: downloads.errors,
            failed_images: downloads.failures,
            image_index,
        })
    }

    /// Indexes every file name the manifest lists, whether or not it has
    /// been downloaded yet.
    pub async fn index_images_from_manifest(&self, source: &str) -> Result<ImageIndexReport> {
        let manifest = fetch_manifest(&self.client, source).await?;
        let files = manifest
            .images
            .files
            .into_iter()
            .map(|entry| entry.file)
            .collect();
        self.index_files(files).await
    }

    pub fn index_images_from_dir(&self, root: &Path) -> Result<ImageIndexReport> {
        let files = collect_image_files(root);
        info!(root = %root.display(), files = files.len(), "indexing image directory");
        index_blocking(&self.config, &files)
    }

    pub fn import_excel(&self, path: &Path) -> Result<ImportReport> {
        let sheet = import::read_first_sheet(path)?;
        info!(path = %path.display(), rows = sheet.rows.len(), "importing spreadsheet");

        let _lock = StoreLock::acquire(&self.config.db_path)?;
        let mut connection = open_store(&self.config.db_path)?;
        import::import_sheet(&mut connection, &sheet)
    }

    pub fn export_db_to(&self, dest: &Path) -> Result<ExportReport> {
        export::export_db_to(&self.config.db_path, dest)
    }

    pub async fn cleanup_images(&self, source: &str, dry_run: bool) -> Result<CleanupReport> {
        let manifest = fetch_manifest(&self.client, source).await?;
        let db_path = self.config.db_path.clone();
        let images_dir = self.config.images_dir.clone();
        let min_age = self.config.cleanup_min_age;

        tokio::task::spawn_blocking(move || {
            cleanup::cleanup_images(
                &db_path,
                &images_dir,
                &manifest.images.files,
                min_age,
                dry_run,
            )
        })
        .await
        .map_err(|err| CatalogError::Io(std::io::Error::other(err)))?
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let connection = open_store(&self.config.db_path)?;
        let image_files = if self.config.images_dir.is_dir() {
            collect_image_files(&self.config.images_dir).len()
        } else {
            0
        };

        Ok(StoreStatus {
            db_path: self.config.db_path.clone(),
            images_dir: self.config.images_dir.clone(),
            db_version: read_db_version(&connection)?,
            schema_version: read_meta(&connection, META_SCHEMA_VERSION_KEY)?,
            updated_at: read_meta(&connection, META_UPDATED_AT_KEY)?,
            brands: count_rows(&connection, "SELECT COUNT(*) FROM brands")?,
            vehicles: count_rows(&connection, "SELECT COUNT(*) FROM vehicles")?,
            products: count_rows(&connection, "SELECT COUNT(*) FROM products")?,
            images: count_rows(&connection, "SELECT COUNT(*) FROM images")?,
            image_files,
        })
    }

    async fn local_db_version(&self) -> Result<i64> {
        let db_path = self.config.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let connection = open_store(&db_path)?;
            read_db_version(&connection)
        })
        .await
        .map_err(|err| CatalogError::Io(std::io::Error::other(err)))?
    }

    async fn reconcile_images(&self, manifest: &Manifest) -> Result<download::DownloadReport> {
        let images_dir = self.config.images_dir.clone();
        let declared = manifest.images.files.clone();

        let plan = tokio::task::spawn_blocking(move || {
            crate::util::ensure_directory(&images_dir)?;
            let listing = scan_local_images(&images_dir, &declared)?;
            Ok::<_, CatalogError>(plan(&declared, &listing))
        })
        .await
        .map_err(|err| CatalogError::Io(std::io::Error::other(err)))??;

        info!(
            declared = manifest.images.files.len(),
            to_download = plan.to_download.len(),
            up_to_date = plan.up_to_date,
            orphaned = plan.to_delete_optionally.len(),
            "image plan ready"
        );

        Downloader::new(
            self.client.clone(),
            self.config.retry,
            self.config.download_workers,
        )
        .fetch_all(
            &plan.to_download,
            &manifest.images.base_url,
            &self.config.images_dir,
        )
        .await
    }

    async fn index_files(&self, files: Vec<String>) -> Result<ImageIndexReport> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || index_blocking(&config, &files))
            .await
            .map_err(|err| CatalogError::Io(std::io::Error::other(err)))?
    }
}

fn index_blocking(config: &EngineConfig, files: &[String]) -> Result<ImageIndexReport> {
    let _lock = StoreLock::acquire(&config.db_path)?;
    let mut connection = open_store(&config.db_path)?;
    let matcher = matcher_for(config.code_matching);
    ImageIndexer::new(matcher.as_ref()).index(&mut connection, files)
}

fn present_manifest_files(images_dir: &Path, manifest: &Manifest) -> Vec<String> {
    manifest
        .images
        .files
        .iter()
        .filter(|entry| images_dir.join(&entry.file).is_file())
        .map(|entry| entry.file.clone())
        .collect()
}
