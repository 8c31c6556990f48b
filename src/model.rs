use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Validated manifest document. Build one with `engine::manifest::parse`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub app_version: Option<String>,
    pub app_download_url: Option<String>,
    pub db: ManifestDb,
    pub images: ManifestImages,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestDb {
    pub version: i64,
    pub url: String,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestImages {
    /// Always ends with `/`.
    pub base_url: String,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    /// Relative path under `base_url`, `/`-separated.
    pub file: String,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub updated_db: bool,
    pub db_version: i64,
    pub downloaded_images: usize,
    pub image_errors: usize,
    pub failed_images: Vec<AssetFailure>,
    pub image_index: ImageIndexReport,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AssetFailure {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ImageIndexReport {
    pub scanned: usize,
    pub matched: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ImportReport {
    pub processed_rows: usize,
    pub skipped_rows: usize,
    pub upserted_products: usize,
    pub linked_vehicles: usize,
    pub new_db_version: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub ok: bool,
    pub output: PathBuf,
    pub db_version: i64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub candidates: usize,
    pub deleted: usize,
    pub kept_recent: usize,
    pub errors: usize,
    pub image_rows_removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub db_path: PathBuf,
    pub images_dir: PathBuf,
    pub db_version: i64,
    pub schema_version: Option<String>,
    pub updated_at: Option<String>,
    pub brands: i64,
    pub vehicles: i64,
    pub products: i64,
    pub images: i64,
    pub image_files: usize,
}
