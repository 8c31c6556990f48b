//! Manifest document parsing and validation.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{CatalogError, Result};
use crate::model::{Manifest, ManifestDb, ManifestFile, ManifestImages};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    app_version: Option<String>,
    app_download_url: Option<String>,
    db: Option<RawDb>,
    images: Option<RawImages>,
}

#[derive(Debug, Deserialize)]
struct RawDb {
    version: Option<i64>,
    url: Option<String>,
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawImages {
    base_url: Option<String>,
    #[serde(default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    file: String,
    sha256: Option<String>,
}

/// Parses and validates a manifest document. Pure: no I/O.
pub fn parse(raw: &[u8]) -> Result<Manifest> {
    let raw: RawManifest = serde_json::from_slice(raw)
        .map_err(|err| CatalogError::ManifestInvalid(format!("malformed JSON: {err}")))?;

    let db = raw.db.ok_or_else(|| invalid("missing `db` section"))?;
    let version = db.version.ok_or_else(|| invalid("missing `db.version`"))?;
    if version < 0 {
        return Err(invalid(format!("negative `db.version`: {version}")));
    }
    let db_url = db
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| invalid("missing `db.url`"))?;
    validate_http_url(db_url.trim(), "db.url")?;

    let images = raw.images.ok_or_else(|| invalid("missing `images` section"))?;
    let base_url = images
        .base_url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| invalid("missing `images.base_url`"))?;
    let base_url = normalize_base_url(base_url.trim());
    validate_http_url(&base_url, "images.base_url")?;

    let checksum = Regex::new(r"^[0-9a-fA-F]{64}$")
        .map_err(|err| invalid(format!("checksum pattern: {err}")))?;

    let mut files = Vec::with_capacity(images.files.len());
    for entry in images.files {
        let file = normalize_relative_path(&entry.file)
            .ok_or_else(|| invalid(format!("unsafe image path: {:?}", entry.file)))?;
        let sha256 = normalize_checksum(entry.sha256, &checksum, &file)?;
        files.push(ManifestFile { file, sha256 });
    }

    Ok(Manifest {
        app_version: raw.app_version,
        app_download_url: raw.app_download_url,
        db: ManifestDb {
            version,
            url: db_url.trim().to_string(),
            sha256: normalize_checksum(db.sha256, &checksum, "db")?,
        },
        images: ManifestImages {
            base_url,
            files: dedupe_files(files),
        },
    })
}

/// Loads a manifest from an `http(s)://` URL or a local file path.
pub async fn fetch_manifest(client: &Client, source: &str) -> Result<Manifest> {
    let bytes = if source.starts_with("http://") || source.starts_with("https://") {
        let response = client.get(source).send().await.map_err(|err| {
            CatalogError::NetworkUnreachable(format!("manifest {source}: {err}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::NetworkUnreachable(format!(
                "manifest {source} returned {status}"
            )));
        }
        let body = response.bytes().await.map_err(|err| {
            CatalogError::NetworkUnreachable(format!("manifest {source}: {err}"))
        })?;
        body.to_vec()
    } else {
        tokio::fs::read(Path::new(source)).await.map_err(|err| {
            CatalogError::NetworkUnreachable(format!("manifest {source}: {err}"))
        })?
    };

    let manifest = parse(&bytes)?;
    info!(
        source,
        db_version = manifest.db.version,
        image_count = manifest.images.files.len(),
        "manifest loaded"
    );
    Ok(manifest)
}

/// Sanitizes a manifest file entry into a `/`-separated relative path.
///
/// Returns `None` for anything that could resolve outside the image root.
pub fn normalize_relative_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() || unified.starts_with('/') || unified.contains("://") {
        return None;
    }

    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return None;
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

fn normalize_base_url(base_url: &str) -> String {
    if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    }
}

fn validate_http_url(value: &str, field: &str) -> Result<()> {
    let url = Url::parse(value).map_err(|err| invalid(format!("`{field}` {value:?}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid(format!("`{field}` must be an http(s) URL: {value}")));
    }
    Ok(())
}

fn normalize_checksum(
    value: Option<String>,
    pattern: &Regex,
    owner: &str,
) -> Result<Option<String>> {
    match value.map(|value| value.trim().to_string()) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) if pattern.is_match(&value) => Ok(Some(value.to_ascii_lowercase())),
        Some(value) => Err(invalid(format!("bad sha256 for {owner}: {value:?}"))),
    }
}

/// Two entries naming the same local file: the last one listed wins.
fn dedupe_files(files: Vec<ManifestFile>) -> Vec<ManifestFile> {
    let mut position = HashMap::<String, usize>::new();
    let mut out: Vec<ManifestFile> = Vec::with_capacity(files.len());

    for entry in files {
        if let Some(&index) = position.get(&entry.file) {
            warn!(file = %entry.file, "manifest lists file more than once, keeping last entry");
            out[index] = entry;
        } else {
            position.insert(entry.file.clone(), out.len());
            out.push(entry);
        }
    }

    out
}

fn invalid(message: impl Into<String>) -> CatalogError {
    CatalogError::ManifestInvalid(message.into())
}
