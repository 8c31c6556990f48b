//! Diff between the manifest's declared image set and the local image directory.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::model::ManifestFile;
use crate::util::sha256_file;

/// Prefix of in-flight download files inside the image directory.
pub const PARTIAL_PREFIX: &str = ".partial-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    /// Checksum of the on-disk content, computed only when the manifest declares one.
    pub sha256: Option<String>,
}

#[derive(Debug, Default)]
pub struct LocalListing {
    pub files: BTreeMap<String, LocalImage>,
    /// Leftover partial downloads, relative paths.
    pub partials: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_download: Vec<ManifestFile>,
    /// Local files the manifest no longer declares. Advisory: only the
    /// explicit cleanup pass acts on this list.
    pub to_delete_optionally: Vec<String>,
    pub up_to_date: usize,
}

/// Lists the image directory, keyed by `/`-separated relative path.
///
/// Files whose manifest entry carries a checksum are hashed so `plan` can
/// spot changed content.
pub fn scan_local_images(images_dir: &Path, declared: &[ManifestFile]) -> Result<LocalListing> {
    let mut listing = LocalListing::default();
    if !images_dir.exists() {
        return Ok(listing);
    }

    let checksummed: HashSet<&str> = declared
        .iter()
        .filter(|entry| entry.sha256.is_some())
        .map(|entry| entry.file.as_str())
        .collect();

    for entry in WalkDir::new(images_dir).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable image directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(relative) = relative_key(images_dir, entry.path()) else {
            continue;
        };

        if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
            listing.partials.push(relative);
            continue;
        }

        let sha256 = if checksummed.contains(relative.as_str()) {
            match sha256_file(entry.path()) {
                Ok(digest) => Some(digest),
                Err(err) => {
                    warn!(file = %relative, error = %err, "failed to hash local image");
                    None
                }
            }
        } else {
            None
        };
        listing.files.insert(relative, LocalImage { sha256 });
    }

    debug!(
        files = listing.files.len(),
        partials = listing.partials.len(),
        "scanned local images"
    );
    Ok(listing)
}

/// Decides which declared files to fetch and which local files are orphans.
///
/// Matching is exact and case-sensitive on the relative path. A present file
/// is fetched again only when the manifest declares a checksum that differs
/// from the local content.
pub fn plan(declared: &[ManifestFile], local: &LocalListing) -> ReconcilePlan {
    let mut result = ReconcilePlan::default();
    let mut declared_names = HashSet::with_capacity(declared.len());

    for entry in declared {
        declared_names.insert(entry.file.as_str());

        match local.files.get(&entry.file) {
            None => result.to_download.push(entry.clone()),
            Some(present) => match (&entry.sha256, &present.sha256) {
                (Some(expected), Some(actual)) if expected != actual => {
                    debug!(file = %entry.file, "checksum changed, scheduling download");
                    result.to_download.push(entry.clone());
                }
                _ => result.up_to_date += 1,
            },
        }
    }

    result.to_delete_optionally = local
        .files
        .keys()
        .filter(|name| !declared_names.contains(name.as_str()))
        .cloned()
        .collect();

    result
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn declared(file: &str, sha256: Option<&str>) -> ManifestFile {
        ManifestFile {
            file: file.to_string(),
            sha256: sha256.map(ToOwned::to_owned),
        }
    }

    fn local(entries: &[(&str, Option<&str>)]) -> LocalListing {
        LocalListing {
            files: entries
                .iter()
                .map(|(name, sha)| {
                    (
                        name.to_string(),
                        LocalImage {
                            sha256: sha.map(ToOwned::to_owned),
                        },
                    )
                })
                .collect(),
            partials: Vec::new(),
        }
    }

    #[test]
    fn missing_files_are_downloaded_and_present_ones_skipped() {
        let plan = plan(
            &[declared("A1.png", None), declared("B2.png", None)],
            &local(&[("A1.png", None)]),
        );

        assert_eq!(plan.to_download, vec![declared("B2.png", None)]);
        assert_eq!(plan.up_to_date, 1);
        assert!(plan.to_delete_optionally.is_empty());
    }

    #[test]
    fn changed_checksum_triggers_redownload() {
        let plan = plan(
            &[declared("A1.png", Some("new")), declared("B2.png", Some("same"))],
            &local(&[("A1.png", Some("old")), ("B2.png", Some("same"))]),
        );

        assert_eq!(plan.to_download, vec![declared("A1.png", Some("new"))]);
        assert_eq!(plan.up_to_date, 1);
    }

    #[test]
    fn matching_is_case_sensitive() {
        let plan = plan(&[declared("a1.png", None)], &local(&[("A1.png", None)]));

        assert_eq!(plan.to_download.len(), 1);
        assert_eq!(plan.to_delete_optionally, vec!["A1.png".to_string()]);
    }

    #[test]
    fn undeclared_local_files_are_only_advisory() {
        let plan = plan(&[], &local(&[("OLD.png", None), ("sub/X.jpg", None)]));

        assert!(plan.to_download.is_empty());
        assert_eq!(
            plan.to_delete_optionally,
            vec!["OLD.png".to_string(), "sub/X.jpg".to_string()]
        );
    }

    #[test]
    fn scan_hashes_only_checksummed_entries_and_separates_partials() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("sub")).expect("subdir");
        fs::write(dir.path().join("A1.png"), b"abc").expect("write");
        fs::write(dir.path().join("sub").join("B2.png"), b"xyz").expect("write");
        fs::write(dir.path().join(".partial-123"), b"half").expect("write");

        let listing = scan_local_images(
            dir.path(),
            &[declared("A1.png", Some("ignored")), declared("sub/B2.png", None)],
        )
        .expect("scan");

        assert_eq!(listing.files.len(), 2);
        assert_eq!(
            listing.files["A1.png"].sha256.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(listing.files["sub/B2.png"].sha256, None);
        assert_eq!(listing.partials, vec![".partial-123".to_string()]);
    }

    #[test]
    fn scan_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listing = scan_local_images(&dir.path().join("nope"), &[]).expect("scan");
        assert!(listing.files.is_empty());
    }
}
