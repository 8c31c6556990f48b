//! Links image files to products by deriving product codes from file names.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::CodeMatching;
use crate::engine::reconcile::PARTIAL_PREFIX;
use crate::error::Result;
use crate::model::ImageIndexReport;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];

const CODE_SEPARATORS: &[char] = &['_', '-', ' '];

/// Strategy turning a file stem into product codes to try, best first.
pub trait CodeMatcher: Send + Sync {
    fn candidates(&self, stem: &str) -> Vec<String>;
}

/// `ABC123-2` tries `ABC123-2` then `ABC123`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrefixCodeMatcher;

impl CodeMatcher for PrefixCodeMatcher {
    fn candidates(&self, stem: &str) -> Vec<String> {
        let upper = stem.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return Vec::new();
        }

        let mut candidates = vec![upper.clone()];
        for (position, _) in upper.rmatch_indices(CODE_SEPARATORS) {
            let prefix = upper[..position].trim_end();
            if !prefix.is_empty() && !candidates.iter().any(|seen| seen == prefix) {
                candidates.push(prefix.to_string());
            }
        }
        candidates
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExactStemMatcher;

impl CodeMatcher for ExactStemMatcher {
    fn candidates(&self, stem: &str) -> Vec<String> {
        let upper = stem.trim().to_ascii_uppercase();
        if upper.is_empty() {
            Vec::new()
        } else {
            vec![upper]
        }
    }
}

pub fn matcher_for(mode: CodeMatching) -> Box<dyn CodeMatcher> {
    match mode {
        CodeMatching::Prefix => Box::new(PrefixCodeMatcher),
        CodeMatching::Exact => Box::new(ExactStemMatcher),
    }
}

pub struct ImageIndexer<'a> {
    matcher: &'a dyn CodeMatcher,
}

impl<'a> ImageIndexer<'a> {
    pub fn new(matcher: &'a dyn CodeMatcher) -> Self {
        Self { matcher }
    }

    /// Records an `images` row for every file whose name resolves to a
    /// product. Existing pairs are left alone, so re-running is a no-op.
    pub fn index(&self, connection: &mut Connection, files: &[String]) -> Result<ImageIndexReport> {
        let mut report = ImageIndexReport::default();
        let tx = connection.transaction()?;

        {
            let mut lookup =
                tx.prepare("SELECT id FROM products WHERE UPPER(code) = ?1 ORDER BY id LIMIT 1")?;
            let mut insert =
                tx.prepare("INSERT OR IGNORE INTO images(product_id, file) VALUES(?1, ?2)")?;

            for file in files {
                report.scanned += 1;

                let mut product_id = None;
                for candidate in self.matcher.candidates(file_stem(file)) {
                    product_id = lookup
                        .query_row([&candidate], |row| row.get::<_, i64>(0))
                        .optional()?;
                    if product_id.is_some() {
                        break;
                    }
                }

                let Some(product_id) = product_id else {
                    debug!(file = %file, "image matches no product");
                    continue;
                };

                report.matched += 1;
                if insert.execute(params![product_id, file])? == 1 {
                    report.inserted += 1;
                }
            }
        }

        tx.commit()?;
        info!(
            scanned = report.scanned,
            matched = report.matched,
            inserted = report.inserted,
            "image index updated"
        );
        Ok(report)
    }
}

/// File name without directories and without its final extension.
pub fn file_stem(file: &str) -> &str {
    let name = file.rsplit('/').next().unwrap_or(file);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(dot) => &name[..dot],
    }
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Image files under `root` as `/`-separated paths relative to it.
pub fn collect_image_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry during image scan");
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_image_extension(entry.path()) {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(relative);
    }
    files
}
