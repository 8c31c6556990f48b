//! Bounded-concurrency file transfer with atomic placement.
//!
//! Every transfer streams into a `.partial-*` temporary file next to its
//! destination and is renamed into place only after the body (and checksum,
//! when declared) checks out, so readers never observe a partial file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::future::retry_notify;
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::engine::reconcile::PARTIAL_PREFIX;
use crate::error::{CatalogError, Result, TransferError};
use crate::model::{AssetFailure, ManifestFile};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub errors: usize,
    pub failures: Vec<AssetFailure>,
}

#[derive(Debug)]
struct DownloadJob {
    file: String,
    url: Url,
    dest: PathBuf,
    sha256: Option<String>,
}

#[derive(Debug)]
struct FileOutcome {
    file: String,
    result: std::result::Result<u64, TransferError>,
}

/// Fixed pool of workers pulling from one job queue; each finished file is
/// reported on a result channel and aggregated by the caller.
pub struct Downloader {
    client: Client,
    retry: RetryPolicy,
    workers: usize,
}

impl Downloader {
    pub fn new(client: Client, retry: RetryPolicy, workers: usize) -> Self {
        Self {
            client,
            retry,
            workers: workers.max(1),
        }
    }

    /// Fetches `files` from `base_url` into `target_dir`.
    ///
    /// Individual failures are counted, never raised. The only error is a
    /// `base_url` that cannot be resolved at all.
    pub async fn fetch_all(
        &self,
        files: &[ManifestFile],
        base_url: &str,
        target_dir: &Path,
    ) -> Result<DownloadReport> {
        if files.is_empty() {
            return Ok(DownloadReport::default());
        }

        let base = Url::parse(base_url).map_err(|err| {
            CatalogError::NetworkUnreachable(format!("base_url {base_url}: {err}"))
        })?;
        ensure_resolvable(&base).await?;

        let mut report = DownloadReport::default();
        let (job_tx, job_rx) = mpsc::channel::<DownloadJob>(files.len());

        for entry in files {
            match resolve_file_url(&base, &entry.file) {
                Ok(url) => {
                    let job = DownloadJob {
                        file: entry.file.clone(),
                        url,
                        dest: target_dir.join(&entry.file),
                        sha256: entry.sha256.clone(),
                    };
                    // Capacity equals the job count, so this never waits.
                    if job_tx.send(job).await.is_err() {
                        record_failure(&mut report, &entry.file, "job queue closed".to_string());
                    }
                }
                Err(reason) => record_failure(&mut report, &entry.file, reason),
            }
        }
        drop(job_tx);

        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<FileOutcome>();
        let worker_count = self.workers.min(files.len());
        let mut pool = JoinSet::new();

        for worker in 0..worker_count {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let client = self.client.clone();
            let retry = self.retry;

            pool.spawn(async move {
                loop {
                    let next = { job_rx.lock().await.recv().await };
                    let Some(job) = next else {
                        break;
                    };
                    debug!(worker, file = %job.file, "download started");
                    let result =
                        fetch_to_path(&client, &retry, &job.url, &job.dest, job.sha256.as_deref())
                            .await;
                    if result_tx
                        .send(FileOutcome {
                            file: job.file,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut reported = report.errors;
        while let Some(outcome) = result_rx.recv().await {
            reported += 1;
            match outcome.result {
                Ok(bytes) => {
                    report.downloaded += 1;
                    debug!(file = %outcome.file, bytes, "image downloaded");
                }
                Err(err) => {
                    let failure = CatalogError::AssetTransfer {
                        file: outcome.file.clone(),
                        reason: err.to_string(),
                    };
                    warn!(error = %failure, "image download failed");
                    record_failure(&mut report, &outcome.file, err.to_string());
                }
            }
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "download worker aborted");
            }
        }

        // A worker that died mid-job never reported; those files count as errors.
        if reported < files.len() {
            let lost = files.len() - reported;
            warn!(lost, "download results missing, counting as errors");
            report.errors += lost;
        }

        info!(
            requested = files.len(),
            downloaded = report.downloaded,
            errors = report.errors,
            "image batch finished"
        );
        Ok(report)
    }
}

fn record_failure(report: &mut DownloadReport, file: &str, reason: String) {
    report.errors += 1;
    report.failures.push(AssetFailure {
        file: file.to_string(),
        reason,
    });
}

/// Appends a relative manifest path to `base`, percent-encoding each segment.
pub fn resolve_file_url(base: &Url, file: &str) -> std::result::Result<Url, String> {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|()| format!("base URL cannot hold a path: {base}"))?;
        segments.pop_if_empty();
        segments.extend(file.split('/'));
    }
    Ok(url)
}

async fn ensure_resolvable(base: &Url) -> Result<()> {
    let host = base
        .host_str()
        .ok_or_else(|| CatalogError::NetworkUnreachable(format!("base_url has no host: {base}")))?;
    let port = base.port_or_known_default().unwrap_or(443);

    let mut addresses = tokio::net::lookup_host((host, port)).await.map_err(|err| {
        CatalogError::NetworkUnreachable(format!("cannot resolve {host}: {err}"))
    })?;
    if addresses.next().is_none() {
        return Err(CatalogError::NetworkUnreachable(format!(
            "{host} resolved to no addresses"
        )));
    }
    Ok(())
}

/// Downloads `url` to `dest` with the retry policy applied.
pub async fn fetch_to_path(
    client: &Client,
    retry: &RetryPolicy,
    url: &Url,
    dest: &Path,
    expected_sha256: Option<&str>,
) -> std::result::Result<u64, TransferError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let max_attempts = retry.max_attempts.max(1);
    let attempts = AtomicU32::new(0);
    let attempts = &attempts;

    retry_notify(
        retry.backoff(),
        || async move {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            match fetch_once(client, url, parent, dest, expected_sha256).await {
                Ok(bytes) => Ok(bytes),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    Err(backoff::Error::transient(err))
                }
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        },
        |err: TransferError, wait: Duration| {
            warn!(
                url = %url,
                error = %err,
                retry_after_ms = wait.as_millis() as u64,
                "retry scheduled"
            );
        },
    )
    .await
}

async fn fetch_once(
    client: &Client,
    url: &Url,
    parent: &Path,
    dest: &Path,
    expected_sha256: Option<&str>,
) -> std::result::Result<u64, TransferError> {
    let partial = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .tempfile_in(parent)?;

    let mut response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransferError::Status(status));
    }

    let mut out = tokio::fs::File::from_std(partial.as_file().try_clone()?);
    let mut hasher = Sha256::new();
    let mut bytes = 0_u64;

    while let Some(chunk) = response.chunk().await? {
        hasher.update(&chunk);
        out.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    out.flush().await?;
    out.sync_all().await?;
    drop(out);

    let actual = format!("{:x}", hasher.finalize());
    if let Some(expected) = expected_sha256 {
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(TransferError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }

    partial.persist(dest).map_err(|err| TransferError::Io(err.error))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::engine::test_support::{FixtureServer, sha256_hex};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
        }
    }

    fn entry(file: &str, sha256: Option<String>) -> ManifestFile {
        ManifestFile {
            file: file.to_string(),
            sha256,
        }
    }

    fn no_partials_left(dir: &Path) -> bool {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .all(|entry| !entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX))
    }

    #[test]
    fn resolve_file_url_encodes_segments() {
        let base = Url::parse("https://cdn.example.com/img/").expect("url");
        let url = resolve_file_url(&base, "sub dir/A#1.png").expect("resolved");
        assert_eq!(url.as_str(), "https://cdn.example.com/img/sub%20dir/A%231.png");
    }

    #[tokio::test]
    async fn one_missing_file_does_not_fail_the_batch() {
        let server = FixtureServer::builder()
            .with_file("img/A1.png", b"one".to_vec())
            .with_file("img/A2.png", b"two".to_vec())
            .with_file("img/A3.png", b"three".to_vec())
            .serve()
            .await;
        let dir = tempfile::tempdir().expect("tempdir");

        let files = vec![
            entry("A1.png", None),
            entry("A2.png", None),
            entry("A3.png", None),
            entry("MISSING.png", None),
        ];
        let report = Downloader::new(Client::new(), fast_retry(), 2)
            .fetch_all(&files, &server.url("img/"), dir.path())
            .await
            .expect("batch");

        assert_eq!(report.downloaded, 3);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failures[0].file, "MISSING.png");
        assert_eq!(fs::read(dir.path().join("A3.png")).expect("file"), b"three");
        assert!(!dir.path().join("MISSING.png").exists());
        assert!(no_partials_left(dir.path()));
    }

    #[tokio::test]
    async fn checksum_mismatch_is_counted_and_nothing_is_placed() {
        let server = FixtureServer::builder()
            .with_file("A1.png", b"corrupted".to_vec())
            .serve()
            .await;
        let dir = tempfile::tempdir().expect("tempdir");

        let files = vec![entry("A1.png", Some(sha256_hex(b"expected")))];
        let report = Downloader::new(Client::new(), fast_retry(), 4)
            .fetch_all(&files, &server.url(""), dir.path())
            .await
            .expect("batch");

        assert_eq!(report.downloaded, 0);
        assert_eq!(report.errors, 1);
        assert!(!dir.path().join("A1.png").exists());
        assert!(no_partials_left(dir.path()));
    }

    #[tokio::test]
    async fn transient_status_is_retried() {
        let server = FixtureServer::builder()
            .with_file("A1.png", b"eventually".to_vec())
            .failing_first("A1.png", 2)
            .serve()
            .await;
        let dir = tempfile::tempdir().expect("tempdir");

        let report = Downloader::new(Client::new(), fast_retry(), 1)
            .fetch_all(&[entry("A1.png", None)], &server.url(""), dir.path())
            .await
            .expect("batch");

        assert_eq!(report.downloaded, 1);
        assert_eq!(server.hits("A1.png"), 3);
    }

    #[tokio::test]
    async fn retries_stop_after_attempt_budget() {
        let server = FixtureServer::builder()
            .with_file("A1.png", b"never".to_vec())
            .failing_first("A1.png", 10)
            .serve()
            .await;
        let dir = tempfile::tempdir().expect("tempdir");

        let report = Downloader::new(Client::new(), fast_retry(), 1)
            .fetch_all(&[entry("A1.png", None)], &server.url(""), dir.path())
            .await
            .expect("batch");

        assert_eq!(report.errors, 1);
        assert_eq!(server.hits("A1.png"), 3);
    }

    #[tokio::test]
    async fn timed_out_file_is_counted_and_batch_completes() {
        let server = FixtureServer::builder()
            .with_file("A1.png", b"one".to_vec())
            .with_file("A2.png", b"two".to_vec())
            .with_file("SLOW.png", b"late".to_vec())
            .stalling("SLOW.png", Duration::from_secs(5))
            .serve()
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let client = Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .expect("client");

        let files = vec![
            entry("A1.png", None),
            entry("SLOW.png", None),
            entry("A2.png", None),
        ];
        let report = Downloader::new(client, fast_retry(), 2)
            .fetch_all(&files, &server.url(""), dir.path())
            .await
            .expect("batch");

        assert_eq!(report.downloaded, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failures[0].file, "SLOW.png");
        assert!(dir.path().join("A2.png").is_file());
        assert!(!dir.path().join("SLOW.png").exists());
        assert!(no_partials_left(dir.path()));
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = FixtureServer::builder().serve().await;
        let dir = tempfile::tempdir().expect("tempdir");

        let report = Downloader::new(Client::new(), fast_retry(), 1)
            .fetch_all(&[entry("GONE.png", None)], &server.url(""), dir.path())
            .await
            .expect("batch");

        assert_eq!(report.errors, 1);
        assert_eq!(server.hits("GONE.png"), 1);
    }

    #[tokio::test]
    async fn nested_paths_create_directories() {
        let server = FixtureServer::builder()
            .with_file("a/b/C1.png", b"deep".to_vec())
            .serve()
            .await;
        let dir = tempfile::tempdir().expect("tempdir");

        let report = Downloader::new(Client::new(), fast_retry(), 2)
            .fetch_all(&[entry("a/b/C1.png", None)], &server.url(""), dir.path())
            .await
            .expect("batch");

        assert_eq!(report.downloaded, 1);
        assert_eq!(fs::read(dir.path().join("a/b/C1.png")).expect("file"), b"deep");
    }

    #[tokio::test]
    async fn unresolvable_base_url_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = Downloader::new(Client::new(), fast_retry(), 1)
            .fetch_all(
                &[entry("A1.png", None)],
                "http://host.invalid/",
                dir.path(),
            )
            .await;

        assert!(matches!(result, Err(CatalogError::NetworkUnreachable(_))));
    }
}
