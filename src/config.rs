use std::path::{Path, PathBuf};
use std::time::Duration;

use backoff::ExponentialBackoff;
use clap::ValueEnum;

use crate::store::{DB_FILE_NAME, IMAGES_DIR_NAME};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DOWNLOAD_WORKERS: usize = 4;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CLEANUP_MIN_AGE: Duration = Duration::from_secs(60 * 60);

/// How image file names are turned into product code candidates.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum CodeMatching {
    /// Code at the start of the stem, optionally followed by a separator and a suffix.
    #[default]
    Prefix,
    /// Whole stem must equal the code.
    Exact,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per file, first try included.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

impl RetryPolicy {
    /// The attempt budget is enforced by the caller, so the schedule itself never expires.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Everything an engine call needs to know about its surroundings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub images_dir: PathBuf,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub download_workers: usize,
    pub retry: RetryPolicy,
    pub code_matching: CodeMatching,
    pub cleanup_min_age: Duration,
}

impl EngineConfig {
    /// Store and images default to fixed names under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            db_path: data_dir.join(DB_FILE_NAME),
            images_dir: data_dir.join(IMAGES_DIR_NAME),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            download_workers: DEFAULT_DOWNLOAD_WORKERS,
            retry: RetryPolicy::default(),
            code_matching: CodeMatching::default(),
            cleanup_min_age: DEFAULT_CLEANUP_MIN_AGE,
        }
    }

    pub fn with_db_path(mut self, db_path: &Path) -> Self {
        self.db_path = db_path.to_path_buf();
        self
    }

    pub fn with_images_dir(mut self, images_dir: &Path) -> Self {
        self.images_dir = images_dir.to_path_buf();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_config_places_store_and_images_under_data_dir() {
        let config = EngineConfig::new("/tmp/catalog");
        assert_eq!(config.db_path, PathBuf::from("/tmp/catalog/catalog.db"));
        assert_eq!(config.images_dir, PathBuf::from("/tmp/catalog/images"));
        assert_eq!(config.download_workers, 4);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn backoff_schedule_does_not_expire_on_its_own() {
        let backoff = RetryPolicy::default().backoff();
        assert!(backoff.max_elapsed_time.is_none());
        assert_eq!(backoff.initial_interval, Duration::from_millis(200));
    }
}
