use reqwest::StatusCode;
use thiserror::Error;

/// Failures surfaced by the catalog engine.
///
/// Per-item variants (`AssetTransfer`, `ImportRowSkipped`) are never returned
/// from an engine operation; they are rendered into logs and aggregated into
/// the operation's counters.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("asset transfer failed for {file}: {reason}")]
    AssetTransfer { file: String, reason: String },

    #[error("database swap failed, previous store kept: {0}")]
    StoreSwapFailed(String),

    #[error("import row {row} skipped: {reason}")]
    ImportRowSkipped { row: usize, reason: String },

    #[error("import rolled back: {0}")]
    ImportTransactionFailed(String),

    #[error("spreadsheet invalid: {0}")]
    SpreadsheetInvalid(String),

    #[error("export failed: {0}")]
    ExportFailed(String),

    #[error("failed to build HTTP client: {0}")]
    ClientSetup(String),

    #[error("store is locked by another writer: {0}")]
    StoreLocked(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Failure of a single file transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned {0}")]
    Status(StatusCode),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            Self::Status(status) => is_transient_status(*status),
            Self::ChecksumMismatch { .. } | Self::Io(_) => false,
        }
    }
}

pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_status_codes_are_retryable() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn checksum_mismatch_is_permanent() {
        let err = TransferError::ChecksumMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(!err.is_transient());
        assert!(TransferError::Status(StatusCode::BAD_GATEWAY).is_transient());
    }
}
