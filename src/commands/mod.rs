pub mod cleanup;
pub mod export;
pub mod import;
pub mod index_images;
pub mod status;
pub mod sync;

use std::future::Future;
use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::cli::{NetworkArgs, OutputArgs, StoreArgs};
use crate::config::EngineConfig;
use crate::engine::CatalogEngine;
use crate::util::write_json_pretty;

pub(crate) fn engine_config(store: &StoreArgs, network: Option<&NetworkArgs>) -> EngineConfig {
    let mut config = EngineConfig::new(&store.data_dir);
    if let Some(db_path) = &store.db_path {
        config = config.with_db_path(db_path);
    }
    if let Some(images_dir) = &store.images_dir {
        config = config.with_images_dir(images_dir);
    }
    config.code_matching = store.code_matching;

    if let Some(network) = network {
        config.request_timeout = Duration::from_secs(network.timeout_secs);
        config.connect_timeout = Duration::from_secs(network.connect_timeout_secs);
        config.download_workers = network.workers.max(1);
        config.retry.max_attempts = network.max_attempts.max(1);
    }

    config
}

pub(crate) fn build_engine(config: EngineConfig) -> Result<CatalogEngine> {
    info!(
        db_path = %config.db_path.display(),
        images_dir = %config.images_dir.display(),
        "engine configured"
    );
    CatalogEngine::new(config).context("failed to initialize catalog engine")
}

pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

/// Writes the report file if requested and prints JSON on stdout with `--json`.
pub(crate) fn emit_report<T: Serialize>(report: &T, output: &OutputArgs) -> Result<()> {
    if let Some(path) = &output.report_path {
        write_json_pretty(path, report)?;
        info!(path = %path.display(), "report written");
    }

    if output.json {
        let mut out = io::BufWriter::new(io::stdout().lock());
        serde_json::to_writer_pretty(&mut out, report).context("failed to serialize report")?;
        writeln!(out)?;
        out.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::CodeMatching;

    fn store_args() -> StoreArgs {
        StoreArgs {
            data_dir: PathBuf::from("/srv/catalog"),
            db_path: None,
            images_dir: Some(PathBuf::from("/mnt/photos")),
            code_matching: CodeMatching::Exact,
        }
    }

    #[test]
    fn engine_config_applies_overrides() {
        let network = NetworkArgs {
            timeout_secs: 5,
            connect_timeout_secs: 2,
            workers: 0,
            max_attempts: 7,
        };

        let config = engine_config(&store_args(), Some(&network));

        assert_eq!(config.db_path, PathBuf::from("/srv/catalog/catalog.db"));
        assert_eq!(config.images_dir, PathBuf::from("/mnt/photos"));
        assert_eq!(config.code_matching, CodeMatching::Exact);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.download_workers, 1);
        assert_eq!(config.retry.max_attempts, 7);
    }

    #[test]
    fn emit_report_writes_report_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports").join("status.json");
        let output = OutputArgs {
            json: false,
            report_path: Some(path.clone()),
        };

        emit_report(&serde_json::json!({ "ok": true }), &output).expect("emit");

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(written["ok"], true);
    }
}
