use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::CodeMatching;

#[derive(Parser, Debug)]
#[command(
    name = "catalog-sync",
    version,
    about = "Product catalog synchronization, image indexing and spreadsheet import"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply a published manifest: swap the store if newer, fetch images, index them.
    Sync(SyncArgs),
    /// Link image files to products, from a manifest's file list or a directory.
    IndexImages(IndexImagesArgs),
    /// Upsert products from a spreadsheet.
    Import(ImportArgs),
    /// Write a compacted copy of the store.
    Export(ExportArgs),
    /// Remove local images the manifest no longer lists.
    Cleanup(CleanupArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, env = "CATALOG_DATA_DIR", default_value = ".cache/catalog")]
    pub data_dir: PathBuf,

    /// Defaults to `<data-dir>/catalog.db`.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Defaults to `<data-dir>/images`.
    #[arg(long)]
    pub images_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = CodeMatching::Prefix)]
    pub code_matching: CodeMatching,
}

#[derive(Args, Debug, Clone)]
pub struct NetworkArgs {
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,
}

#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    /// Print the report as JSON on stdout.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Manifest URL or local file.
    #[arg(long, env = "CATALOG_MANIFEST_URL")]
    pub manifest: String,
}

#[derive(Args, Debug, Clone)]
pub struct IndexImagesArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    #[arg(long, env = "CATALOG_MANIFEST_URL")]
    pub manifest: Option<String>,

    /// Scan this directory instead of a manifest.
    #[arg(long)]
    pub root: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    #[arg(long)]
    pub path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Output file, or an existing directory to write a timestamped copy into.
    #[arg(long)]
    pub dest: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    #[arg(long, env = "CATALOG_MANIFEST_URL")]
    pub manifest: String,

    #[arg(long, default_value_t = 3600)]
    pub min_age_secs: u64,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}
