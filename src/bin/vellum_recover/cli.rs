use clap::Parser;
use std::path::PathBuf;

/// Offline crash recovery for VellumDB stores.
#[derive(Parser, Debug)]
#[command(name = "vellum_recover", version, about = "VellumDB offline recovery")]
pub struct Cli {
    /// Store directory (meta + data.vldb + journal)
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Output directory for the reconstructed store (must be empty)
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Page size override, used only when meta is unreadable
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Progress report interval in seconds
    /// (default 10, or VL_PROGRESS_INTERVAL_SECS)
    #[arg(long)]
    pub progress_interval: Option<u64>,

    /// Master key as 64 hex chars (encrypted stores)
    #[arg(long, conflicts_with = "master_key_file")]
    pub master_key_hex: Option<String>,

    /// File with 32 raw key bytes (encrypted stores)
    #[arg(long)]
    pub master_key_file: Option<PathBuf>,

    /// Swallow structural journal errors instead of failing the probe
    #[arg(long, default_value_t = false)]
    pub ignore_invalid_journal: bool,

    /// Replay the journal directly into the data file (MUTATES the
    /// original). Required when the copy-on-write mapping cannot be
    /// allocated.
    #[arg(long, default_value_t = false)]
    pub disable_copy_on_write: bool,

    /// Drop orphaned revisions/counters/attachments instead of preserving
    /// them under orphans.jsonl
    #[arg(long, default_value_t = false)]
    pub discard_orphans: bool,
}
