//! Centralized configuration and builder for VellumDB.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - VellumConfig::from_env() reads VL_* variables; fluent with_* setters
//!   override individual fields.
//!
//! Defaults:
//! - page_size = 8192
//! - data_fsync = false (durability relies on the journal)
//! - copy_on_write = true (recovery probes the journal in a private mapping)

use std::fmt;

use crate::consts::DEFAULT_PAGE_SIZE;

/// Top-level configuration (store writer + offline recovery).
#[derive(Clone, Debug)]
pub struct VellumConfig {
    /// Page size in bytes for newly created stores.
    /// Env: VL_PAGE_SIZE (default 8192)
    pub page_size: u32,

    /// Whether to fsync the data file on every page write (besides the
    /// durable journal).
    /// Env: VL_DATA_FSYNC (default false; "1|true|on|yes" => true)
    pub data_fsync: bool,

    /// Swallow structural journal errors instead of failing.
    /// Env: VL_IGNORE_INVALID_JOURNAL = 0|1 (default 0)
    pub ignore_invalid_journal: bool,

    // ---------- recovery ----------
    /// Probe the journal through a copy-on-write mapping during recovery
    /// (never mutates the original data file).
    /// Env: VL_RECOVERY_COW = 0|1 (default 1)
    pub copy_on_write: bool,

    /// Progress log interval in seconds for long scans.
    /// Env: VL_PROGRESS_INTERVAL_SECS (default 10)
    pub progress_interval_secs: u64,

    /// Drop orphaned revisions/counters instead of preserving them.
    /// Env: VL_DISCARD_ORPHANS = 0|1 (default 0)
    pub discard_orphans: bool,
}

impl Default for VellumConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            data_fsync: false,
            ignore_invalid_journal: false,
            copy_on_write: true,
            progress_interval_secs: 10,
            discard_orphans: false,
        }
    }
}

#[inline]
fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "on" || s == "yes"
    })
}

impl VellumConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("VL_PAGE_SIZE") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.page_size = n;
            }
        }
        if let Some(b) = env_flag("VL_DATA_FSYNC") {
            cfg.data_fsync = b;
        }
        if let Some(b) = env_flag("VL_IGNORE_INVALID_JOURNAL") {
            cfg.ignore_invalid_journal = b;
        }
        if let Some(b) = env_flag("VL_RECOVERY_COW") {
            cfg.copy_on_write = b;
        }
        if let Ok(v) = std::env::var("VL_PROGRESS_INTERVAL_SECS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.progress_interval_secs = n;
            }
        }
        if let Some(b) = env_flag("VL_DISCARD_ORPHANS") {
            cfg.discard_orphans = b;
        }

        cfg
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_page_size(mut self, ps: u32) -> Self {
        self.page_size = ps;
        self
    }

    pub fn with_data_fsync(mut self, on: bool) -> Self {
        self.data_fsync = on;
        self
    }

    pub fn with_ignore_invalid_journal(mut self, on: bool) -> Self {
        self.ignore_invalid_journal = on;
        self
    }

    pub fn with_copy_on_write(mut self, on: bool) -> Self {
        self.copy_on_write = on;
        self
    }

    pub fn with_progress_interval_secs(mut self, secs: u64) -> Self {
        self.progress_interval_secs = secs;
        self
    }

    pub fn with_discard_orphans(mut self, on: bool) -> Self {
        self.discard_orphans = on;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> Self {
        self
    }
}

impl fmt::Display for VellumConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VellumConfig {{ page_size: {}, data_fsync: {}, ignore_invalid_journal: {}, \
             copy_on_write: {}, progress_interval_secs: {}, discard_orphans: {} }}",
            self.page_size,
            self.data_fsync,
            self.ignore_invalid_journal,
            self.copy_on_write,
            self.progress_interval_secs,
            self.discard_orphans
        )
    }
}
