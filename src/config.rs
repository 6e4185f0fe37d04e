//! # SWMR Configuration
//!
//! Configuration surface for a SWMR-coordinated file. The same struct is
//! used on both sides of the protocol: the `writer` flag selects which
//! engine a process runs, and everything else must agree between the
//! writer and its readers (most importantly `page_size`, which is fixed
//! for the lifetime of the file, and `md_file_path`, which names the
//! shadow file both sides meet at).
//!
//! ## Tick Arithmetic
//!
//! `tick_len` is expressed in tenths of a second. It is a soft target:
//! the end-of-tick deadline is recomputed as `now + tick_len` after each
//! EOT, so a slow EOT stretches the tick rather than queueing catch-up
//! work.
//!
//! `max_lag` bounds reader staleness in ticks. It is also the delay
//! assigned to a brand-new page write and the minimum age of a
//! superseded shadow image before its storage may be recycled; the three
//! uses must share one value for the message-from-the-future argument to
//! hold.

use std::path::PathBuf;
use std::time::Duration;

use eyre::{ensure, Result};

use crate::shadow::codec::MD_HEADER_SIZE;

/// Configuration for one SWMR-coordinated file.
#[derive(Debug, Clone)]
pub struct SwmrConfig {
    /// Path of the shadow (metadata) file.
    pub md_file_path: PathBuf,
    /// Page size of the coordinated file, in bytes. Fixed at open; must
    /// be at least the shadow-header size and is the unit of shadow-file
    /// allocation.
    pub page_size: u64,
    /// Soft tick length in tenths of a second.
    pub tick_len: u64,
    /// Bound on reader staleness, in ticks.
    pub max_lag: u64,
    /// Initial shadow-file size, in pages. Page 0 holds the header; the
    /// remaining pages seed the index region.
    pub md_pages_reserved: u64,
    /// True for the (single) writer process, false for readers.
    pub writer: bool,
    /// Whether the writer flushes raw data through the file driver at
    /// each EOT.
    pub flush_raw_data: bool,
}

impl Default for SwmrConfig {
    fn default() -> SwmrConfig {
        SwmrConfig {
            md_file_path: PathBuf::new(),
            page_size: 4096,
            tick_len: 4,
            max_lag: 7,
            md_pages_reserved: 32,
            writer: false,
            flush_raw_data: false,
        }
    }
}

impl SwmrConfig {
    /// Validates the configuration. Called by both open paths; a config
    /// that fails here is rejected before any file is touched.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.md_file_path.as_os_str().is_empty(),
            "md_file_path must not be empty"
        );
        ensure!(self.tick_len > 0, "tick_len must be positive");
        ensure!(self.max_lag > 0, "max_lag must be positive");
        ensure!(
            self.page_size >= MD_HEADER_SIZE as u64,
            "page_size {} is smaller than the shadow header ({} bytes)",
            self.page_size,
            MD_HEADER_SIZE
        );
        ensure!(
            self.page_size <= u64::from(u32::MAX),
            "page_size {} does not fit the on-disk format",
            self.page_size
        );
        ensure!(
            self.md_pages_reserved >= 2,
            "md_pages_reserved must be at least 2 (header page plus index), got {}",
            self.md_pages_reserved
        );
        Ok(())
    }

    /// One tick as a wall-clock duration.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_len * 100)
    }

    /// Total bytes reserved for the shadow file at writer open.
    pub fn md_reserved_bytes(&self) -> u64 {
        self.md_pages_reserved * self.page_size
    }
}
