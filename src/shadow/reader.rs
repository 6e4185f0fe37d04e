//! # Reader End-of-Tick Engine
//!
//! The reader side of the SWMR protocol. Each tick the reader polls the
//! shadow-file header; if the advertised tick has moved it loads the
//! new index, diffs it against the one it was using, and brings its
//! caches back in line before adopting the new tick.
//!
//! ## Torn Reads
//!
//! The reader validates three things on every load: the header
//! checksum, the index checksum, and that both blocks carry the same
//! tick. The writer publishes index-then-header, so a mismatch means
//! the read raced a publication. That is never an error - the reader
//! keeps its current view and tries again next tick, and the writer
//! guarantees a consistent pair is observable again by then.
//!
//! ## Eviction Order
//!
//! Pages whose shadow location changed (or that left the index) are
//! evicted from the page buffer *first* and only then handed to the
//! metadata cache's evict-or-refresh. The metadata cache may re-read
//! through the page buffer while refreshing; flipping the order would
//! let a refresh see the superseded image.

use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::SwmrConfig;
use crate::scheduler::{EotEntry, EotScheduler, FileToken};
use crate::shadow::codec::{self, MdHeader, MD_HEADER_SIZE, MD_INDEX_BASE_SIZE};
use crate::shadow::file::ShadowFile;
use crate::shadow::index::ShadowIndex;
use crate::traits::{MetadataCache, PageBuffer};

/// Attempts to load a consistent header/index pair at open before
/// giving up. The writer publishes both blocks within one tick, so a
/// handful of short sleeps is plenty.
const OPEN_RETRIES: u32 = 10;

/// The reader half of one SWMR-coordinated file.
pub struct SwmrReader {
    config: SwmrConfig,
    shadow: ShadowFile,
    index: ShadowIndex,
    old_index: ShadowIndex,
    tick: u64,
    end_of_tick: Instant,
    page_buffer: Box<dyn PageBuffer>,
    cache: Box<dyn MetadataCache>,
    scheduler: Arc<EotScheduler>,
    token: FileToken,
}

impl SwmrReader {
    /// Opens the reader side: attaches to the shadow file, loads the
    /// current tick and index (retrying torn reads a bounded number of
    /// times), and schedules the first EOT.
    pub fn open(
        config: SwmrConfig,
        page_buffer: Box<dyn PageBuffer>,
        cache: Box<dyn MetadataCache>,
        scheduler: Arc<EotScheduler>,
    ) -> Result<SwmrReader> {
        config.validate()?;
        ensure!(!config.writer, "reader open requires a reader config");

        let shadow = ShadowFile::open_readonly(&config.md_file_path)?;
        let capacity = ShadowIndex::initial_capacity(config.page_size, config.md_pages_reserved)?;

        let mut reader = SwmrReader {
            end_of_tick: Instant::now() + config.tick_duration(),
            config,
            shadow,
            index: ShadowIndex::with_capacity(capacity)?,
            old_index: ShadowIndex::new(),
            tick: 0,
            page_buffer,
            cache,
            scheduler,
            token: FileToken::next(),
        };

        reader.initial_load()?;
        reader.scheduler.insert(reader.entry());
        debug!(tick = reader.tick, "SWMR reader open");
        Ok(reader)
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn end_of_tick_deadline(&self) -> Instant {
        self.end_of_tick
    }

    pub fn token(&self) -> FileToken {
        self.token
    }

    pub fn index(&self) -> &ShadowIndex {
        &self.index
    }

    fn initial_load(&mut self) -> Result<()> {
        let pause = self.config.tick_duration() / 10;
        for _ in 0..OPEN_RETRIES {
            if let Some(header) = self.read_header()? {
                if self.load_index(&header)? {
                    self.tick = header.tick();
                    return Ok(());
                }
            }
            thread::sleep(pause);
        }
        bail!(
            "unable to load a consistent shadow-file index from {:?} after {} attempts",
            self.shadow.path(),
            OPEN_RETRIES
        );
    }

    /// Reads and validates the header. `None` means the header is torn
    /// or not yet written - retry later; only real I/O failures error.
    fn read_header(&self) -> Result<Option<MdHeader>> {
        let mut buf = [0u8; MD_HEADER_SIZE];
        if !self.shadow.read_at_opt(0, &mut buf)? {
            return Ok(None);
        }
        match MdHeader::from_bytes(&buf) {
            Ok(header) => {
                ensure!(
                    u64::from(header.page_size()) == self.config.page_size,
                    "shadow file advertises page size {}, config says {}",
                    header.page_size(),
                    self.config.page_size
                );
                Ok(Some(header))
            }
            Err(e) => {
                trace!("torn shadow header: {e}");
                Ok(None)
            }
        }
    }

    /// Loads the index block the header points at into `self.index`.
    /// Returns false on any torn-read signature: short file, checksum
    /// failure, or a tick that does not match the header's.
    fn load_index(&mut self, header: &MdHeader) -> Result<bool> {
        let length = header.index_length();
        if length < MD_INDEX_BASE_SIZE as u64 {
            trace!(length, "implausible index length; treating as torn");
            return Ok(false);
        }

        let mut buf = vec![0u8; length as usize];
        if !self.shadow.read_at_opt(header.index_offset(), &mut buf)? {
            return Ok(false);
        }

        let (tick, entries) = match codec::decode_index(&buf) {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!("torn shadow index: {e}");
                return Ok(false);
            }
        };

        if tick != header.tick() {
            trace!(
                header_tick = header.tick(),
                index_tick = tick,
                "twin-tick mismatch"
            );
            return Ok(false);
        }

        self.index.replace_entries(entries)?;
        Ok(true)
    }

    /// Runs one reader end of tick: poll, load, diff, evict, adopt.
    pub fn end_of_tick(&mut self) -> Result<()> {
        trace!(tick = self.tick, "reader EOT entering");

        let Some(header) = self.read_header()? else {
            self.rearm();
            return Ok(());
        };
        if header.tick() == self.tick {
            self.rearm();
            return Ok(());
        }

        // Keep the current view in the old slot while the new one loads.
        mem::swap(&mut self.index, &mut self.old_index);
        if self.index.capacity() == 0 {
            let capacity =
                ShadowIndex::initial_capacity(self.config.page_size, self.config.md_pages_reserved)?;
            self.index = ShadowIndex::with_capacity(capacity)?;
        }

        if !self.load_index(&header)? {
            mem::swap(&mut self.index, &mut self.old_index);
            debug!(
                header_tick = header.tick(),
                "torn shadow-file read; retrying next tick"
            );
            self.rearm();
            return Ok(());
        }

        // Diff old against new; both are strictly sorted by page.
        let mut evict: SmallVec<[u64; 16]> = SmallVec::new();
        let mut added = 0u32;
        let mut removed = 0u32;
        let mut changed = 0u32;
        {
            let old = self.old_index.entries();
            let new = self.index.entries();
            let mut i = 0;
            let mut j = 0;
            while i < old.len() && j < new.len() {
                match old[i].page.cmp(&new[j].page) {
                    std::cmp::Ordering::Equal => {
                        if old[i].shadow_page != new[j].shadow_page {
                            evict.push(new[j].page);
                            changed += 1;
                        }
                        i += 1;
                        j += 1;
                    }
                    std::cmp::Ordering::Less => {
                        evict.push(old[i].page);
                        removed += 1;
                        i += 1;
                    }
                    std::cmp::Ordering::Greater => {
                        added += 1;
                        j += 1;
                    }
                }
            }
            for entry in &old[i..] {
                evict.push(entry.page);
                removed += 1;
            }
            added += (new.len() - j) as u32;
        }

        // Page buffer first, metadata cache second; see module docs.
        for &page in &evict {
            self.page_buffer
                .remove_entry(page * self.config.page_size)?;
        }
        for &page in &evict {
            self.cache
                .evict_or_refresh_all_entries_in_page(page, header.tick())?;
        }

        debug!(
            from = self.tick,
            to = header.tick(),
            added,
            removed,
            changed,
            "reader adopted new index"
        );
        self.tick = header.tick();
        self.end_of_tick = Instant::now() + self.config.tick_duration();
        self.rearm();
        Ok(())
    }

    /// Removes this file from the scheduler on reader close.
    pub fn close(self) -> Result<()> {
        self.scheduler.remove(self.token);
        debug!(tick = self.tick, "SWMR reader closed");
        Ok(())
    }

    fn rearm(&mut self) {
        self.scheduler.remove(self.token);
        self.scheduler.insert(self.entry());
    }

    fn entry(&self) -> EotEntry {
        EotEntry {
            token: self.token,
            writer: false,
            tick: self.tick,
            deadline: self.end_of_tick,
        }
    }
}
