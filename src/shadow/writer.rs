//! # Writer End-of-Tick Engine
//!
//! The writer side of the SWMR protocol. Once per tick the writer
//! collects the pages dirtied since the last publication, writes their
//! images into freshly allocated shadow storage, and publishes a new
//! index and header - in that order, so a reader can always pair a
//! header with the index it advertises.
//!
//! ## The Nine Steps
//!
//! Each EOT performs, strictly in order:
//!
//! 1. Flush raw data (if configured) and release file-space aggregators
//! 2. Flush the metadata cache into the page buffer, if one is attached
//! 3. Truncate the primary file driver to its logical size
//! 4. On the first tick, create the in-memory index
//! 5. Reconcile the page buffer's tick list against the index
//! 6. Update the shadow file (images, then index, then header; then
//!    the deferred-reclamation walk)
//! 7. Release the tick list
//! 8. Release delayed writes whose deadline has passed
//! 9. Advance the tick and re-arm the scheduler entry
//!
//! Nothing here may be reordered. Step 6 in particular must precede
//! step 7: the tick list owns the page images until they are written
//! out.
//!
//! ## Flush and Close
//!
//! Flushing the primary file requires the delayed-write list to drain
//! first: [`SwmrWriter::prep_for_flush_or_close`] forces one EOT to
//! clear the tick list, then sleeps a tick and runs another EOT until
//! no delayed writes remain. After that, [`SwmrWriter::flush`]
//! publishes an empty index (readers fall through to the primary file
//! for everything) and starts a new tick; [`SwmrWriter::close`] does
//! the same and then unlinks the shadow file and tears down the
//! per-file state.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, trace};

use crate::config::SwmrConfig;
use crate::scheduler::{EotEntry, EotScheduler, FileToken};
use crate::shadow::alloc::{ShadowAllocator, ShadowFreeSpace};
use crate::shadow::codec::{self, MdHeader};
use crate::shadow::defree::DeferredFrees;
use crate::shadow::delay;
use crate::shadow::file::ShadowFile;
use crate::shadow::index::ShadowIndex;
use crate::traits::{FileDriver, MetadataCache, PageBuffer};
use zerocopy::IntoBytes;

/// The writer half of one SWMR-coordinated file.
pub struct SwmrWriter {
    config: SwmrConfig,
    shadow: ShadowFile,
    fs: Box<dyn ShadowAllocator>,
    index: ShadowIndex,
    /// Byte offset of the on-disk index region.
    index_offset: u64,
    /// Entry capacity the on-disk region was sized for.
    region_capacity: u32,
    defrees: DeferredFrees,
    tick: u64,
    end_of_tick: Instant,
    page_buffer: Box<dyn PageBuffer>,
    cache: Option<Box<dyn MetadataCache>>,
    driver: Box<dyn FileDriver>,
    scheduler: Arc<EotScheduler>,
    token: FileToken,
}

impl SwmrWriter {
    /// Opens the writer side: creates the shadow file with its
    /// deterministic layout (header at page 0, index region at page 1)
    /// and schedules the first EOT. When the primary file already
    /// exists (`creating_primary` is false), an empty index and header
    /// are published immediately so readers can attach; for a brand-new
    /// primary file the first publication waits for the first EOT.
    pub fn create(
        config: SwmrConfig,
        mut page_buffer: Box<dyn PageBuffer>,
        cache: Option<Box<dyn MetadataCache>>,
        driver: Box<dyn FileDriver>,
        scheduler: Arc<EotScheduler>,
        creating_primary: bool,
    ) -> Result<SwmrWriter> {
        config.validate()?;
        ensure!(config.writer, "writer open requires a writer config");

        page_buffer.set_tick(1)?;

        let shadow = ShadowFile::create(&config.md_file_path)?;
        let mut fs = ShadowFreeSpace::new(config.page_size)?;
        let md_size = config.md_reserved_bytes();

        let hdr_addr = fs
            .alloc(config.page_size)
            .wrap_err("failed to allocate the shadow-file header page")?;
        ensure!(
            hdr_addr == 0,
            "shadow-file header allocated at {}, expected 0",
            hdr_addr
        );

        let idx_addr = fs
            .alloc(md_size - config.page_size)
            .wrap_err("failed to allocate the shadow-file index region")?;
        ensure!(
            idx_addr == config.page_size,
            "shadow-file index region allocated at {}, expected {}",
            idx_addr,
            config.page_size
        );

        shadow.set_len(md_size)?;

        let region_capacity =
            ShadowIndex::initial_capacity(config.page_size, config.md_pages_reserved)?;

        let mut writer = SwmrWriter {
            end_of_tick: Instant::now() + config.tick_duration(),
            config,
            shadow,
            fs: Box::new(fs),
            index: ShadowIndex::new(),
            index_offset: idx_addr,
            region_capacity,
            defrees: DeferredFrees::new(),
            tick: 1,
            page_buffer,
            cache,
            driver,
            scheduler,
            token: FileToken::next(),
        };

        if !creating_primary {
            writer.write_index_and_header(true)?;
        }

        writer.scheduler.insert(writer.entry());
        debug!(tick = writer.tick, "SWMR writer open");
        Ok(writer)
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

    pub fn deferred_frees(&self) -> &DeferredFrees {
        &self.defrees
    }

    /// The delayed-write oracle for this file at its current tick.
    pub fn delay_write(&self, page: u64) -> Result<u64> {
        delay::delay_write(&self.index, self.tick, self.config.max_lag, page)
    }

    /// Runs one end of tick. See the module docs for the step list.
    pub fn end_of_tick(&mut self) -> Result<()> {
        trace!(tick = self.tick, "writer EOT entering");

        // 1) Raw data and file-space aggregators.
        if self.config.flush_raw_data {
            self.driver.flush_raw_data()?;
        }
        self.driver.release_aggregators()?;

        // 2) Metadata cache into the page buffer.
        if let Some(cache) = self.cache.as_mut() {
            cache.flush()?;
        }

        // 3) Primary file down to its logical size.
        self.driver.truncate(false)?;

        // 4) First tick: create the in-memory index.
        if self.tick == 1 && self.index.capacity() == 0 {
            self.index = ShadowIndex::with_capacity(self.region_capacity)?;
        }

        // 5) Merge the tick list into the index.
        let stats = self.page_buffer.update_index(&mut self.index)?;
        trace!(
            added = stats.added,
            modified = stats.modified,
            not_in_tick_list = stats.not_in_tick_list,
            "tick list reconciled"
        );

        // 6) Publish to the shadow file.
        self.update_shadow_file()?;

        self.index.verify_sorted()?;
        for entry in self.index.entries() {
            ensure!(
                entry.image.is_none(),
                "page {} still holds an unflushed image after publication",
                entry.page
            );
        }

        // 7) The images are durable; the tick list can go.
        self.page_buffer.release_tick_list()?;

        // 8) Delayed writes whose deadline has passed.
        self.page_buffer.release_delayed_writes(self.tick)?;

        // 9) Next tick.
        self.advance_tick()?;

        trace!(
            tick = self.tick,
            index_used = self.index.used(),
            "writer EOT exiting"
        );
        Ok(())
    }

    /// The shadow-file update sub-protocol: flush every pending image,
    /// then write the index block, then the header, then run the
    /// deferred-reclamation walk.
    fn update_shadow_file(&mut self) -> Result<()> {
        self.index.verify_sorted()?;

        // An index that outgrew its on-disk region moves to a larger
        // one; the old region joins the reclamation queue so lagging
        // readers can finish with it.
        if let Some(old_capacity) = self.index.take_pending_growth() {
            let new_offset = self.fs.alloc(codec::index_size(self.index.capacity()))?;
            self.defrees
                .defer(self.index_offset, codec::index_size(old_capacity), self.tick);
            debug!(
                old_capacity,
                new_capacity = self.index.capacity(),
                old_offset = self.index_offset,
                new_offset,
                "shadow index region enlarged"
            );
            self.index_offset = new_offset;
            self.region_capacity = self.index.capacity();
        }

        let page_size = self.config.page_size;
        let tick = self.tick;
        for entry in self.index.entries_mut() {
            let Some(image) = entry.image.take() else {
                continue;
            };

            // The superseded image, if any, stays readable for max_lag
            // ticks before its storage is recycled.
            if entry.shadow_page != 0 {
                self.defrees
                    .defer(entry.shadow_page * page_size, u64::from(entry.length), tick);
            }

            let length = u32::try_from(image.len())
                .map_err(|_| eyre::eyre!("page {} image of {} bytes is too large", entry.page, image.len()))?;
            let addr = self.fs.alloc(u64::from(length))?;
            ensure!(
                addr % page_size == 0,
                "shadow allocation at {} is not page-aligned",
                addr
            );

            entry.shadow_page = addr / page_size;
            entry.length = length;
            entry.checksum = codec::checksum(&image);
            self.shadow
                .write_at(addr, &image)
                .wrap_err_with(|| format!("failed to write page {} image", entry.page))?;
        }

        self.write_index_and_header(false)?;

        self.defrees
            .reclaim(self.tick, self.config.max_lag, self.fs.as_mut())?;
        Ok(())
    }

    /// Encodes and writes the index block, then the header - the
    /// publication order every reader depends on. With `empty` set the
    /// published index has no entries regardless of in-memory state
    /// (flush and close use this).
    fn write_index_and_header(&mut self, empty: bool) -> Result<()> {
        let block = if empty {
            codec::encode_index(self.tick, &[])?
        } else {
            codec::encode_index(self.tick, self.index.entries())?
        };
        self.shadow
            .write_at(self.index_offset, &block)
            .wrap_err("failed to write index block to shadow file")?;

        let header = MdHeader::new(
            self.config.page_size as u32,
            self.tick,
            self.index_offset,
            block.len() as u64,
        );
        self.shadow
            .write_at(0, header.as_bytes())
            .wrap_err("failed to write header to shadow file")?;
        Ok(())
    }

    fn advance_tick(&mut self) -> Result<()> {
        self.tick += 1;
        self.page_buffer.set_tick(self.tick)?;
        self.end_of_tick = Instant::now() + self.config.tick_duration();
        self.scheduler.remove(self.token);
        self.scheduler.insert(self.entry());
        Ok(())
    }

    fn entry(&self) -> EotEntry {
        EotEntry {
            token: self.token,
            writer: true,
            tick: self.tick,
            deadline: self.end_of_tick,
        }
    }

    /// Drains the page buffer ahead of a flush or close: one EOT to
    /// clear the tick list, then wait-a-tick cycles until no delayed
    /// writes remain.
    pub fn prep_for_flush_or_close(&mut self) -> Result<()> {
        self.end_of_tick()?;
        while self.page_buffer.delayed_write_count() > 0 {
            self.wait_a_tick()?;
        }
        Ok(())
    }

    fn wait_a_tick(&mut self) -> Result<()> {
        thread::sleep(self.config.tick_duration());
        self.end_of_tick()
    }

    /// Publishes an empty index and header (readers resolve everything
    /// against the primary file) and starts a new tick. Callers run
    /// [`prep_for_flush_or_close`](Self::prep_for_flush_or_close)
    /// first.
    pub fn flush(&mut self) -> Result<()> {
        self.write_index_and_header(true)?;
        self.advance_tick()
    }

    /// Closes the writer: publishes an empty index and header, then
    /// removes the file from the scheduler, unlinks the shadow file,
    /// and tears down the free-space manager and reclamation queue.
    /// Callers run [`prep_for_flush_or_close`](Self::prep_for_flush_or_close)
    /// first.
    pub fn close(mut self) -> Result<()> {
        self.write_index_and_header(true)?;
        self.tick += 1;

        self.scheduler.remove(self.token);
        self.shadow.unlink()?;
        self.fs.close()?;
        self.defrees.drain();
        debug!(tick = self.tick, "SWMR writer closed");
        Ok(())
    }

    /// Logs a summary of the in-memory index.
    pub fn dump_index(&self) {
        debug!(
            used = self.index.used(),
            capacity = self.index.capacity(),
            "shadow index dump"
        );
        for (i, entry) in self.index.entries().iter().enumerate() {
            debug!(
                i,
                page = entry.page,
                shadow_page = entry.shadow_page,
                length = entry.length,
                "index entry"
            );
        }
    }
}
