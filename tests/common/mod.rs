//! Shared fixtures for the SWMR scenario tests: recording fakes for
//! the page buffer, metadata cache, and primary file driver, plus
//! helpers to open a writer against a temp directory and to read the
//! shadow file back through the codec.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use shadowtick::codec::{self, MdHeader, MD_HEADER_SIZE};
use shadowtick::shadow::ShadowFile;
use shadowtick::{
    EotScheduler, FileDriver, IndexEntry, MetadataCache, PageBuffer, ShadowIndex, SwmrConfig,
    SwmrWriter, TickListStats,
};

/// Everything the engines did to their collaborators, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SetTick(u64),
    RemoveEntry(u64),
    ReleaseTickList,
    ReleaseDelayedWrites(u64),
    CacheFlush,
    EvictOrRefresh { page: u64, tick: u64 },
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

#[derive(Default)]
pub struct PbState {
    /// Pages dirtied since the last EOT: `(page, image)`.
    pub dirtied: Vec<(u64, Vec<u8>)>,
    /// Deadline ticks of pending delayed writes.
    pub delayed_deadlines: Vec<u64>,
    pub tick: u64,
}

/// A page buffer whose tick list is scripted by the test.
#[derive(Clone)]
pub struct FakePageBuffer {
    pub state: Arc<Mutex<PbState>>,
    pub log: EventLog,
}

impl FakePageBuffer {
    pub fn new(log: EventLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(PbState::default())),
            log,
        }
    }

    /// Marks a page dirty for the next tick.
    pub fn dirty(&self, page: u64, image: &[u8]) {
        self.state.lock().dirtied.push((page, image.to_vec()));
    }

    /// Parks delayed writes due at the given ticks.
    pub fn set_delayed_deadlines(&self, deadlines: &[u64]) {
        self.state.lock().delayed_deadlines = deadlines.to_vec();
    }

    /// Delayed writes still pending.
    pub fn delayed_count(&self) -> usize {
        self.state.lock().delayed_deadlines.len()
    }
}

impl PageBuffer for FakePageBuffer {
    fn set_tick(&mut self, tick: u64) -> Result<()> {
        self.state.lock().tick = tick;
        self.log.lock().push(Event::SetTick(tick));
        Ok(())
    }

    fn update_index(&mut self, index: &mut ShadowIndex) -> Result<TickListStats> {
        let dirtied = std::mem::take(&mut self.state.lock().dirtied);
        let mut stats = TickListStats::default();
        for (page, image) in dirtied {
            let image: Arc<[u8]> = image.into();
            match index.lookup_mut(page) {
                Some(entry) => {
                    entry.image = Some(image);
                    stats.modified += 1;
                }
                None => {
                    index.insert(IndexEntry::new(page, image)?)?;
                    stats.added += 1;
                }
            }
        }
        stats.not_in_tick_list = index.used() - stats.added - stats.modified;
        stats.not_in_tick_list_flushed = stats.not_in_tick_list;
        Ok(stats)
    }

    fn release_tick_list(&mut self) -> Result<()> {
        self.log.lock().push(Event::ReleaseTickList);
        Ok(())
    }

    fn release_delayed_writes(&mut self, tick: u64) -> Result<()> {
        self.state.lock().delayed_deadlines.retain(|&d| d > tick);
        self.log.lock().push(Event::ReleaseDelayedWrites(tick));
        Ok(())
    }

    fn remove_entry(&mut self, addr: u64) -> Result<()> {
        self.log.lock().push(Event::RemoveEntry(addr));
        Ok(())
    }

    fn delayed_write_count(&self) -> usize {
        self.state.lock().delayed_deadlines.len()
    }
}

#[derive(Clone)]
pub struct FakeMetadataCache {
    pub log: EventLog,
}

impl MetadataCache for FakeMetadataCache {
    fn flush(&mut self) -> Result<()> {
        self.log.lock().push(Event::CacheFlush);
        Ok(())
    }

    fn evict_or_refresh_all_entries_in_page(&mut self, page: u64, tick: u64) -> Result<()> {
        self.log.lock().push(Event::EvictOrRefresh { page, tick });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DriverState {
    pub raw_flushes: u32,
    pub aggregator_releases: u32,
    pub truncates: u32,
}

#[derive(Clone, Default)]
pub struct FakeFileDriver {
    pub state: Arc<Mutex<DriverState>>,
}

impl FileDriver for FakeFileDriver {
    fn flush_raw_data(&mut self) -> Result<()> {
        self.state.lock().raw_flushes += 1;
        Ok(())
    }

    fn release_aggregators(&mut self) -> Result<()> {
        self.state.lock().aggregator_releases += 1;
        Ok(())
    }

    fn truncate(&mut self, _closing: bool) -> Result<()> {
        self.state.lock().truncates += 1;
        Ok(())
    }
}

pub fn writer_config(dir: &Path) -> SwmrConfig {
    SwmrConfig {
        md_file_path: dir.join("shadow.md"),
        page_size: 4096,
        tick_len: 1,
        max_lag: 3,
        md_pages_reserved: 2,
        writer: true,
        flush_raw_data: false,
    }
}

pub fn reader_config(md_file_path: PathBuf) -> SwmrConfig {
    SwmrConfig {
        md_file_path,
        page_size: 4096,
        tick_len: 1,
        max_lag: 3,
        md_pages_reserved: 2,
        writer: false,
        flush_raw_data: false,
    }
}

pub struct WriterFixture {
    pub writer: SwmrWriter,
    pub pb: FakePageBuffer,
    pub driver: FakeFileDriver,
    pub log: EventLog,
    pub scheduler: Arc<EotScheduler>,
}

pub fn open_writer(config: SwmrConfig, creating_primary: bool) -> WriterFixture {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let pb = FakePageBuffer::new(log.clone());
    let cache = FakeMetadataCache { log: log.clone() };
    let driver = FakeFileDriver::default();
    let scheduler = Arc::new(EotScheduler::new());

    let writer = SwmrWriter::create(
        config,
        Box::new(pb.clone()),
        Some(Box::new(cache)),
        Box::new(driver.clone()),
        scheduler.clone(),
        creating_primary,
    )
    .unwrap();

    WriterFixture {
        writer,
        pb,
        driver,
        log,
        scheduler,
    }
}

/// Reads the shadow file back through the codec: the header, plus the
/// tick and entries of the index block it points at.
pub fn read_shadow(path: &Path) -> (MdHeader, u64, Vec<IndexEntry>) {
    let file = ShadowFile::open_readonly(path).unwrap();

    let mut header_buf = [0u8; MD_HEADER_SIZE];
    file.read_at(0, &mut header_buf).unwrap();
    let header = MdHeader::from_bytes(&header_buf).unwrap();

    let mut index_buf = vec![0u8; header.index_length() as usize];
    file.read_at(header.index_offset(), &mut index_buf).unwrap();
    let (tick, entries) = codec::decode_index(&index_buf).unwrap();

    (header, tick, entries)
}

/// Writes a header/index pair directly, for reader-side scenarios that
/// need exact on-disk states (index first, then header, like the
/// writer would).
pub fn write_shadow_state(
    path: &Path,
    page_size: u64,
    tick: u64,
    index_offset: u64,
    entries: &[IndexEntry],
) {
    let file = ShadowFile::create(path).unwrap();
    let block = codec::encode_index(tick, entries).unwrap();
    file.write_at(index_offset, &block).unwrap();
    write_header(&file, page_size, tick, index_offset, block.len() as u64);
}

/// Writes only the header, leaving whatever index bytes are on disk in
/// place (to stage torn reads).
pub fn write_shadow_header(path: &Path, page_size: u64, tick: u64, index_offset: u64, index_length: u64) {
    let file = ShadowFile::create(path).unwrap();
    write_header(&file, page_size, tick, index_offset, index_length);
}

fn write_header(file: &ShadowFile, page_size: u64, tick: u64, index_offset: u64, index_length: u64) {
    use zerocopy::IntoBytes;
    let header = MdHeader::new(page_size as u32, tick, index_offset, index_length);
    file.write_at(0, header.as_bytes()).unwrap();
}

/// An index entry pointing a logical page at a shadow page, for
/// crafted on-disk states.
pub fn entry_at(page: u64, shadow_page: u64, length: u32) -> IndexEntry {
    IndexEntry {
        page,
        shadow_page,
        length,
        checksum: 0,
        ..IndexEntry::default()
    }
}
