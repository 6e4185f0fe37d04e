//! # Shadow-Index Store
//!
//! The in-memory form of the shadow-file index: a slot array sorted
//! strictly ascending by logical page number, with a used-count that
//! may trail the allocated capacity. Lookup is binary search; insertion
//! keeps the order by shifting.
//!
//! ## Growth
//!
//! When an insert finds every slot used, capacity doubles (saturating
//! at `u32::MAX` entries). Every prior slot is copied to its prior
//! position - including slots past the used count, since a caller in
//! the middle of a batch of inserts may not have bumped the count yet.
//! Growth is recorded so the writer's next publication can move the
//! on-disk index region to match: it allocates a region for the new
//! capacity, publishes the new offset in the header, and hands the old
//! region to the deferred-reclamation queue tagged with the current
//! tick. Reclaiming the *old* region (not the new one) is load-bearing;
//! readers up to `max_lag` ticks behind still read the old offset.
//!
//! ## Writer-Only Fields
//!
//! Entries carry two fields that never reach the wire: `delayed_flush`,
//! the earliest tick at which the page may be rewritten, and `image`,
//! a handle to the still-unflushed page image in the page buffer. The
//! writer clears every `image` during publication; an entry with an
//! image after an EOT completes is an invariant breach.

use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::shadow::codec::{MD_INDEX_BASE_SIZE, MD_INDEX_ENTRY_SIZE};

/// One index entry: a logical page and the shadow-file location of its
/// most recent image.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Logical page number in the primary file (the sort key).
    pub page: u64,
    /// Shadow-file page holding the current image; 0 means the entry
    /// has never been flushed (page 0 is the header).
    pub shadow_page: u64,
    /// Image length in bytes; a multi-page metadata object may exceed
    /// the page size.
    pub length: u32,
    /// Checksum of the on-shadow image.
    pub checksum: u32,
    /// Earliest tick at which a subsequent write to this page may
    /// proceed; 0 means not delayed. Writer-side only, not persisted.
    pub delayed_flush: u64,
    /// The not-yet-flushed image, borrowed from the page buffer.
    /// Cleared during publication. Writer-side only.
    pub image: Option<Arc<[u8]>>,
}

impl Default for IndexEntry {
    fn default() -> IndexEntry {
        IndexEntry {
            page: 0,
            shadow_page: 0,
            length: 0,
            checksum: 0,
            delayed_flush: 0,
            image: None,
        }
    }
}

impl IndexEntry {
    /// A fresh entry for a newly dirtied page, carrying its image.
    pub fn new(page: u64, image: Arc<[u8]>) -> Result<IndexEntry> {
        let length = u32::try_from(image.len())
            .map_err(|_| eyre::eyre!("page image of {} bytes is too large", image.len()))?;
        Ok(IndexEntry {
            page,
            length,
            image: Some(image),
            ..IndexEntry::default()
        })
    }
}

/// Growable sorted index store.
#[derive(Debug, Default)]
pub struct ShadowIndex {
    slots: Vec<IndexEntry>,
    used: u32,
    /// Capacity before the first growth since the last publication,
    /// if any growth happened.
    pending_growth: Option<u32>,
}

impl ShadowIndex {
    /// An index with no backing slots. The writer creates the real
    /// slot array at its first EOT.
    pub fn new() -> ShadowIndex {
        ShadowIndex::default()
    }

    pub fn with_capacity(capacity: u32) -> Result<ShadowIndex> {
        ensure!(capacity > 0, "shadow index capacity must be positive");
        Ok(ShadowIndex {
            slots: vec![IndexEntry::default(); capacity as usize],
            used: 0,
            pending_growth: None,
        })
    }

    /// Entry capacity implied by the reserved index region: the bytes
    /// past the header page, less the empty-block overhead, divided by
    /// the wire entry size. Writer and reader use the same rule.
    pub fn initial_capacity(page_size: u64, md_pages_reserved: u64) -> Result<u32> {
        ensure!(md_pages_reserved >= 2, "md_pages_reserved must be at least 2");
        let available = (md_pages_reserved - 1) * page_size;
        ensure!(
            available > MD_INDEX_BASE_SIZE as u64,
            "reserved index region of {} bytes cannot hold an empty index",
            available
        );
        let entries = (available - MD_INDEX_BASE_SIZE as u64) / MD_INDEX_ENTRY_SIZE as u64;
        ensure!(entries > 0, "reserved index region holds no entries");
        Ok(entries.min(u64::from(u32::MAX)) as u32)
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// The live entries, sorted by page.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.slots[..self.used as usize]
    }

    pub fn entries_mut(&mut self) -> &mut [IndexEntry] {
        &mut self.slots[..self.used as usize]
    }

    /// Binary search by logical page.
    pub fn lookup(&self, page: u64) -> Option<&IndexEntry> {
        self.position(page).ok().map(|i| &self.slots[i])
    }

    pub fn lookup_mut(&mut self, page: u64) -> Option<&mut IndexEntry> {
        match self.position(page) {
            Ok(i) => Some(&mut self.slots[i]),
            Err(_) => None,
        }
    }

    fn position(&self, page: u64) -> std::result::Result<usize, usize> {
        self.slots[..self.used as usize].binary_search_by_key(&page, |e| e.page)
    }

    /// Inserts an entry for a page not yet present, preserving sort
    /// order and growing the slot array if every slot is used.
    pub fn insert(&mut self, entry: IndexEntry) -> Result<()> {
        ensure!(
            self.capacity() > 0,
            "shadow index has no backing slots yet"
        );
        let pos = match self.position(entry.page) {
            Ok(_) => bail!("duplicate logical page {} in shadow index", entry.page),
            Err(pos) => pos,
        };

        if self.used == self.capacity() {
            self.grow()?;
        }

        let used = self.used as usize;
        self.slots[pos..=used].rotate_right(1);
        self.slots[pos] = entry;
        self.used += 1;
        Ok(())
    }

    fn grow(&mut self) -> Result<()> {
        let old = self.capacity();
        let new = if u32::MAX - old >= old { old * 2 } else { u32::MAX };
        ensure!(new > old, "shadow index is at maximum capacity");

        if self.pending_growth.is_none() {
            self.pending_growth = Some(old);
        }
        self.slots.resize(new as usize, IndexEntry::default());
        Ok(())
    }

    /// Takes the pre-growth capacity recorded by [`insert`](Self::insert),
    /// if the index grew since the last publication. The writer uses
    /// this to re-home the on-disk index region.
    pub fn take_pending_growth(&mut self) -> Option<u32> {
        self.pending_growth.take()
    }

    /// Replaces the live entries wholesale, as the reader does when it
    /// adopts a freshly loaded index. Entries must be strictly sorted.
    pub fn replace_entries(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        for pair in entries.windows(2) {
            ensure!(
                pair[0].page < pair[1].page,
                "replacement entries not strictly ascending: {} then {}",
                pair[0].page,
                pair[1].page
            );
        }
        let used = u32::try_from(entries.len())
            .map_err(|_| eyre::eyre!("replacement index has too many entries"))?;

        if entries.len() > self.slots.len() {
            self.slots.resize(entries.len(), IndexEntry::default());
        }
        for (slot, entry) in self.slots.iter_mut().zip(entries) {
            *slot = entry;
        }
        self.used = used;
        self.pending_growth = None;
        Ok(())
    }

    /// Asserts the live entries are strictly ascending with no
    /// duplicates. A failure is an internal invariant breach.
    pub fn verify_sorted(&self) -> Result<()> {
        for pair in self.entries().windows(2) {
            ensure!(
                pair[0].page < pair[1].page,
                "shadow index order violated: page {} not before page {}",
                pair[0].page,
                pair[1].page
            );
        }
        Ok(())
    }
}
