//! # Collaborator Seams
//!
//! The EOT engines drive three external components that live outside
//! this crate: the page buffer that accumulates dirty pages during a
//! tick, the metadata-object cache that holds decoded records, and the
//! primary file's driver. Each is consumed through a small trait so the
//! engines can be exercised against recording fakes in tests and bound
//! to the real components by the embedding application.
//!
//! ## Call Discipline
//!
//! The engines call these traits in a fixed order that the protocol
//! depends on. On the writer side, `update_index` runs before the shadow
//! file is touched (the page images it exposes must stay valid until
//! they are written out), and `release_tick_list` /
//! `release_delayed_writes` run only after the new index and header are
//! durably in place. On the reader side, `remove_entry` is issued for
//! every superseded page *before* any
//! `evict_or_refresh_all_entries_in_page` call: the metadata cache may
//! re-read from the page buffer while refreshing, and must not find a
//! stale image there.

use eyre::Result;

use crate::shadow::index::ShadowIndex;

/// Counts reported by [`PageBuffer::update_index`] for one tick list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickListStats {
    /// Entries newly added to the index this tick.
    pub added: u32,
    /// Existing entries whose image was replaced this tick.
    pub modified: u32,
    /// Index entries the tick list did not touch.
    pub not_in_tick_list: u32,
    /// Untouched entries that are already flushed to the shadow file.
    pub not_in_tick_list_flushed: u32,
}

/// The page buffer: accumulates the pages dirtied during the current
/// tick and tracks writes delayed by the oracle.
pub trait PageBuffer: Send {
    /// Informs the buffer of the writer's (or reader's) current tick.
    fn set_tick(&mut self, tick: u64) -> Result<()>;

    /// Reconciles the tick list against the shadow index: inserts an
    /// entry for every newly dirtied page (carrying its image) and
    /// replaces the image of every re-dirtied page. Added entries keep
    /// their image handle until the writer flushes them.
    fn update_index(&mut self, index: &mut ShadowIndex) -> Result<TickListStats>;

    /// Drops the tick list once its images have been written out.
    fn release_tick_list(&mut self) -> Result<()>;

    /// Releases delayed writes whose deadline has passed at `tick`.
    fn release_delayed_writes(&mut self, tick: u64) -> Result<()>;

    /// Evicts the buffered page at the given byte address, if any.
    fn remove_entry(&mut self, addr: u64) -> Result<()>;

    /// Number of writes currently held back by the delay oracle.
    fn delayed_write_count(&self) -> usize;
}

/// The metadata-object cache layered above the page buffer.
pub trait MetadataCache: Send {
    /// Flushes dirty cache entries down into the page buffer.
    fn flush(&mut self) -> Result<()>;

    /// Evicts or refreshes every cached record that lives in the given
    /// logical page, as of `tick`.
    fn evict_or_refresh_all_entries_in_page(&mut self, page: u64, tick: u64) -> Result<()>;
}

/// The primary file's driver, as far as the writer EOT needs it.
pub trait FileDriver: Send {
    /// Flushes raw (non-metadata) data to the primary file.
    fn flush_raw_data(&mut self) -> Result<()>;

    /// Returns file-space aggregators to the free-space manager.
    fn release_aggregators(&mut self) -> Result<()>;

    /// Truncates the primary file to its logical size.
    fn truncate(&mut self, closing: bool) -> Result<()>;
}
