//! # shadowtick - SWMR Shadow-File Coordination
//!
//! shadowtick implements the single-writer/multiple-reader (SWMR)
//! coordination core for a paged data file. One process appends new page
//! images; any number of reader processes observe a consistent,
//! slightly-stale view of the file without any cross-process locking.
//!
//! ## Architecture Overview
//!
//! Coordination happens through a small auxiliary *shadow file*. At a
//! bounded rate (once per *tick*) the writer publishes an index there
//! that maps logical file pages to the shadow-file locations of their
//! most recent images:
//!
//! ```text
//! ┌────────────┐  tick list   ┌──────────────────┐
//! │ page buffer├─────────────▶│  writer EOT      │
//! └────────────┘              │  engine          │
//!                             └───────┬──────────┘
//!                   index, then header │ (publication order)
//!                             ┌───────▼──────────┐
//!                             │   shadow file    │
//!                             │ page 0: header   │
//!                             │ page 1+: index,  │
//!                             │   page images    │
//!                             └───────┬──────────┘
//!                        poll + diff  │
//!                             ┌───────▼──────────┐
//!                             │  reader EOT      │──▶ evict page buffer,
//!                             │  engine          │    then metadata cache
//!                             └──────────────────┘
//! ```
//!
//! The writer never updates the index in place: each end of tick (EOT)
//! writes fresh page images, then the full index block, then the header.
//! Readers validate checksums and the twin tick numbers carried by both
//! blocks; a mismatch means the read raced a publication and is retried
//! on the next tick.
//!
//! Shadow storage that held a superseded page image is recycled only
//! after `max_lag` ticks, which bounds both reader staleness and the
//! window in which a reader may still dereference an old image.
//!
//! ## Module Overview
//!
//! - [`config`]: tick length, max lag, and shadow-file sizing knobs
//! - [`shadow`]: wire codec, index store, reclamation queue, writer and
//!   reader EOT engines, free-space management
//! - [`scheduler`]: process-wide EOT deadline queue
//! - [`traits`]: seams to the page buffer, metadata cache, and primary
//!   file driver
//!
//! ## Concurrency Model
//!
//! Within a process the library is single-threaded cooperative: at most
//! one EOT runs at a time, and the only blocking operations are
//! synchronous shadow-file I/O and the tick-length sleeps used to drain
//! delayed writes on flush/close. Across processes there are no locks at
//! all; the shadow file is a one-writer/many-reader publication channel.

pub mod config;
pub mod scheduler;
pub mod shadow;
pub mod traits;

pub use config::SwmrConfig;
pub use scheduler::{EotEntry, EotScheduler, FileToken};
pub use shadow::alloc::{ShadowAllocator, ShadowFreeSpace};
pub use shadow::codec;
pub use shadow::defree::{DeferredFrees, ShadowDefree};
pub use shadow::delay::delay_write;
pub use shadow::index::{IndexEntry, ShadowIndex};
pub use shadow::reader::SwmrReader;
pub use shadow::writer::SwmrWriter;
pub use traits::{FileDriver, MetadataCache, PageBuffer, TickListStats};
