//! # Shadow-File Machinery
//!
//! Everything that touches the shadow file lives here: the wire codec,
//! the in-memory index, the deferred-reclamation queue, the free-space
//! manager, and the writer and reader EOT engines.
//!
//! ## Shadow-File Layout
//!
//! The shadow file is a flat sequence of fixed-size pages:
//!
//! ```text
//! page 0          page 1 ...
//! ┌──────────┐    ┌───────────────────┐  ┌──────────┐
//! │ header   │    │ index block       │  │ page     │
//! │ (36 B +  │    │ (20 B + 16 B per  │  │ images   │
//! │  zeros)  │    │  entry)           │  │ ...      │
//! └──────────┘    └───────────────────┘  └──────────┘
//! ```
//!
//! Page 0 always holds the header. The index region starts at
//! `page_size` and is re-homed (doubling) when the index outgrows it;
//! the header's `index_offset` field tells readers where to look. Page
//! images are allocated page-aligned anywhere behind the header.
//!
//! ## Publication Protocol
//!
//! The writer publishes each tick in a fixed order: page images, then
//! the index block, then the header. Both index and header carry the
//! tick number and a CRC-32 over their own bytes, so a reader can
//! detect a read that raced the writer (checksum failure, or twin tick
//! mismatch between header and index) and simply retry next tick.
//! There is no locking in either direction.
//!
//! ## Storage Recycling
//!
//! A shadow range that held a superseded image is not reusable
//! immediately: a reader up to `max_lag` ticks behind may still read
//! it. Superseded ranges are parked on the [`defree::DeferredFrees`]
//! queue and handed back to the free-space manager only once they are
//! `max_lag` ticks old.
//!
//! ## Module Organization
//!
//! - `codec`: bit-exact header/index encode and decode
//! - `index`: sorted in-memory index store with doubling growth
//! - `defree`: deferred-reclamation queue
//! - `alloc`: page-granular shadow free-space manager
//! - `delay`: the delayed-write oracle
//! - `file`: positional shadow-file I/O
//! - `writer`: writer-side EOT engine, init, flush and close
//! - `reader`: reader-side EOT engine and catch-up diff

pub mod alloc;
pub mod codec;
pub mod defree;
pub mod delay;
pub mod file;
pub mod index;
pub mod reader;
pub mod writer;

pub use alloc::{ShadowAllocator, ShadowFreeSpace};
pub use defree::{DeferredFrees, ShadowDefree};
pub use delay::delay_write;
pub use file::ShadowFile;
pub use index::{IndexEntry, ShadowIndex};
pub use reader::SwmrReader;
pub use writer::SwmrWriter;
