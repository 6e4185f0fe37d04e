//! # Shadow Free-Space Management
//!
//! Page-granular allocation of shadow-file storage. The EOT engines
//! consume the manager through the [`ShadowAllocator`] trait; the
//! default implementation here keeps a sorted free list of reclaimed
//! ranges and bumps an end-of-allocations watermark when nothing on the
//! list fits.
//!
//! ## Allocation Strategy
//!
//! Requests are rounded up to whole pages and served first-fit from the
//! free list; a range larger than the request is split, with the tail
//! staying on the list. Freed ranges are merged with adjacent neighbors
//! so the list stays short under the steady defer-then-free churn of
//! the deferred-reclamation queue.
//!
//! ## Deterministic Layout
//!
//! Allocation starts at offset 0. The writer relies on this at open:
//! its first allocation (one page, the header) must land at offset 0
//! and its second (the initial index region) at `page_size`, which
//! pins the layout every reader expects.

use eyre::{ensure, Result};

/// The free-space manager seam: page-aligned allocation of shadow-file
/// byte ranges.
pub trait ShadowAllocator: Send {
    /// Allocates `size` bytes (rounded up to whole pages), returning
    /// the page-aligned byte offset.
    fn alloc(&mut self, size: u64) -> Result<u64>;

    /// Returns a previously allocated range to the manager.
    fn free(&mut self, offset: u64, size: u64) -> Result<()>;

    /// Tears the manager down on writer close.
    fn close(&mut self) -> Result<()>;
}

/// Default first-fit free-space manager for the shadow file.
#[derive(Debug)]
pub struct ShadowFreeSpace {
    page_size: u64,
    /// End of allocations: all space at and beyond this offset is free.
    eoa: u64,
    /// Free ranges `(offset, length)`, sorted by offset, coalesced.
    free: Vec<(u64, u64)>,
}

impl ShadowFreeSpace {
    pub fn new(page_size: u64) -> Result<Self> {
        ensure!(page_size > 0, "page_size must be positive");
        Ok(Self {
            page_size,
            eoa: 0,
            free: Vec::new(),
        })
    }

    pub fn eoa(&self) -> u64 {
        self.eoa
    }

    pub fn free_range_count(&self) -> usize {
        self.free.len()
    }

    fn round_up(&self, size: u64) -> u64 {
        size.div_ceil(self.page_size) * self.page_size
    }
}

impl ShadowAllocator for ShadowFreeSpace {
    fn alloc(&mut self, size: u64) -> Result<u64> {
        ensure!(size > 0, "cannot allocate zero bytes from the shadow file");
        let len = self.round_up(size);

        if let Some(i) = self.free.iter().position(|&(_, l)| l >= len) {
            let (offset, l) = self.free[i];
            if l == len {
                self.free.remove(i);
            } else {
                self.free[i] = (offset + len, l - len);
            }
            return Ok(offset);
        }

        let offset = self.eoa;
        self.eoa += len;
        Ok(offset)
    }

    fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        ensure!(size > 0, "cannot free zero bytes");
        ensure!(
            offset % self.page_size == 0,
            "freed range at {} is not page-aligned",
            offset
        );
        let len = self.round_up(size);
        ensure!(
            offset + len <= self.eoa,
            "freed range {}+{} extends past end of allocations {}",
            offset,
            len,
            self.eoa
        );

        let pos = self.free.partition_point(|&(o, _)| o < offset);
        if pos > 0 {
            let (prev_off, prev_len) = self.free[pos - 1];
            ensure!(
                prev_off + prev_len <= offset,
                "freed range at {} overlaps free range {}+{}",
                offset,
                prev_off,
                prev_len
            );
        }
        if pos < self.free.len() {
            let (next_off, _) = self.free[pos];
            ensure!(
                offset + len <= next_off,
                "freed range {}+{} overlaps free range at {}",
                offset,
                len,
                next_off
            );
        }

        self.free.insert(pos, (offset, len));

        // Coalesce with the following, then the preceding, neighbor.
        if pos + 1 < self.free.len() && self.free[pos].0 + self.free[pos].1 == self.free[pos + 1].0
        {
            self.free[pos].1 += self.free[pos + 1].1;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].0 + self.free[pos - 1].1 == self.free[pos].0 {
            self.free[pos - 1].1 += self.free[pos].1;
            self.free.remove(pos);
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.free.clear();
        self.eoa = 0;
        Ok(())
    }
}
