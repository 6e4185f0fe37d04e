//! # Deferred Reclamation
//!
//! Shadow-file storage whose last reference was just dropped cannot be
//! recycled immediately: a reader up to `max_lag` ticks behind the
//! writer may still be reading the superseded image through its stale
//! index. Superseded ranges are parked here instead, tagged with the
//! tick at which they were superseded, and returned to the free-space
//! manager only once they have aged `max_lag` ticks.
//!
//! ## Queue Discipline
//!
//! New records go on the head, so the queue is ordered by deferral tick
//! - newest at the head, oldest at the tail. The release walk after
//! each publication therefore starts at the tail and stops at the first
//! record that is not yet due; everything before it is younger still.
//! When the writer's tick has not yet exceeded `max_lag`, nothing can
//! possibly be due and the walk is skipped outright.

use std::collections::VecDeque;

use eyre::Result;
use tracing::trace;

use crate::shadow::alloc::ShadowAllocator;

/// One parked shadow-file range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowDefree {
    /// Byte offset of the range in the shadow file.
    pub offset: u64,
    /// Byte length of the range.
    pub length: u64,
    /// Writer tick at which the range was superseded.
    pub tick: u64,
}

/// FIFO of parked ranges, newest first.
#[derive(Debug, Default)]
pub struct DeferredFrees {
    queue: VecDeque<ShadowDefree>,
}

impl DeferredFrees {
    pub fn new() -> DeferredFrees {
        DeferredFrees::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShadowDefree> {
        self.queue.iter()
    }

    /// Parks a range, tagged with the current writer tick.
    pub fn defer(&mut self, offset: u64, length: u64, tick: u64) {
        if self.queue.is_empty() {
            trace!("parking first deferred shadow free");
        }
        self.queue.push_front(ShadowDefree {
            offset,
            length,
            tick,
        });
    }

    /// Releases every range that has aged `max_lag` ticks by
    /// `current_tick`, walking from the tail and stopping at the first
    /// range not yet due. Returns the number of ranges released.
    pub fn reclaim(
        &mut self,
        current_tick: u64,
        max_lag: u64,
        fs: &mut dyn ShadowAllocator,
    ) -> Result<u32> {
        if current_tick <= max_lag {
            return Ok(0);
        }

        let was_nonempty = !self.queue.is_empty();
        let mut released = 0;
        while let Some(back) = self.queue.back() {
            if back.tick + max_lag > current_tick {
                break;
            }
            fs.free(back.offset, back.length)?;
            trace!(
                offset = back.offset,
                length = back.length,
                tick = back.tick,
                "released deferred shadow range"
            );
            self.queue.pop_back();
            released += 1;
        }

        if was_nonempty && self.queue.is_empty() {
            trace!("released last deferred shadow free");
        }
        Ok(released)
    }

    /// Drops every parked range without freeing, for writer close (the
    /// shadow file is unlinked anyway).
    pub fn drain(&mut self) {
        self.queue.clear();
    }
}
