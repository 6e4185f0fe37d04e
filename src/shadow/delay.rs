//! # Delayed-Write Oracle
//!
//! Decides how long a pending write to a logical page must be held
//! back. A reader resolves any page *not* listed in the shadow index
//! against the primary file directly, so overwriting a page that was
//! recently listed (or recently created) before every reader has had a
//! chance to catch up would hand that reader bytes from the future.
//! The oracle closes the window: a page must age `max_lag` ticks in
//! the index before the primary-file copy may change.

use eyre::{ensure, Result};

use crate::shadow::index::ShadowIndex;

/// Returns the tick until which a pending write to `page` must be
/// postponed, or 0 if the write may proceed immediately.
///
/// A page absent from the index is treated as having appeared this
/// tick and must wait out the full lag; a present page honors any
/// existing `delayed_flush` deadline that has not yet passed.
pub fn delay_write(index: &ShadowIndex, tick: u64, max_lag: u64, page: u64) -> Result<u64> {
    let until = match index.lookup(page) {
        None => tick + max_lag,
        Some(entry) if entry.delayed_flush >= tick => entry.delayed_flush,
        Some(_) => 0,
    };

    if until != 0 {
        ensure!(
            until >= tick && until <= tick + max_lag,
            "write delay for page {} is out of range: until {} at tick {} with max_lag {}",
            page,
            until,
            tick,
            max_lag
        );
    }

    Ok(until)
}
