//! # End-of-Tick Scheduler
//!
//! A process-wide queue of every open SWMR file, ordered by its next
//! end-of-tick deadline. The engines do not run on their own threads;
//! instead, the embedding application asks the scheduler at its API
//! boundary whether the head entry's deadline has passed and, if so,
//! runs the matching engine on that file. The engine removes and
//! reinserts its own entry, so the queue stays sorted by construction.
//!
//! ## Ordering
//!
//! Insertion walks from the tail and places the new entry after the
//! last entry whose deadline is less than or equal to the new one.
//! Entries with equal deadlines therefore dispatch in FIFO order, and
//! a remove-then-reinsert of an unchanged entry leaves the queue
//! unchanged up to that FIFO rotation.
//!
//! ## Dispatch Gating
//!
//! API calls nest; running an EOT from a nested call would reenter the
//! engines. The scheduler keeps an entry counter and only hands out
//! due work on the outermost transitions: 0 -> 1 on the way in and
//! 1 -> 0 on the way out.
//!
//! ## Head Observables
//!
//! Callers that only need "is the head a writer" / "when is the next
//! deadline" use [`EotScheduler::head_is_writer`] and
//! [`EotScheduler::head_deadline`] rather than walking the queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

/// Identity of one open SWMR file within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileToken(u64);

impl FileToken {
    /// Allocates a fresh process-unique token.
    pub fn next() -> FileToken {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FileToken(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One scheduled file: who it is, which engine it runs, and when.
#[derive(Debug, Clone, Copy)]
pub struct EotEntry {
    pub token: FileToken,
    /// True if the file is open for writing (dispatch runs the writer
    /// engine), false for a reader.
    pub writer: bool,
    /// The file's current tick at insertion time.
    pub tick: u64,
    /// The deadline at which the file's next EOT is due.
    pub deadline: Instant,
}

#[derive(Debug, Default)]
struct SchedState {
    /// Sorted by ascending deadline; FIFO among equals.
    queue: Vec<EotEntry>,
    /// Library entry counter; only 0->1 and 1->0 dispatch.
    api_entries: u32,
}

/// The end-of-tick queue. One instance normally serves the whole
/// process ([`EotScheduler::global`]); tests may run private ones.
#[derive(Debug, Default)]
pub struct EotScheduler {
    state: Mutex<SchedState>,
}

impl EotScheduler {
    pub fn new() -> EotScheduler {
        EotScheduler::default()
    }

    /// The process-wide scheduler instance.
    pub fn global() -> Arc<EotScheduler> {
        static GLOBAL: OnceLock<Arc<EotScheduler>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(EotScheduler::new())).clone()
    }

    /// Inserts an entry, keeping deadline order and FIFO among equal
    /// deadlines.
    pub fn insert(&self, entry: EotEntry) {
        let mut state = self.state.lock();
        let pos = state
            .queue
            .iter()
            .rposition(|e| e.deadline <= entry.deadline)
            .map(|i| i + 1)
            .unwrap_or(0);
        state.queue.insert(pos, entry);
    }

    /// Removes the entry for the given file, if present.
    pub fn remove(&self, token: FileToken) -> bool {
        let mut state = self.state.lock();
        match state.queue.iter().position(|e| e.token == token) {
            Some(i) => {
                state.queue.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether the head entry belongs to a writer. False when empty.
    pub fn head_is_writer(&self) -> bool {
        self.state
            .lock()
            .queue
            .first()
            .is_some_and(|e| e.writer)
    }

    /// The earliest deadline in the queue, if any.
    pub fn head_deadline(&self) -> Option<Instant> {
        self.state.lock().queue.first().map(|e| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// The head entry if its deadline has passed at `now`.
    pub fn due_head(&self, now: Instant) -> Option<EotEntry> {
        let state = self.state.lock();
        state.queue.first().filter(|e| e.deadline <= now).copied()
    }

    /// Records entry into the library. Returns due work only on the
    /// outermost (0 -> 1) transition.
    pub fn api_enter(&self) -> Option<EotEntry> {
        let mut state = self.state.lock();
        state.api_entries += 1;
        if state.api_entries == 1 {
            let now = Instant::now();
            state.queue.first().filter(|e| e.deadline <= now).copied()
        } else {
            None
        }
    }

    /// Records exit from the library. Returns due work only on the
    /// outermost (1 -> 0) transition.
    pub fn api_exit(&self) -> Option<EotEntry> {
        let mut state = self.state.lock();
        state.api_entries = state.api_entries.saturating_sub(1);
        if state.api_entries == 0 {
            let now = Instant::now();
            state.queue.first().filter(|e| e.deadline <= now).copied()
        } else {
            None
        }
    }

    /// Snapshot of the queue in deadline order, for tests and dumps.
    pub fn entries(&self) -> Vec<EotEntry> {
        self.state.lock().queue.clone()
    }

    /// Logs a summary of the queue.
    pub fn dump(&self) {
        let state = self.state.lock();
        if state.queue.is_empty() {
            debug!("EOT queue is empty");
            return;
        }
        for (i, e) in state.queue.iter().enumerate() {
            debug!(
                i,
                writer = e.writer,
                tick = e.tick,
                deadline = ?e.deadline,
                token = ?e.token,
                "EOT queue entry"
            );
        }
    }
}
