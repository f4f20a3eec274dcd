//! §4.2 Page Table: per-node mapping from page index to local state,
//! permissions, and the wait-queue that parks faulting threads.
//!
//! Each page gets its own latch (a `Mutex` guarding the page's mutable
//! state) paired with a `Condvar`. A faulting thread parks by calling
//! `Condvar::wait_while` on that same mutex, which atomically releases the
//! latch for the duration of the wait — so the "must not hold a page latch
//! while blocked on a network reply" rule in §5 falls out of the standard
//! condvar pattern rather than needing a second, separate lock.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use dsm_proto::{AccessKind, PageIndex};
use parking_lot::RwLock;

use crate::error::DsmError;

/// Local per-node page state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    Invalid,
    Shared,
    Modified,
    InTransit(AccessKind),
}

impl LocalState {
    pub fn permits(self, kind: AccessKind) -> bool {
        match (self, kind) {
            (LocalState::Modified, _) => true,
            (LocalState::Shared, AccessKind::Read) => true,
            _ => false,
        }
    }
}

struct Inner {
    state: LocalState,
    version: u64,
    /// Set by whichever side completes (or fails) the in-flight round so a
    /// parked thread can tell success from a fatal error on wake.
    result: Option<Result<(), String>>,
}

pub struct PageSlot {
    page: PageIndex,
    mutex: Mutex<Inner>,
    cv: Condvar,
}

impl PageSlot {
    fn new(page: PageIndex) -> Self {
        PageSlot {
            page,
            mutex: Mutex::new(Inner {
                state: LocalState::Invalid,
                version: 0,
                result: None,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn state(&self) -> LocalState {
        self.mutex.lock().unwrap().state
    }

    pub fn version(&self) -> u64 {
        self.mutex.lock().unwrap().version
    }

    /// Transition to `new_state`. Returns the previous state.
    pub fn set_state(&self, new_state: LocalState) -> LocalState {
        let mut g = self.mutex.lock().unwrap();
        let old = g.state;
        g.state = new_state;
        if !matches!(new_state, LocalState::InTransit(_)) {
            g.version += 1;
        }
        old
    }

    /// Mark the page `InTransit{kind}` if it is not already in flight.
    /// Returns `true` if this call is the one that should send the request
    /// (the §4.1 at-most-one-in-flight coalescing rule); a `false` return
    /// means a prior fault already has a request outstanding and the caller
    /// should just park.
    pub fn begin_transit(&self, kind: AccessKind) -> bool {
        let mut g = self.mutex.lock().unwrap();
        if matches!(g.state, LocalState::InTransit(_)) {
            false
        } else {
            g.state = LocalState::InTransit(kind);
            g.result = None;
            true
        }
    }

    /// Park the calling thread until the outstanding round for this page
    /// completes (successfully or with an error).
    pub fn wait_for_completion(&self) -> Result<(), DsmError> {
        let g = self.mutex.lock().unwrap();
        let mut g = self
            .cv
            .wait_while(g, |inner| inner.result.is_none())
            .unwrap();
        let outcome = g.result.take();
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => Err(DsmError::protocol(self.page, reason)),
            None => unreachable!("wait_while only returns once result is Some"),
        }
    }

    /// Complete the in-flight round: install `new_state`, record success,
    /// and wake every parked thread.
    pub fn complete(&self, new_state: LocalState) {
        let mut g = self.mutex.lock().unwrap();
        g.state = new_state;
        g.version += 1;
        g.result = Some(Ok(()));
        self.cv.notify_all();
    }

    /// Fail the in-flight round: revert to `Invalid` and wake every parked
    /// thread with the given reason.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut g = self.mutex.lock().unwrap();
        g.state = LocalState::Invalid;
        g.result = Some(Err(reason.into()));
        self.cv.notify_all();
    }

    /// Honor an `Invalidate`. No local permission is ever granted while a
    /// page is `InTransit` (the `vm.protect` call that grants one only runs
    /// from `complete`), so there is nothing to protect by delaying this —
    /// unlike every other state, `InTransit(Write)` is left untouched rather
    /// than reset to `Invalid`: it is this node's own outstanding request,
    /// racing some other node's round on the same page, and the
    /// `PageData`/`UpgradeGrant` that eventually completes it still needs
    /// to find the page `InTransit` when it arrives.
    pub fn invalidate(&self) {
        let mut g = self.mutex.lock().unwrap();
        if !matches!(g.state, LocalState::InTransit(AccessKind::Write)) {
            g.state = LocalState::Invalid;
        }
        g.version += 1;
    }
}

/// Per-node mapping from page index to local state. A coarse `RwLock` guards
/// the map's shape (insert on `alloc`, remove on `free`); individual lookups
/// and mutations go through the page's own latch so unrelated pages never
/// contend with each other.
pub struct PageTable {
    slots: RwLock<HashMap<PageIndex, Arc<PageSlot>>>,
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, page: PageIndex) {
        self.slots
            .write()
            .entry(page)
            .or_insert_with(|| Arc::new(PageSlot::new(page)));
    }

    pub fn remove(&self, page: PageIndex) {
        self.slots.write().remove(&page);
    }

    pub fn get(&self, page: PageIndex) -> Option<Arc<PageSlot>> {
        self.slots.read().get(&page).cloned()
    }

    pub fn contains(&self, page: PageIndex) -> bool {
        self.slots.read().contains_key(&page)
    }

    /// Coarse read-only scan for `stats()`/diagnostics.
    pub fn for_each(&self, mut f: impl FnMut(PageIndex, LocalState)) {
        for (page, slot) in self.slots.read().iter() {
            f(*page, slot.state());
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
