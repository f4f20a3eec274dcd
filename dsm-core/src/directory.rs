//! §4.4 Directory: manager-only global mapping from page to owner + sharer
//! set. Lives behind a per-page latch so unrelated pages proceed in
//! parallel (§4.3 "different pages proceed in parallel"); a page's entry
//! mutates only when a `PendingRound` finalizes, never mid-round, which is
//! what §4.4's "mutates only after all prerequisite acks are received"
//! invariant is asking for.

use std::collections::{HashSet, VecDeque};

use dsm_proto::{AccessKind, NodeId, PageIndex};
use parking_lot::Mutex;

/// Coarse summary of a page's directory state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirState {
    Uncached,
    Shared,
    Modified,
}

/// The directory-side target this round will commit once every acknowledger
/// in `awaiting` has reported in.
#[derive(Debug, Clone)]
pub struct RoundTarget {
    pub owner: NodeId,
    pub sharers: HashSet<NodeId>,
    pub state: DirState,
}

/// A single in-flight serializing operation for one page (§4.3's `pending`
/// slot). At most one of these exists per page at a time; further requests
/// queue in `DirEntry::queue` until this round finalizes.
#[derive(Debug, Clone)]
pub struct PendingRound {
    pub requester: NodeId,
    pub kind: AccessKind,
    /// Node ids we still need an `InvAck`/`Ack` from before this round can
    /// commit.
    pub awaiting: HashSet<NodeId>,
    /// The node, if any, this round forwarded the page-carrying role to. A
    /// `Gone` from this node (raced `dsm_free`) triggers the §9 bounded
    /// retry; a `Gone` from any other awaited node would be a protocol bug.
    pub source: Option<NodeId>,
    /// Sources already tried and abandoned this round, so a retry never
    /// re-picks one that already replied `Gone`.
    pub tried_sources: HashSet<NodeId>,
    pub target: RoundTarget,
    pub retries: u32,
    pub started: std::time::Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct QueuedRequest {
    pub requester: NodeId,
    pub kind: AccessKind,
}

pub struct DirEntry {
    pub owner: NodeId,
    pub sharers: HashSet<NodeId>,
    pub state: DirState,
    pub pending: Option<PendingRound>,
    pub queue: VecDeque<QueuedRequest>,
}

impl DirEntry {
    fn new(home: NodeId) -> Self {
        DirEntry {
            owner: home,
            sharers: HashSet::new(),
            state: DirState::Uncached,
            pending: None,
            queue: VecDeque::new(),
        }
    }

    /// Exposes a fresh entry to `protocol`'s white-box decision-tree tests,
    /// which then overwrite `state`/`owner`/`sharers` directly to set up
    /// each scenario.
    #[cfg(test)]
    pub(crate) fn fresh_for_test(home: NodeId) -> Self {
        Self::new(home)
    }
}

/// Manager-hosted directory. Absent on non-manager nodes.
pub struct Directory {
    home: NodeId,
    entries: parking_lot::RwLock<std::collections::HashMap<PageIndex, Mutex<DirEntry>>>,
}

impl Directory {
    pub fn new(home: NodeId) -> Self {
        Directory {
            home,
            entries: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn insert(&self, page: PageIndex) {
        self.entries
            .write()
            .entry(page)
            .or_insert_with(|| Mutex::new(DirEntry::new(self.home)));
    }

    pub fn remove(&self, page: PageIndex) {
        self.entries.write().remove(&page);
    }

    /// Run `f` with exclusive access to `page`'s directory entry. Panics if
    /// `page` was never `insert`ed (a `ProtocolError`-worthy bug, caught by
    /// the caller before this is reached).
    pub fn with_entry<R>(&self, page: PageIndex, f: impl FnOnce(&mut DirEntry) -> R) -> Option<R> {
        let guard = self.entries.read();
        let entry = guard.get(&page)?;
        Some(f(&mut entry.lock()))
    }

    pub fn contains(&self, page: PageIndex) -> bool {
        self.entries.read().contains_key(&page)
    }

    /// Pages with a pending round older than `timeout`, for the retry sweep.
    pub fn expired_rounds(&self, timeout: std::time::Duration) -> Vec<PageIndex> {
        let guard = self.entries.read();
        guard
            .iter()
            .filter_map(|(page, entry)| {
                let e = entry.lock();
                e.pending
                    .as_ref()
                    .filter(|p| p.started.elapsed() > timeout)
                    .map(|_| *page)
            })
            .collect()
    }
}
