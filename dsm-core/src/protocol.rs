//! §4.3 Coherence Protocol: the write-invalidate, home-based-directory FSM.
//!
//! `start_round` is the only place directory state is *decided*; it never
//! mutates `DirEntry::{owner,sharers,state}` directly (§4.4's "mutates only
//! after all prerequisite acks are received"), only stages a `RoundTarget`
//! that a later `Ack`/`InvAck` commits once `PendingRound::awaiting` drains
//! to empty. Every node — including the manager acting on its own page
//! table — reaches the protocol through the exact same message handlers;
//! the manager-local fault path only short-circuits the network hop (the
//! `Transport::send`-to-self convention), never the state machine (§4.3
//! "Edge cases").

use std::collections::HashSet;
use std::time::Instant;

use dsm_proto::{AccessKind, GrantedState, Message, NodeId, PageIndex, Transport};
use dsm_vm::{Protection, VirtualMemory};

use crate::directory::{DirEntry, DirState, PendingRound, RoundTarget};
use crate::error::DsmError;
use crate::page_table::LocalState;
use crate::Engine;

pub(crate) fn prot_for(state: LocalState) -> Protection {
    match state {
        LocalState::Invalid | LocalState::InTransit(_) => Protection::None,
        LocalState::Shared => Protection::Read,
        LocalState::Modified => Protection::ReadWrite,
    }
}

/// Decide the message(s) a fresh round for `(page, requester, kind)` needs
/// to send, and stage the directory mutation that will commit once they're
/// all acknowledged. Called with the page's directory entry already
/// latched.
fn start_round(
    entry: &mut DirEntry,
    page: PageIndex,
    requester: NodeId,
    kind: AccessKind,
    page_size: usize,
    manager: NodeId,
) -> Vec<(NodeId, Message)> {
    let mut sends = Vec::new();
    let mut awaiting = HashSet::new();
    let mut source = None;

    let target = match (entry.state, kind) {
        (DirState::Uncached, AccessKind::Read) => {
            sends.push((
                requester,
                Message::PageData {
                    page,
                    requester,
                    granted: GrantedState::Shared,
                    bytes: vec![0u8; page_size],
                },
            ));
            awaiting.insert(requester);
            let mut sharers = HashSet::new();
            sharers.insert(requester);
            RoundTarget {
                owner: entry.owner,
                sharers,
                state: DirState::Shared,
            }
        }
        (DirState::Uncached, AccessKind::Write) => {
            sends.push((
                requester,
                Message::PageData {
                    page,
                    requester,
                    granted: GrantedState::Modified,
                    bytes: vec![0u8; page_size],
                },
            ));
            awaiting.insert(requester);
            RoundTarget {
                owner: requester,
                sharers: HashSet::new(),
                state: DirState::Modified,
            }
        }
        (DirState::Shared, AccessKind::Read) => {
            // Prefer the manager itself if it already holds the page, rather
            // than an arbitrary sharer, to avoid a needless network hop.
            let from = if entry.sharers.contains(&manager) {
                manager
            } else {
                *entry
                    .sharers
                    .iter()
                    .next()
                    .expect("Shared implies a non-empty sharer set")
            };
            sends.push((
                from,
                Message::Forward {
                    page,
                    requester,
                    kind: AccessKind::Read,
                },
            ));
            source = Some(from);
            awaiting.insert(requester);
            let mut sharers = entry.sharers.clone();
            sharers.insert(requester);
            RoundTarget {
                owner: entry.owner,
                sharers,
                state: DirState::Shared,
            }
        }
        (DirState::Shared, AccessKind::Write) => {
            let others: HashSet<NodeId> = entry
                .sharers
                .iter()
                .copied()
                .filter(|n| *n != requester)
                .collect();
            if entry.sharers.contains(&requester) {
                // Upgrade: the requester already has the bytes, so only the
                // other sharers need invalidating (§4.3 "Upgrade"). The
                // requester still needs telling, since it has no page
                // transfer to wait on — `UpgradeGrant` is `PageData`'s
                // no-payload counterpart for this case.
                for n in &others {
                    sends.push((*n, Message::Invalidate { page }));
                    awaiting.insert(*n);
                }
                sends.push((requester, Message::UpgradeGrant { page, requester }));
            } else if let Some(&from) = others.iter().next() {
                sends.push((
                    from,
                    Message::Forward {
                        page,
                        requester,
                        kind: AccessKind::Write,
                    },
                ));
                source = Some(from);
                awaiting.insert(from);
                for n in others.iter().filter(|n| **n != from) {
                    sends.push((*n, Message::Invalidate { page }));
                    awaiting.insert(*n);
                }
            }
            awaiting.insert(requester);
            RoundTarget {
                owner: requester,
                sharers: HashSet::new(),
                state: DirState::Modified,
            }
        }
        (DirState::Modified, AccessKind::Read) => {
            let owner = entry.owner;
            if owner == requester {
                // Shouldn't normally fault (already holds write rights);
                // degrade to a no-op completion rather than protocol error.
                awaiting.insert(requester);
            } else {
                sends.push((
                    owner,
                    Message::Forward {
                        page,
                        requester,
                        kind: AccessKind::Read,
                    },
                ));
                source = Some(owner);
                awaiting.insert(owner);
                awaiting.insert(requester);
            }
            let mut sharers = HashSet::new();
            sharers.insert(owner);
            sharers.insert(requester);
            RoundTarget {
                owner,
                sharers,
                state: DirState::Shared,
            }
        }
        (DirState::Modified, AccessKind::Write) => {
            let owner = entry.owner;
            if owner != requester {
                sends.push((
                    owner,
                    Message::Forward {
                        page,
                        requester,
                        kind: AccessKind::Write,
                    },
                ));
                source = Some(owner);
                awaiting.insert(owner);
            }
            awaiting.insert(requester);
            RoundTarget {
                owner: requester,
                sharers: HashSet::new(),
                state: DirState::Modified,
            }
        }
    };

    entry.pending = Some(PendingRound {
        requester,
        kind,
        awaiting,
        source,
        tried_sources: HashSet::new(),
        target,
        retries: 0,
        started: Instant::now(),
    });
    sends
}

impl<V, T> Engine<V, T>
where
    V: VirtualMemory + 'static,
    T: Transport + 'static,
{
    /// The reactor's single entry point: every inbound message, from any
    /// node (including this one, via the self-send short circuit), flows
    /// through here.
    pub(crate) fn handle_message(&self, msg: Message) -> Result<(), DsmError> {
        tracing::debug!(?msg, "handling inbound message");
        match msg {
            Message::ReadReq { page, requester } => self.manager_on_request(page, requester, AccessKind::Read),
            Message::WriteReq { page, requester } => {
                self.manager_on_request(page, requester, AccessKind::Write)
            }
            Message::Forward { page, requester, kind } => self.on_forward(page, requester, kind),
            Message::PageData {
                page,
                requester,
                granted,
                bytes,
            } => self.on_page_data(page, requester, granted, bytes),
            Message::Invalidate { page } => self.on_invalidate(page),
            Message::UpgradeGrant { page, requester } => self.on_upgrade_grant(page, requester),
            Message::InvAck { page, from } => self.manager_on_ack(page, from),
            Message::Ack { page, from } => self.manager_on_ack(page, from),
            Message::Gone { page, from } => self.manager_on_gone(page, from),
            Message::BarrierEnter { epoch, from } => self.manager_on_barrier_enter(epoch, from),
            Message::BarrierRelease { epoch } => {
                self.barrier.on_release(epoch);
                Ok(())
            }
            Message::LockReq { lock_id, from } => self.manager_on_lock_req(lock_id, from),
            Message::LockRel { lock_id, from } => self.manager_on_lock_rel(lock_id, from),
            Message::LockGrant { lock_id } => {
                self.locks.on_grant(lock_id);
                Ok(())
            }
            Message::Leave { from } => {
                tracing::info!(node = from, "peer left the cluster");
                Ok(())
            }
        }
    }

    /// Dispatch every `(destination, message)` pair a directory decision
    /// produced, counting `Invalidate` sends for `stats()` along the way.
    fn send_all(&self, sends: Vec<(NodeId, Message)>) -> Result<(), DsmError> {
        for (to, msg) in sends {
            if matches!(msg, Message::Invalidate { .. }) {
                self.stats.record_invalidation_sent();
            }
            self.transport.send(to, msg)?;
        }
        Ok(())
    }

    fn directory(&self) -> Result<&crate::directory::Directory, DsmError> {
        self.directory
            .as_ref()
            .ok_or_else(|| DsmError::protocol(0, "directory message received on non-manager node"))
    }

    fn manager_on_request(&self, page: PageIndex, requester: NodeId, kind: AccessKind) -> Result<(), DsmError> {
        let dir = self.directory()?;
        if !dir.contains(page) {
            return Err(DsmError::protocol(page, "request for an unallocated page"));
        }
        let page_size = self.page_size;
        let manager = self.transport.manager_node();
        let sends = dir
            .with_entry(page, |entry| {
                if entry.pending.is_some() {
                    entry
                        .queue
                        .push_back(crate::directory::QueuedRequest { requester, kind });
                    Vec::new()
                } else {
                    start_round(entry, page, requester, kind, page_size, manager)
                }
            })
            .unwrap_or_default();
        tracing::info!(page, requester, ?kind, "directory round started");
        self.send_all(sends)?;
        Ok(())
    }

    /// Shared handler for both `Ack` (owner/requester install confirmation)
    /// and `InvAck` (sharer invalidation confirmation): both just clear one
    /// name out of the round's `awaiting` set.
    fn manager_on_ack(&self, page: PageIndex, from: NodeId) -> Result<(), DsmError> {
        let dir = self.directory()?;
        let page_size = self.page_size;
        let manager = self.transport.manager_node();
        let sends = dir
            .with_entry(page, |entry| {
                let mut sends = Vec::new();
                let mut commit = None;
                if let Some(pending) = &mut entry.pending {
                    pending.awaiting.remove(&from);
                    if pending.awaiting.is_empty() {
                        commit = Some(pending.target.clone());
                    }
                }
                if let Some(target) = commit {
                    entry.owner = target.owner;
                    entry.sharers = target.sharers;
                    entry.state = target.state;
                    entry.pending = None;
                    tracing::info!(page, owner = entry.owner, state = ?entry.state, "directory round committed");
                    if let Some(q) = entry.queue.pop_front() {
                        sends = start_round(entry, page, q.requester, q.kind, page_size, manager);
                    }
                }
                sends
            })
            .unwrap_or_default();
        self.send_all(sends)?;
        Ok(())
    }

    /// A `Forward` target no longer has the page (raced a `dsm_free`):
    /// bounded retry against a fresh candidate, falling back to zero-fill
    /// (§9).
    fn manager_on_gone(&self, page: PageIndex, from: NodeId) -> Result<(), DsmError> {
        let dir = self.directory()?;
        let page_size = self.page_size;
        let sends = dir
            .with_entry(page, |entry| retry_after_gone(entry, page, from, page_size))
            .unwrap_or_default();
        self.send_all(sends)?;
        Ok(())
    }

    fn manager_on_barrier_enter(&self, epoch: u64, from: NodeId) -> Result<(), DsmError> {
        let _ = epoch;
        if let Some(released) = self.barrier.manager_arrive(from, self.config.num_nodes) {
            tracing::info!(epoch = released, "barrier released");
            for node in 0..self.config.num_nodes {
                self.transport
                    .send(node, Message::BarrierRelease { epoch: released })?;
            }
        }
        Ok(())
    }

    fn manager_on_lock_req(&self, lock_id: u64, from: NodeId) -> Result<(), DsmError> {
        if let Some(granted) = self.locks.manager_request(lock_id, from) {
            tracing::info!(lock_id, node = granted, "lock granted");
            self.transport.send(granted, Message::LockGrant { lock_id })?;
        }
        Ok(())
    }

    fn manager_on_lock_rel(&self, lock_id: u64, from: NodeId) -> Result<(), DsmError> {
        if let Some(next) = self.locks.manager_release(lock_id, from) {
            tracing::info!(lock_id, node = next, "lock granted");
            self.transport.send(next, Message::LockGrant { lock_id })?;
        }
        Ok(())
    }

    /// A node was told to transfer `page` to `requester` (§4.3 read/write
    /// fault protocols, step 2). Reads its own copy, adjusts its own local
    /// state, and sends the page onward plus an acknowledgement to the
    /// manager. Addressed through `manager_node()` so a non-manager owner's
    /// `PageData` is relayed by the transport if `requester` isn't the
    /// manager (dsm-transport's star topology); a manager forwarding to
    /// itself short-circuits the same way any self-send does.
    fn on_forward(&self, page: PageIndex, requester: NodeId, kind: AccessKind) -> Result<(), DsmError> {
        let slot = self
            .page_table
            .get(page)
            .ok_or_else(|| DsmError::protocol(page, "Forward for a page with no local slot"))?;
        let local = self.transport.local_node();
        let manager = self.transport.manager_node();
        let cur = slot.state();
        if !matches!(cur, LocalState::Modified | LocalState::Shared) {
            self.transport.send(manager, Message::Gone { page, from: local })?;
            return Ok(());
        }

        let bytes = self.read_local_page_bytes(page);
        let granted = match kind {
            AccessKind::Read => GrantedState::Shared,
            AccessKind::Write => GrantedState::Modified,
        };
        let new_local_state = match (kind, cur) {
            (AccessKind::Read, LocalState::Modified) => LocalState::Shared,
            (AccessKind::Read, LocalState::Shared) => LocalState::Shared,
            (AccessKind::Write, _) => LocalState::Invalid,
            (AccessKind::Read, _) => unreachable!("guarded above"),
        };
        if new_local_state != cur {
            slot.set_state(new_local_state);
            self.vm
                .protect(self.addr_of(page), 1, prot_for(new_local_state))?;
        }
        self.stats.record_page_sent(bytes.len());
        self.transport.send(
            manager,
            Message::PageData {
                page,
                requester,
                granted,
                bytes,
            },
        )?;
        self.transport.send(manager, Message::Ack { page, from: local })?;
        Ok(())
    }

    /// `PageData` addressed to us: install the page and acknowledge.
    fn on_page_data(
        &self,
        page: PageIndex,
        requester: NodeId,
        granted: GrantedState,
        bytes: Vec<u8>,
    ) -> Result<(), DsmError> {
        let local = self.transport.local_node();
        if requester != local {
            return Err(DsmError::protocol(page, "PageData delivered to the wrong node"));
        }
        let slot = self
            .page_table
            .get(page)
            .ok_or_else(|| DsmError::protocol(page, "PageData for an unallocated page"))?;
        if !matches!(slot.state(), LocalState::InTransit(_)) {
            return Err(DsmError::protocol(page, "PageData for a page not InTransit"));
        }

        self.stats.record_page_fetched();
        self.stats.record_bytes_received(bytes.len());
        self.write_local_page_bytes(page, &bytes);

        let new_state = match granted {
            GrantedState::Shared => LocalState::Shared,
            GrantedState::Modified => LocalState::Modified,
        };
        self.vm.protect(self.addr_of(page), 1, prot_for(new_state))?;
        slot.complete(new_state);

        let manager = self.transport.manager_node();
        self.transport.send(manager, Message::Ack { page, from: local })?;
        Ok(())
    }

    /// `UpgradeGrant` addressed to us: the §4.3 "Upgrade" case — we already
    /// hold the bytes `Shared`, so there is nothing to install but the
    /// permission change itself.
    fn on_upgrade_grant(&self, page: PageIndex, requester: NodeId) -> Result<(), DsmError> {
        let local = self.transport.local_node();
        if requester != local {
            return Err(DsmError::protocol(page, "UpgradeGrant delivered to the wrong node"));
        }
        let slot = self
            .page_table
            .get(page)
            .ok_or_else(|| DsmError::protocol(page, "UpgradeGrant for an unallocated page"))?;
        if !matches!(slot.state(), LocalState::InTransit(AccessKind::Write)) {
            return Err(DsmError::protocol(page, "UpgradeGrant for a page not InTransit{Write}"));
        }

        self.vm
            .protect(self.addr_of(page), 1, prot_for(LocalState::Modified))?;
        slot.complete(LocalState::Modified);

        let manager = self.transport.manager_node();
        self.transport.send(manager, Message::Ack { page, from: local })?;
        Ok(())
    }

    /// `Invalidate` addressed to us: drop our shared copy and acknowledge
    /// immediately, even when a write fault of our own is concurrently in
    /// flight for the same page (a sharer can race another node's write
    /// round with its own write fault on that page). Acking only once our
    /// own fault completes would deadlock: our fault can't complete until
    /// the manager commits this very round, and the round can't commit
    /// without our `InvAck`. `PageSlot::invalidate` keeps the `InTransit`
    /// marker intact so our own request still resolves normally once it is
    /// eventually serviced.
    fn on_invalidate(&self, page: PageIndex) -> Result<(), DsmError> {
        let slot = self
            .page_table
            .get(page)
            .ok_or_else(|| DsmError::protocol(page, "Invalidate for an unallocated page"))?;
        self.stats.record_invalidation_received();
        slot.invalidate();
        self.vm.protect(self.addr_of(page), 1, Protection::None)?;
        let manager = self.transport.manager_node();
        let local = self.transport.local_node();
        self.transport.send(manager, Message::InvAck { page, from: local })?;
        Ok(())
    }
}

fn retry_after_gone(
    entry: &mut DirEntry,
    page: PageIndex,
    from: NodeId,
    page_size: usize,
) -> Vec<(NodeId, Message)> {
    let Some(pending) = &mut entry.pending else {
        return Vec::new();
    };
    if pending.source != Some(from) {
        // Not the node we were waiting on as the page-data source; ignore.
        return Vec::new();
    }
    pending.tried_sources.insert(from);
    pending.awaiting.remove(&from);

    let requester = pending.requester;
    let kind = pending.kind;

    if pending.retries >= 2 {
        tracing::warn!(page, "bounded retry exhausted, falling back to zero-fill");
        return zero_fill_fallback(entry, page, requester, kind, page_size);
    }

    let candidate = entry
        .sharers
        .iter()
        .copied()
        .find(|n| *n != requester && !entry.pending.as_ref().unwrap().tried_sources.contains(n));

    match candidate {
        Some(next) => {
            let pending = entry.pending.as_mut().unwrap();
            pending.retries += 1;
            pending.source = Some(next);
            pending.awaiting.insert(next);
            vec![(next, Message::Forward { page, requester, kind })]
        }
        None => zero_fill_fallback(entry, page, requester, kind, page_size),
    }
}

/// No live node has a copy to forward: hand the requester a fresh
/// zero-filled page directly, same as the `Uncached` path.
fn zero_fill_fallback(
    entry: &mut DirEntry,
    page: PageIndex,
    requester: NodeId,
    kind: AccessKind,
    page_size: usize,
) -> Vec<(NodeId, Message)> {
    let granted = match kind {
        AccessKind::Read => GrantedState::Shared,
        AccessKind::Write => GrantedState::Modified,
    };
    let target = match kind {
        AccessKind::Read => {
            let mut sharers = HashSet::new();
            sharers.insert(requester);
            RoundTarget {
                owner: entry.owner,
                sharers,
                state: DirState::Shared,
            }
        }
        AccessKind::Write => RoundTarget {
            owner: requester,
            sharers: HashSet::new(),
            state: DirState::Modified,
        },
    };
    let mut awaiting = HashSet::new();
    awaiting.insert(requester);
    entry.pending = Some(PendingRound {
        requester,
        kind,
        awaiting,
        source: None,
        tried_sources: HashSet::new(),
        target,
        retries: 2,
        started: Instant::now(),
    });
    vec![(
        requester,
        Message::PageData {
            page,
            requester,
            granted,
            bytes: vec![0u8; page_size],
        },
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirEntry;

    fn entry(home: NodeId, state: DirState, owner: NodeId, sharers: &[NodeId]) -> DirEntry {
        let mut e = DirEntry::fresh_for_test(home);
        e.state = state;
        e.owner = owner;
        e.sharers = sharers.iter().copied().collect();
        e
    }

    #[test]
    fn uncached_read_zero_fills_directly() {
        let mut e = entry(0, DirState::Uncached, 0, &[]);
        let sends = start_round(&mut e, 1, 5, AccessKind::Read, 4096, 0);
        assert_eq!(sends.len(), 1);
        assert!(matches!(&sends[0].1, Message::PageData { requester: 5, granted: GrantedState::Shared, .. }));
        assert_eq!(e.pending.as_ref().unwrap().target.state, DirState::Shared);
    }

    #[test]
    fn uncached_write_zero_fills_directly() {
        let mut e = entry(0, DirState::Uncached, 0, &[]);
        let sends = start_round(&mut e, 1, 5, AccessKind::Write, 4096, 0);
        assert_eq!(sends.len(), 1);
        assert!(matches!(&sends[0].1, Message::PageData { granted: GrantedState::Modified, .. }));
        assert_eq!(e.pending.as_ref().unwrap().target.owner, 5);
    }

    #[test]
    fn shared_read_forwards_from_an_existing_sharer() {
        let mut e = entry(0, DirState::Shared, 0, &[2, 3]);
        let sends = start_round(&mut e, 1, 4, AccessKind::Read, 4096, 0);
        assert_eq!(sends.len(), 1);
        let (to, msg) = &sends[0];
        assert!([2, 3].contains(to));
        assert!(matches!(msg, Message::Forward { kind: AccessKind::Read, requester: 4, .. }));
        assert!(e.pending.as_ref().unwrap().target.sharers.contains(&4));
    }

    #[test]
    fn shared_read_prefers_the_manager_over_an_arbitrary_sharer() {
        let mut e = entry(0, DirState::Shared, 0, &[2, 0, 3]);
        let sends = start_round(&mut e, 1, 4, AccessKind::Read, 4096, 0);
        assert_eq!(sends.len(), 1);
        let (to, msg) = &sends[0];
        assert_eq!(*to, 0);
        assert!(matches!(msg, Message::Forward { kind: AccessKind::Read, requester: 4, .. }));
    }

    #[test]
    fn shared_write_upgrade_only_invalidates_other_sharers() {
        let mut e = entry(0, DirState::Shared, 0, &[4, 2, 3]);
        let sends = start_round(&mut e, 1, 4, AccessKind::Write, 4096, 0);
        assert_eq!(sends.len(), 3);
        let invalidates: Vec<_> = sends.iter().filter(|(_, m)| matches!(m, Message::Invalidate { .. })).collect();
        let targets: HashSet<NodeId> = invalidates.iter().map(|(to, _)| *to).collect();
        assert_eq!(targets, HashSet::from([2, 3]));
        assert!(sends.iter().any(|(to, m)| *to == 4 && matches!(m, Message::UpgradeGrant { requester: 4, .. })));
    }

    #[test]
    fn shared_write_from_new_requester_forwards_and_invalidates_rest() {
        let mut e = entry(0, DirState::Shared, 0, &[2, 3]);
        let sends = start_round(&mut e, 1, 4, AccessKind::Write, 4096, 0);
        let forwards: Vec<_> = sends.iter().filter(|(_, m)| matches!(m, Message::Forward { .. })).collect();
        let invalidates: Vec<_> = sends.iter().filter(|(_, m)| matches!(m, Message::Invalidate { .. })).collect();
        assert_eq!(forwards.len(), 1);
        assert_eq!(invalidates.len(), 1);
        assert_eq!(e.pending.as_ref().unwrap().target.owner, 4);
    }

    #[test]
    fn modified_read_forwards_to_owner_and_awaits_both() {
        let mut e = entry(0, DirState::Modified, 7, &[]);
        let sends = start_round(&mut e, 1, 4, AccessKind::Read, 4096, 0);
        assert_eq!(sends.len(), 1);
        assert!(matches!(&sends[0].1, Message::Forward { kind: AccessKind::Read, requester: 4, .. }));
        let pending = e.pending.as_ref().unwrap();
        assert_eq!(pending.awaiting, HashSet::from([7, 4]));
        assert_eq!(pending.target.sharers, HashSet::from([7, 4]));
    }

    #[test]
    fn modified_write_transfers_ownership() {
        let mut e = entry(0, DirState::Modified, 7, &[]);
        let sends = start_round(&mut e, 1, 4, AccessKind::Write, 4096, 0);
        assert_eq!(sends.len(), 1);
        assert!(matches!(&sends[0].1, Message::Forward { kind: AccessKind::Write, requester: 4, .. }));
        assert_eq!(e.pending.as_ref().unwrap().target.owner, 4);
    }

    #[test]
    fn modified_write_from_current_owner_sends_nothing() {
        let mut e = entry(0, DirState::Modified, 4, &[]);
        let sends = start_round(&mut e, 1, 4, AccessKind::Write, 4096, 0);
        assert!(sends.is_empty());
        assert_eq!(e.pending.as_ref().unwrap().awaiting, HashSet::from([4]));
    }

    #[test]
    fn gone_retries_against_a_fresh_sharer_before_exhausting() {
        let mut e = entry(0, DirState::Shared, 0, &[2, 3]);
        let _ = start_round(&mut e, 1, 4, AccessKind::Read, 4096, 0);
        let first_source = e.pending.as_ref().unwrap().source.unwrap();
        let sends = retry_after_gone(&mut e, 1, first_source, 4096);
        assert_eq!(sends.len(), 1);
        assert!(matches!(&sends[0].1, Message::Forward { .. }));
        let pending = e.pending.as_ref().unwrap();
        assert_eq!(pending.retries, 1);
        assert_ne!(pending.source.unwrap(), first_source);
    }

    #[test]
    fn gone_falls_back_to_zero_fill_once_exhausted() {
        let mut e = entry(0, DirState::Shared, 0, &[2]);
        let _ = start_round(&mut e, 1, 4, AccessKind::Read, 4096, 0);
        let pending = e.pending.as_mut().unwrap();
        pending.retries = 2;
        let sends = retry_after_gone(&mut e, 1, 2, 4096);
        assert_eq!(sends.len(), 1);
        assert!(matches!(&sends[0].1, Message::PageData { .. }));
    }
}
