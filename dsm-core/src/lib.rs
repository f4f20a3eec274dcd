//! The DSM coherence engine (§2): trap handling, page table,
//! directory, coherence protocol FSM, and the barrier/lock primitives,
//! generic over the [`VirtualMemory`] and [`Transport`] collaborator
//! traits so the whole state machine can be exercised against in-memory
//! test doubles (see [`testing`]) as well as the real `dsm-vm`/
//! `dsm-transport` implementations the `dsm` facade crate wires up.

mod alloc;
mod directory;
mod error;
mod page_table;
mod protocol;
mod stats;
mod sync;
pub mod testing;

pub use alloc::AllocError;
pub use error::DsmError;
pub use stats::StatsSnapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dsm_proto::{AccessKind, Config, Message, NodeId, PageIndex, Transport};
use dsm_vm::{FaultHandler, FaultOutcome, Protection, VirtualMemory};

use alloc::Allocator;
use directory::Directory;
use page_table::PageTable;
use stats::Stats;
use sync::{flush_modified_pages_before_barrier, BarrierCoordinator, LockCoordinator};

/// Number of pages reserved in the single virtual range every node sets up
/// identically at `init` (§3): large enough for demonstration
/// workloads, reserved with no backing so it costs no physical memory until
/// touched.
pub const ARENA_PAGES: usize = 1 << 16;

/// How often the manager's retry-sweep thread scans for rounds that have
/// outlived `Config::protocol_timeout` (§9).
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_millis(200);

pub struct Engine<V: VirtualMemory, T: Transport> {
    config: Config,
    vm: Arc<V>,
    transport: Arc<T>,
    page_table: PageTable,
    directory: Option<Directory>,
    allocator: Mutex<Allocator>,
    stats: Stats,
    barrier: BarrierCoordinator,
    locks: LockCoordinator,
    base_addr: usize,
    page_size: usize,
    shutting_down: AtomicBool,
    reactor: Mutex<Option<JoinHandle<()>>>,
    retry_sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V, T> Engine<V, T>
where
    V: VirtualMemory + 'static,
    T: Transport + 'static,
{
    /// Validate `config`, reserve the shared arena, install the fault
    /// handler, and start the per-node reactor thread (§4.0/§5).
    /// `transport` must already be bootstrapped (connected to the rest of
    /// the cluster) — `dsm-core` only depends on the `Transport` trait, not
    /// on how a concrete implementation gets connected.
    pub fn new(config: Config, vm: Arc<V>, transport: Arc<T>) -> Result<Arc<Self>, DsmError> {
        config.validate(vm.page_size())?;
        let page_size = vm.page_size();
        let base_addr = vm.reserve(ARENA_PAGES)?;
        let home = transport.local_node();
        let is_manager = config.is_manager;

        let engine = Arc::new(Engine {
            directory: is_manager.then(|| Directory::new(home)),
            barrier: BarrierCoordinator::new(is_manager),
            locks: LockCoordinator::new(is_manager),
            page_table: PageTable::new(),
            allocator: Mutex::new(Allocator::new(ARENA_PAGES)),
            stats: Stats::new(),
            base_addr,
            page_size,
            shutting_down: AtomicBool::new(false),
            reactor: Mutex::new(None),
            retry_sweeper: Mutex::new(None),
            config,
            vm,
            transport,
        });

        let handler: Arc<dyn FaultHandler> = engine.clone();
        engine.vm.install_fault_handler(handler)?;

        let reactor_engine = engine.clone();
        let reactor = std::thread::Builder::new()
            .name("dsm-reactor".into())
            .spawn(move || reactor_engine.reactor_loop())
            .expect("failed to spawn the dsm reactor thread");
        *engine.reactor.lock().unwrap() = Some(reactor);

        if is_manager {
            let sweeper_engine = engine.clone();
            let sweeper = std::thread::Builder::new()
                .name("dsm-retry-sweep".into())
                .spawn(move || sweeper_engine.retry_sweep_loop())
                .expect("failed to spawn the dsm retry-sweep thread");
            *engine.retry_sweeper.lock().unwrap() = Some(sweeper);
        }

        Ok(engine)
    }

    fn reactor_loop(self: Arc<Self>) {
        loop {
            match self.transport.recv() {
                Ok(msg) => {
                    if let Err(e) = self.handle_message(msg) {
                        if e.is_fatal() {
                            tracing::error!(error = %e, "fatal error in reactor, terminating node");
                            std::process::abort();
                        } else {
                            tracing::warn!(error = %e, "recoverable error handling inbound message");
                        }
                    }
                }
                Err(dsm_proto::TransportError::ShutDown) => break,
                Err(e) => {
                    tracing::error!(error = %e, "transport failure in reactor, terminating node");
                    std::process::abort();
                }
            }
        }
    }

    /// Manager-only: periodically checks for directory rounds that have
    /// outlived `protocol_timeout` with no reply (a `Forward` target that
    /// vanished silently rather than replying `Gone`) and forces the same
    /// bounded-retry path `Gone` triggers.
    fn retry_sweep_loop(self: Arc<Self>) {
        while !self.shutting_down.load(Ordering::Acquire) {
            std::thread::sleep(RETRY_SWEEP_INTERVAL);
            let Some(dir) = &self.directory else { return };
            for page in dir.expired_rounds(self.config.protocol_timeout) {
                let source = dir.with_entry(page, |entry| entry.pending.as_ref().and_then(|p| p.source));
                if let Some(Some(from)) = source {
                    tracing::warn!(page, from, "protocol round timed out, forcing retry");
                    let _ = self.handle_message(Message::Gone { page, from });
                }
            }
        }
    }

    fn addr_of(&self, page: PageIndex) -> usize {
        self.base_addr + (page as usize) * self.page_size
    }

    fn page_index_for_addr(&self, addr: usize) -> Option<PageIndex> {
        if addr < self.base_addr {
            return None;
        }
        let offset = addr - self.base_addr;
        if offset >= ARENA_PAGES * self.page_size {
            return None;
        }
        let idx = (offset / self.page_size) as PageIndex;
        self.page_table.contains(idx).then_some(idx)
    }

    /// Copies `page_size` bytes out of this node's own mapping. Valid
    /// whenever the local state is `Shared` or `Modified` (the only states
    /// from which this is ever called).
    fn read_local_page_bytes(&self, page: PageIndex) -> Vec<u8> {
        let addr = self.addr_of(page);
        let mut buf = vec![0u8; self.page_size];
        // SAFETY: `addr` lies within the reserved arena and the caller has
        // checked the page is locally `Shared`/`Modified`, so the OS mapping
        // is at least readable here.
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), self.page_size) };
        buf
    }

    fn write_local_page_bytes(&self, page: PageIndex, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.page_size);
        let addr = self.addr_of(page);
        // SAFETY: `addr` lies within the reserved arena; the page is about
        // to be (re)protected for at least read access right after this by
        // the caller, and nothing else observes it mid-write because the
        // page is still `InTransit` until `PageSlot::complete` runs.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, self.page_size) };
    }

    /// The core fault-resolution path (§4.1), callable directly by
    /// protocol-level tests without going through a real signal trap.
    pub fn service_fault(&self, page: PageIndex, kind: AccessKind) -> Result<(), DsmError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DsmError::Shutdown);
        }
        let slot = self.page_table.get(page).ok_or(DsmError::NotDsmMemory)?;

        if slot.state().permits(kind) {
            return Ok(());
        }

        let start = Instant::now();
        let am_initiator = slot.begin_transit(kind);
        if am_initiator {
            let local = self.transport.local_node();
            let manager = self.transport.manager_node();
            let msg = match kind {
                AccessKind::Read => Message::ReadReq { page, requester: local },
                AccessKind::Write => Message::WriteReq { page, requester: local },
            };
            if let Err(e) = self.transport.send(manager, msg) {
                slot.fail(e.to_string());
                return Err(e.into());
            }
        }

        slot.wait_for_completion()?;

        if am_initiator {
            self.stats.record_fault(matches!(kind, AccessKind::Write));
            self.stats.record_fault_latency(start.elapsed());
        }
        Ok(())
    }

    /// Collective: reserve `n_bytes` (rounded up to whole pages) and return
    /// the base virtual address, identical on every node (§3/§6).
    pub fn alloc(&self, n_bytes: usize) -> Result<usize, DsmError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DsmError::Shutdown);
        }
        let n_pages = (n_bytes + self.page_size - 1) / self.page_size;
        let base = {
            let mut a = self.allocator.lock().unwrap();
            a.alloc(n_pages).map_err(|e| DsmError::Alloc(e.to_string()))?
        };
        for p in base..base + n_pages as u64 {
            self.page_table.insert(p);
            if let Some(dir) = &self.directory {
                dir.insert(p);
            }
            self.vm.protect(self.addr_of(p), 1, Protection::None)?;
        }
        tracing::info!(base, n_pages, "allocated");
        Ok(self.addr_of(base))
    }

    /// Collective: release a previous `alloc`'s virtual range.
    pub fn free(&self, addr: usize) -> Result<(), DsmError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DsmError::Shutdown);
        }
        if addr < self.base_addr {
            return Err(DsmError::Alloc(format!("{addr:#x} is outside the DSM arena")));
        }
        let base = ((addr - self.base_addr) / self.page_size) as PageIndex;
        let n_pages = {
            let mut a = self.allocator.lock().unwrap();
            a.free(base).map_err(|e| DsmError::Alloc(e.to_string()))?
        };
        for p in base..base + n_pages as u64 {
            self.page_table.remove(p);
            if let Some(dir) = &self.directory {
                dir.remove(p);
            }
            self.vm.protect(self.addr_of(p), 1, Protection::None)?;
        }
        tracing::info!(base, n_pages, "freed");
        Ok(())
    }

    /// Collective release-consistency barrier (§4.5).
    pub fn barrier(&self) -> Result<(), DsmError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DsmError::Shutdown);
        }
        flush_modified_pages_before_barrier();
        let epoch = self.barrier.next_epoch_to_enter();
        let local = self.transport.local_node();
        let manager = self.transport.manager_node();
        self.transport.send(manager, Message::BarrierEnter { epoch, from: local })?;
        self.barrier.wait_for_release(epoch);
        Ok(())
    }

    /// Named-lock acquire; implicitly an acquire fence (§4.5).
    pub fn lock_acquire(&self, lock_id: u64) -> Result<(), DsmError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DsmError::Shutdown);
        }
        let ticket = self.locks.next_ticket(lock_id);
        let local = self.transport.local_node();
        let manager = self.transport.manager_node();
        self.transport.send(manager, Message::LockReq { lock_id, from: local })?;
        self.locks.wait_for_grant(lock_id, ticket);
        Ok(())
    }

    /// Named-lock release; implicitly a release fence (§4.5).
    pub fn lock_release(&self, lock_id: u64) -> Result<(), DsmError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DsmError::Shutdown);
        }
        let local = self.transport.local_node();
        let manager = self.transport.manager_node();
        self.transport.send(manager, Message::LockRel { lock_id, from: local })?;
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn local_node(&self) -> NodeId {
        self.transport.local_node()
    }

    /// Collective shutdown (§5 "Cancellation"): stop accepting new faults,
    /// notify the manager, tear down the transport, and join the
    /// background threads. Idempotent.
    pub fn finalize(&self) -> Result<(), DsmError> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let local = self.transport.local_node();
        let manager = self.transport.manager_node();
        let _ = self.transport.send(manager, Message::Leave { from: local });
        self.transport.shutdown();
        if let Some(h) = self.reactor.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.retry_sweeper.lock().unwrap().take() {
            let _ = h.join();
        }
        Ok(())
    }
}

impl<V, T> FaultHandler for Engine<V, T>
where
    V: VirtualMemory + 'static,
    T: Transport + 'static,
{
    fn handle_fault(&self, addr: usize, kind: AccessKind) -> FaultOutcome {
        let Some(page) = self.page_index_for_addr(addr) else {
            return FaultOutcome::NotDsmMemory;
        };
        match self.service_fault(page, kind) {
            Ok(()) => FaultOutcome::Resolved,
            Err(e) => {
                // §7: "abort if the platform cannot deliver the error" — a
                // `FaultOutcome` has no error variant to hand the signal
                // trampoline, so a faulting access that cannot be resolved
                // terminates the process rather than resuming into
                // undefined state.
                tracing::error!(error = %e, page, "fault could not be resolved, aborting");
                std::process::abort();
            }
        }
    }
}
