//! §8 protocol-level test doubles: an in-memory `LoopbackTransport`
//! connecting several simulated "nodes" (threads in one test process) and a
//! `BufferVm` standing in for real `mmap`/`mprotect`/`sigaction`. These let
//! `dsm-core`'s own tests exercise the directory/protocol/page-table state
//! machine exhaustively without forking real OS processes; the heavier
//! process-level scenarios live in `dsm-cli`'s `#[ignore]`-gated tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use dsm_proto::{Message, NodeId, Transport, TransportError};
use dsm_vm::{FaultHandler, FaultOutcome, Protection, VirtualMemory, VmError};

/// Shared registry of per-node inbound channels, standing in for the
/// network. Mirrors `dsm-transport::TcpTransport`'s star-plus-relay
/// topology: every `send` lands directly in the destination's channel, and
/// the manager's `recv` relays on `PageData` not addressed to itself, the
/// same as a real manager socket would.
pub struct LoopbackHub {
    manager: NodeId,
    senders: Mutex<HashMap<NodeId, Sender<Message>>>,
}

impl LoopbackHub {
    pub fn new(manager: NodeId) -> Arc<Self> {
        Arc::new(LoopbackHub {
            manager,
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// Register a simulated node and get back its `Transport` handle.
    pub fn join(self: &Arc<Self>, node: NodeId) -> LoopbackTransport {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.senders.lock().unwrap().insert(node, tx);
        LoopbackTransport {
            local: node,
            manager: self.manager,
            hub: self.clone(),
            rx,
            shut_down: AtomicBool::new(false),
        }
    }
}

pub struct LoopbackTransport {
    local: NodeId,
    manager: NodeId,
    hub: Arc<LoopbackHub>,
    rx: Receiver<Message>,
    shut_down: AtomicBool,
}

impl LoopbackTransport {
    fn is_manager(&self) -> bool {
        self.local == self.manager
    }

    fn route_or_keep(&self, msg: Message) -> Option<Message> {
        if self.is_manager() {
            if let Message::PageData { page, requester, .. } = &msg {
                if *requester != self.local {
                    tracing::debug!(page, requester, "loopback manager relaying PageData");
                    let senders = self.hub.senders.lock().unwrap();
                    if let Some(tx) = senders.get(requester) {
                        let _ = tx.send(msg);
                    }
                    return None;
                }
            }
        }
        Some(msg)
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, to: NodeId, msg: Message) -> Result<(), TransportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::ShutDown);
        }
        let senders = self.hub.senders.lock().unwrap();
        let tx = senders.get(&to).ok_or(TransportError::NoSuchPeer(to))?;
        tx.send(msg).map_err(|_| TransportError::ConnectionLost(to))
    }

    fn recv(&self) -> Result<Message, TransportError> {
        loop {
            let msg = self.rx.recv().map_err(|_| TransportError::ShutDown)?;
            if let Some(msg) = self.route_or_keep(msg) {
                return Ok(msg);
            }
        }
    }

    fn try_recv(&self) -> Result<Option<Message>, TransportError> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if let Some(msg) = self.route_or_keep(msg) {
                        return Ok(Some(msg));
                    }
                }
                Err(crossbeam_channel::TryRecvError::Empty) => return Ok(None),
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    return Err(TransportError::ShutDown)
                }
            }
        }
    }

    fn local_node(&self) -> NodeId {
        self.local
    }

    fn manager_node(&self) -> NodeId {
        self.manager
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

/// Test double for `VirtualMemory`: backs the "reserved range" with real
/// heap memory (so reads/writes to it are valid) but never touches
/// `mprotect`/`sigaction`. Permission requests are only recorded, letting
/// tests assert on them without an OS fault actually firing.
pub struct BufferVm {
    page_size: usize,
    base: Mutex<Option<usize>>,
    prot: Mutex<HashMap<usize, Protection>>,
    handler: Mutex<Option<Arc<dyn FaultHandler>>>,
    installed: AtomicU8,
}

impl BufferVm {
    pub fn new(page_size: usize) -> Self {
        BufferVm {
            page_size,
            base: Mutex::new(None),
            prot: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            installed: AtomicU8::new(0),
        }
    }

    pub fn protection_of(&self, addr: usize) -> Option<Protection> {
        self.prot.lock().unwrap().get(&addr).copied()
    }

    /// Directly invoke the installed handler, simulating a signal trap
    /// without a real `mmap`/`mprotect`/`SIGSEGV` round trip.
    pub fn simulate_fault(&self, addr: usize, kind: dsm_proto::AccessKind) -> FaultOutcome {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(h) => h.handle_fault(addr, kind),
            None => FaultOutcome::NotDsmMemory,
        }
    }
}

impl VirtualMemory for BufferVm {
    fn reserve(&self, n_pages: usize) -> Result<usize, VmError> {
        let len = n_pages * self.page_size;
        let buf = vec![0u8; len].into_boxed_slice();
        let addr = Box::leak(buf).as_mut_ptr() as usize;
        *self.base.lock().unwrap() = Some(addr);
        Ok(addr)
    }

    fn protect(&self, addr: usize, _n_pages: usize, prot: Protection) -> Result<(), VmError> {
        self.prot.lock().unwrap().insert(addr, prot);
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn install_fault_handler(&self, handler: Arc<dyn FaultHandler>) -> Result<(), VmError> {
        if self.installed.swap(1, Ordering::AcqRel) != 0 {
            return Err(VmError::HandlerAlreadyInstalled);
        }
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }
}
