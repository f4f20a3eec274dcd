//! The `dsm` facade: the Application API of §6, wiring the generic
//! coherence engine in `dsm-core` to the real collaborators — `PosixVm` for
//! virtual memory and `TcpTransport` for the network — and installing the
//! global `tracing` subscriber each process needs exactly once.
//!
//! ```no_run
//! use dsm::Dsm;
//! use dsm_proto::Config;
//!
//! let cfg = Config { node_id: 0, num_nodes: 1, is_manager: true, ..Config::default() };
//! let handle = Dsm::init(cfg).expect("init");
//! let addr = handle.alloc(4096).expect("alloc");
//! handle.finalize().expect("finalize");
//! ```

pub use dsm_core::{AllocError, DsmError, StatsSnapshot};
pub use dsm_proto::{Config, ConfigError};
pub use dsm_vm::Protection;

use std::sync::Arc;

use dsm_core::Engine;
use dsm_transport::TcpTransport;
use dsm_vm::{PosixVm, VirtualMemory};

/// A live node handle: the result of `Dsm::init`. Dropping it does not tear
/// the node down — call `finalize()` explicitly, matching §5's collective
/// shutdown contract.
pub struct Dsm {
    engine: Arc<Engine<PosixVm, TcpTransport>>,
}

fn install_tracing(log_level: u8) {
    use tracing_subscriber::filter::LevelFilter;
    let level = match log_level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::DEBUG,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

impl Dsm {
    /// Validate `config`, bring up the real `PosixVm`/`TcpTransport`
    /// collaborators, bootstrap the cluster (manager binds and awaits
    /// `num_nodes - 1` peers; non-managers dial with bounded retry), and
    /// return a handle once coherence is ready to serve faults.
    pub fn init(config: Config) -> Result<Self, DsmError> {
        install_tracing(config.log_level);
        tracing::info!(
            node_id = config.node_id,
            num_nodes = config.num_nodes,
            is_manager = config.is_manager,
            "initializing DSM node"
        );

        let vm = Arc::new(PosixVm::new());
        let page_size = vm.page_size();
        config.validate(page_size)?;

        let transport = Arc::new(TcpTransport::bootstrap(&config, page_size)?);
        let engine = Engine::new(config, vm, transport)?;
        Ok(Dsm { engine })
    }

    /// Collective: reserve `n_bytes` (rounded up to whole pages), identical
    /// virtual address returned on every node.
    pub fn alloc(&self, n_bytes: usize) -> Result<usize, DsmError> {
        self.engine.alloc(n_bytes)
    }

    /// Collective: release a previous `alloc`'s range.
    pub fn free(&self, addr: usize) -> Result<(), DsmError> {
        self.engine.free(addr)
    }

    /// Collective release-consistency barrier.
    pub fn barrier(&self) -> Result<(), DsmError> {
        self.engine.barrier()
    }

    /// Acquire a named lock, implicitly an acquire fence.
    pub fn lock_acquire(&self, lock_id: u64) -> Result<(), DsmError> {
        self.engine.lock_acquire(lock_id)
    }

    /// Release a named lock, implicitly a release fence.
    pub fn lock_release(&self, lock_id: u64) -> Result<(), DsmError> {
        self.engine.lock_release(lock_id)
    }

    /// Point-in-time snapshot of the observable counters of §6.
    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats()
    }

    pub fn page_size(&self) -> usize {
        self.engine.page_size()
    }

    pub fn local_node(&self) -> dsm_proto::NodeId {
        self.engine.local_node()
    }

    /// Collective shutdown: stop accepting new faults, notify the manager,
    /// tear down the transport, and join background threads. Idempotent.
    pub fn finalize(&self) -> Result<(), DsmError> {
        self.engine.finalize()
    }
}
