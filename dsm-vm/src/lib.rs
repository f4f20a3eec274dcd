//! Virtual memory collaborator.
//!
//! Reserves a virtual range without backing, changes per-page permissions
//! among `{none, read, read-write}`, and installs a process-wide `SIGSEGV`
//! handler that classifies a fault's address and access kind before handing
//! it to whatever [`FaultHandler`] the core registered. This is the only
//! crate in the workspace allowed to touch raw signal/mmap plumbing; the
//! coherence engine in `dsm-core` only ever sees the `VirtualMemory` trait.

use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use dsm_proto::AccessKind;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("mmap reservation failed: {0}")]
    Reserve(#[source] nix::Error),
    #[error("mprotect failed for addr {addr:#x} len {len}: {source}")]
    Protect {
        addr: usize,
        len: usize,
        #[source]
        source: nix::Error,
    },
    #[error("sigaction installation failed: {0}")]
    Sigaction(#[source] nix::Error),
    #[error("a fault handler is already installed for this process")]
    HandlerAlreadyInstalled,
}

/// Requested page permissions, mirroring the page table's local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

impl Protection {
    fn to_prot_flags(self) -> nix::sys::mman::ProtFlags {
        use nix::sys::mman::ProtFlags;
        match self {
            Protection::None => ProtFlags::PROT_NONE,
            Protection::Read => ProtFlags::PROT_READ,
            Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }
}

/// Outcome a [`FaultHandler`] returns for a trapped access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The coherence engine installed the page; retry the instruction.
    Resolved,
    /// The address does not belong to any live DSM allocation; the default
    /// segmentation-violation behavior should apply (§4.1).
    NotDsmMemory,
}

/// Callback the core registers to classify and service a trapped access.
///
/// Invoked directly from signal-handler context, in keeping with the
/// established practice in this style of page-based DSM runtime (TreadMarks,
/// Ivy): the faulting thread blocks *inside* the handler until the page
/// arrives, rather than returning immediately and re-entering later. All
/// synchronization reachable from here must avoid allocating or touching
/// non-reentrant libc state.
pub trait FaultHandler: Send + Sync {
    fn handle_fault(&self, addr: usize, kind: AccessKind) -> FaultOutcome;
}

/// The interface the coherence engine depends on; `dsm-core` is generic over
/// this trait so its tests can run against an in-memory double instead of
/// real `mmap`/`sigaction`.
pub trait VirtualMemory: Send + Sync {
    /// Reserve `n_pages` contiguous pages with no backing and no access.
    /// Returns the base virtual address, identical across nodes by
    /// construction (every node reserves the same size at the same point in
    /// `init`, per the allocator design of §3).
    fn reserve(&self, n_pages: usize) -> Result<usize, VmError>;

    /// Change permissions on `[addr, addr + n_pages * page_size)`.
    fn protect(&self, addr: usize, n_pages: usize, prot: Protection) -> Result<(), VmError>;

    /// Host virtual-memory page size.
    fn page_size(&self) -> usize;

    /// Install the process-wide fault handler. Must be called at most once.
    fn install_fault_handler(&self, handler: std::sync::Arc<dyn FaultHandler>)
        -> Result<(), VmError>;
}

/// Real POSIX virtual memory collaborator (Linux/x86_64 and aarch64).
pub struct PosixVm {
    page_size: usize,
}

impl Default for PosixVm {
    fn default() -> Self {
        Self::new()
    }
}

impl PosixVm {
    pub fn new() -> Self {
        PosixVm {
            page_size: host_page_size(),
        }
    }
}

/// Query the host's virtual-memory page size (`sysconf(_SC_PAGESIZE)`).
pub fn host_page_size() -> usize {
    // Safety: sysconf with _SC_PAGESIZE has no preconditions and never
    // returns a value requiring validation beyond the documented >0 case.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

impl VirtualMemory for PosixVm {
    fn reserve(&self, n_pages: usize) -> Result<usize, VmError> {
        use nix::sys::mman::{mmap, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;
        use std::os::fd::BorrowedFd;

        let len = n_pages
            .checked_mul(self.page_size)
            .expect("reservation size overflow");
        let len = NonZeroUsize::new(len).expect("cannot reserve zero pages");

        // SAFETY: MAP_ANONYMOUS | MAP_NORESERVE with PROT_NONE reserves
        // address space without committing backing memory; no existing
        // mapping is touched since we pass no hint address.
        let addr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
                None::<BorrowedFd>,
                0,
            )
        }
        .map_err(VmError::Reserve)?;

        Ok(addr as usize)
    }

    fn protect(&self, addr: usize, n_pages: usize, prot: Protection) -> Result<(), VmError> {
        use nix::sys::mman::mprotect;
        let len = n_pages * self.page_size;
        // SAFETY: caller guarantees `addr` came from a prior `reserve` call
        // on this same `PosixVm` and that `[addr, addr+len)` lies within it.
        unsafe { mprotect(addr as *mut c_void, len, prot.to_prot_flags()) }
            .map_err(|source| VmError::Protect { addr, len, source })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn install_fault_handler(
        &self,
        handler: std::sync::Arc<dyn FaultHandler>,
    ) -> Result<(), VmError> {
        install_global_handler(handler)
    }
}

static HANDLER: OnceLock<std::sync::Arc<dyn FaultHandler>> = OnceLock::new();
static HANDLER_INSTALLED: AtomicUsize = AtomicUsize::new(0);

fn install_global_handler(handler: std::sync::Arc<dyn FaultHandler>) -> Result<(), VmError> {
    if HANDLER_INSTALLED.swap(1, Ordering::AcqRel) != 0 {
        return Err(VmError::HandlerAlreadyInstalled);
    }
    HANDLER
        .set(handler)
        .unwrap_or_else(|_| panic!("fault handler set twice despite the installed guard"));

    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::SigAction(trampoline),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    // SAFETY: `trampoline` only reads from the provided siginfo/ucontext and
    // calls into the registered `FaultHandler`, matching the documented
    // contract of `sigaction`.
    unsafe { sigaction(Signal::SIGSEGV, &action) }.map_err(VmError::Sigaction)?;
    Ok(())
}

extern "C" fn trampoline(_sig: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    // SAFETY: the kernel guarantees `info` is a valid siginfo_t for the
    // duration of the handler.
    let addr = unsafe { (*info).si_addr() } as usize;
    let kind = classify_access(ctx);

    let outcome = HANDLER
        .get()
        .map(|h| h.handle_fault(addr, kind))
        .unwrap_or(FaultOutcome::NotDsmMemory);

    if outcome == FaultOutcome::NotDsmMemory {
        // Restore default disposition and re-raise so the process dies the
        // way it would have without us in the loop (§4.1: "propagate
        // unmodified").
        unsafe {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
            libc::raise(libc::SIGSEGV);
        }
    }
}

/// Inspects the trap frame's error code to tell a read fault from a write
/// fault. Linux x86_64: `uc_mcontext.gregs[REG_ERR]` bit 1 is the write bit.
/// aarch64: the ESR_EL1 instruction-specific syndrome's WnR bit, exposed the
/// same way via `uc_mcontext.fault_address`/`.esr` on recent glibc.
#[cfg(target_arch = "x86_64")]
fn classify_access(ctx: *mut c_void) -> AccessKind {
    const REG_ERR: usize = 19; // index into gregs[], per <sys/ucontext.h>
    if ctx.is_null() {
        return AccessKind::Read;
    }
    // SAFETY: ctx is the ucontext_t* the kernel passed to our SA_SIGINFO
    // handler; reading a single greg slot is within its documented layout.
    let ucontext = ctx as *const libc::ucontext_t;
    let err = unsafe { (*ucontext).uc_mcontext.gregs[REG_ERR] };
    if err & 0x2 != 0 {
        AccessKind::Write
    } else {
        AccessKind::Read
    }
}

#[cfg(target_arch = "aarch64")]
fn classify_access(ctx: *mut c_void) -> AccessKind {
    if ctx.is_null() {
        return AccessKind::Read;
    }
    // SAFETY: same contract as the x86_64 arm above; ESR_EL1 bit 6 (WnR) is
    // carried in the fault_address/esr pair on the Linux aarch64 ABI.
    let ucontext = ctx as *const libc::ucontext_t;
    let esr = unsafe { (*ucontext).uc_mcontext.fault_address };
    if esr & (1 << 6) != 0 {
        AccessKind::Write
    } else {
        AccessKind::Read
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn classify_access(_ctx: *mut c_void) -> AccessKind {
    AccessKind::Read
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_page_size_is_sane() {
        let sz = host_page_size();
        assert!(sz >= 4096);
        assert!(sz.is_power_of_two());
    }

    #[test]
    fn reserve_and_protect_roundtrip() {
        let vm = PosixVm::new();
        let base = vm.reserve(4).expect("reserve");
        assert_ne!(base, 0);
        vm.protect(base, 4, Protection::ReadWrite).expect("rw");
        // SAFETY: just reserved+protected this exact range above.
        unsafe {
            let ptr = base as *mut u8;
            *ptr = 7;
            assert_eq!(*ptr, 7);
        }
        vm.protect(base, 4, Protection::None).expect("none");
    }
}
