//! The §7 error taxonomy, formalized as a single `thiserror` enum shared by
//! every component of the coherence engine.

use dsm_proto::{ConfigError, PageIndex, TransportError};
use dsm_vm::VmError;

#[derive(Debug, thiserror::Error)]
pub enum DsmError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error on page {page}: {reason}")]
    Protocol { page: PageIndex, reason: String },

    #[error("allocation error: {0}")]
    Alloc(String),

    #[error("address does not belong to any live DSM allocation")]
    NotDsmMemory,

    #[error("operation attempted after finalize()")]
    Shutdown,

    #[error("virtual memory error: {0}")]
    Vm(#[from] VmError),
}

impl DsmError {
    pub fn protocol(page: PageIndex, reason: impl Into<String>) -> Self {
        DsmError::Protocol {
            page,
            reason: reason.into(),
        }
    }

    /// Protocol and configuration errors are bugs, not recoverable
    /// conditions (§7): the node logs and terminates rather than trying to
    /// carry on with a directory or page table it can no longer trust.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DsmError::Protocol { .. } | DsmError::Config(_))
    }
}
