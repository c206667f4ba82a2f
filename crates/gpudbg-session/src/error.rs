use gpudbg_abi::{AbiError, TopologyError};
use thiserror::Error;

use crate::memory::MemoryError;
use crate::registrar::RegistrarError;
use crate::ContextId;

pub type Result<T> = std::result::Result<T, DebuggerError>;

/// Errors surfaced by the debug subsystem.
///
/// Only allocation failures, lookups of contexts that were never set up and malformed kernel
/// data are reported. Missing kernel support is [`DebuggerError::Unsupported`] and callers are
/// expected to carry on without the feature.
#[derive(Debug, Error)]
pub enum DebuggerError {
    #[error("failed to allocate {size_bytes}-byte debug buffer: {source}")]
    AllocationFailure {
        size_bytes: u64,
        #[source]
        source: MemoryError,
    },

    #[error("no tracking buffer for context {0}")]
    NotFound(ContextId),

    #[error("debug registration unavailable: {0}")]
    Unsupported(&'static str),

    #[error("kernel rejected {class} registration")]
    RegistrationRejected { class: &'static str },

    #[error("tracking buffer access failed: {0}")]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Abi(#[from] AbiError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl From<RegistrarError> for DebuggerError {
    fn from(err: RegistrarError) -> Self {
        match err {
            RegistrarError::Unsupported => DebuggerError::Unsupported("no kernel registration channel"),
            RegistrarError::Rejected(class) => DebuggerError::RegistrationRejected { class: class.name() },
        }
    }
}
