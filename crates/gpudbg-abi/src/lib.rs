//! Binary layouts shared between the driver, the kernel and an attached debugger.
//!
//! Everything in this crate is bit-exact: the structs below are written by the driver (or the
//! GPU) into GPU-visible memory and read by an external debugger process through OS-level memory
//! inspection. There is no negotiation handshake; the `magic` and `version` fields at the start of
//! every header are the only compatibility mechanism, so decoders always check them before
//! trusting anything that follows.
//!
//! The crate also carries the decoder for the kernel's bit-packed topology query blob, which is
//! the other compact format the debug subsystem has to understand.
#![forbid(unsafe_code)]

pub mod debug_area;
pub mod sba;
pub mod state_save_area;
pub mod topology;

pub use debug_area::{DebugAreaFlags, DebugAreaHeader, DEBUG_AREA_MAGIC, DEBUG_AREA_VERSION};
pub use sba::{
    SbaField, SbaTrackedAddresses, StateBaseAddresses, SBA_TRACKED_ADDRESSES_MAGIC,
    SBA_TRACKED_ADDRESSES_VERSION,
};
pub use state_save_area::{SaveAreaVersion, StateSaveAreaHeader, STATE_SAVE_AREA_MAGIC};
pub use topology::{decode_topology, TopologyCounts, TopologyError, TopologyInfo, TopologyMapping};

/// GPU page size assumed by the debug area layout.
pub const GPU_PAGE_SIZE_BYTES: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("bad magic {found:02x?} (expected {expected:02x?})")]
    BadMagic { found: [u8; 8], expected: [u8; 8] },

    #[error("unsupported layout version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("invalid layout: {0}")]
    InvalidLayout(&'static str),
}

fn check_len(buf: &[u8], need: usize) -> Result<(), AbiError> {
    if buf.len() < need {
        return Err(AbiError::BufferTooSmall {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}

fn read_magic(buf: &[u8], expected: [u8; 8]) -> Result<[u8; 8], AbiError> {
    let mut found = [0u8; 8];
    found.copy_from_slice(&buf[0..8]);
    if found != expected {
        return Err(AbiError::BadMagic { found, expected });
    }
    Ok(found)
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}
