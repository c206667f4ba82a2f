//! State save area version header (`"tssarea"`).
//!
//! Prefixes the per-thread register save area so a debugger can locate saved thread state without
//! hardcoding the layout of a particular hardware generation.

use core::mem::{offset_of, size_of};

use crate::{check_len, read_magic, read_u64, AbiError};

/// `"tssarea\0"`.
pub const STATE_SAVE_AREA_MAGIC: [u8; 8] = *b"tssarea\0";

/// Newest major version this crate knows how to describe.
pub const STATE_SAVE_AREA_MAX_MAJOR: u8 = 3;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SaveAreaVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub reserved: u8,
}

impl SaveAreaVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
            reserved: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateSaveAreaHeader {
    pub magic: [u8; 8],
    pub reserved0: u64,
    pub version: SaveAreaVersion,
    /// Size of this header in bytes.
    pub size: u8,
    pub reserved1: [u8; 3],
}

const _: () = {
    assert!(size_of::<SaveAreaVersion>() == 4);
    assert!(size_of::<StateSaveAreaHeader>() == StateSaveAreaHeader::SIZE_BYTES);
    assert!(offset_of!(StateSaveAreaHeader, version) == 16);
    assert!(offset_of!(StateSaveAreaHeader, size) == 20);
};

impl StateSaveAreaHeader {
    pub const SIZE_BYTES: usize = 24;

    pub fn new(version: SaveAreaVersion) -> Self {
        Self {
            magic: STATE_SAVE_AREA_MAGIC,
            reserved0: 0,
            version,
            size: Self::SIZE_BYTES as u8,
            reserved1: [0; 3],
        }
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut out = [0u8; Self::SIZE_BYTES];
        out[0..8].copy_from_slice(&self.magic);
        out[8..16].copy_from_slice(&self.reserved0.to_le_bytes());
        out[16] = self.version.major;
        out[17] = self.version.minor;
        out[18] = self.version.patch;
        out[19] = self.version.reserved;
        out[20] = self.size;
        out[21..24].copy_from_slice(&self.reserved1);
        out
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, AbiError> {
        check_len(buf, Self::SIZE_BYTES)?;
        let magic = read_magic(buf, STATE_SAVE_AREA_MAGIC)?;
        let version = SaveAreaVersion {
            major: buf[16],
            minor: buf[17],
            patch: buf[18],
            reserved: buf[19],
        };
        if version.major == 0 || version.major > STATE_SAVE_AREA_MAX_MAJOR {
            return Err(AbiError::UnsupportedVersion {
                found: u32::from(version.major),
            });
        }
        let size = buf[20];
        if usize::from(size) != Self::SIZE_BYTES {
            return Err(AbiError::InvalidLayout("state save area header size mismatch"));
        }
        let mut reserved1 = [0u8; 3];
        reserved1.copy_from_slice(&buf[21..24]);
        Ok(Self {
            magic,
            reserved0: read_u64(buf, 8),
            version,
            size,
            reserved1,
        })
    }
}
