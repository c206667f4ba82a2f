//! Module heap debug area header (`"dbgarea"`).
//!
//! The debug area is a single GPU page whose first 32 bytes describe where the debugger may find
//! scratch space for module bookkeeping. The header is written once by the driver and polled by
//! the debugger.

use core::mem::{offset_of, size_of};

use bitflags::bitflags;

use crate::{check_len, read_magic, read_u16, read_u64, AbiError, GPU_PAGE_SIZE_BYTES};

/// `"dbgarea\0"`.
pub const DEBUG_AREA_MAGIC: [u8; 8] = *b"dbgarea\0";
pub const DEBUG_AREA_VERSION: u8 = 1;

bitflags! {
    /// Bits of [`DebugAreaHeader::flags`]. Bits 1..63 are reserved and must be zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugAreaFlags: u64 {
        /// The area is shared by every context on the device (single address space mode).
        const SHARED = 1 << 0;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugAreaHeader {
    pub magic: [u8; 8],
    pub reserved0: u64,
    pub version: u8,
    /// Size of the whole area in GPU pages.
    pub pgsize: u8,
    /// Size of this header in bytes.
    pub size: u8,
    pub reserved1: u8,
    pub scratch_begin: u16,
    pub scratch_end: u16,
    pub flags: u64,
}

pub const DEBUG_AREA_MAGIC_OFFSET: usize = offset_of!(DebugAreaHeader, magic);
pub const DEBUG_AREA_VERSION_OFFSET: usize = offset_of!(DebugAreaHeader, version);
pub const DEBUG_AREA_PGSIZE_OFFSET: usize = offset_of!(DebugAreaHeader, pgsize);
pub const DEBUG_AREA_SIZE_OFFSET: usize = offset_of!(DebugAreaHeader, size);
pub const DEBUG_AREA_SCRATCH_BEGIN_OFFSET: usize = offset_of!(DebugAreaHeader, scratch_begin);
pub const DEBUG_AREA_SCRATCH_END_OFFSET: usize = offset_of!(DebugAreaHeader, scratch_end);
pub const DEBUG_AREA_FLAGS_OFFSET: usize = offset_of!(DebugAreaHeader, flags);

const _: () = {
    assert!(size_of::<DebugAreaHeader>() == DebugAreaHeader::SIZE_BYTES);
    assert!(DEBUG_AREA_VERSION_OFFSET == 16);
    assert!(DEBUG_AREA_SCRATCH_BEGIN_OFFSET == 20);
    assert!(DEBUG_AREA_SCRATCH_END_OFFSET == 22);
    assert!(DEBUG_AREA_FLAGS_OFFSET == 24);
};

impl DebugAreaHeader {
    pub const SIZE_BYTES: usize = 32;

    /// Header for a freshly allocated one-page debug area.
    ///
    /// Scratch space starts right after the header and stops one header-size short of the end of
    /// the page.
    pub fn new(shared: bool) -> Self {
        let size = Self::SIZE_BYTES as u16;
        let flags = if shared {
            DebugAreaFlags::SHARED
        } else {
            DebugAreaFlags::empty()
        };
        Self {
            magic: DEBUG_AREA_MAGIC,
            reserved0: 0,
            version: DEBUG_AREA_VERSION,
            pgsize: 1,
            size: Self::SIZE_BYTES as u8,
            reserved1: 0,
            scratch_begin: size,
            scratch_end: GPU_PAGE_SIZE_BYTES as u16 - size,
            flags: flags.bits(),
        }
    }

    pub fn is_shared(&self) -> bool {
        DebugAreaFlags::from_bits_truncate(self.flags).contains(DebugAreaFlags::SHARED)
    }

    /// Total size of the area this header describes.
    pub fn area_size_bytes(&self) -> u32 {
        u32::from(self.pgsize) * GPU_PAGE_SIZE_BYTES
    }

    pub fn validate(&self) -> Result<(), AbiError> {
        if self.magic != DEBUG_AREA_MAGIC {
            return Err(AbiError::BadMagic {
                found: self.magic,
                expected: DEBUG_AREA_MAGIC,
            });
        }
        if self.version != DEBUG_AREA_VERSION {
            return Err(AbiError::UnsupportedVersion {
                found: u32::from(self.version),
            });
        }
        if usize::from(self.size) != Self::SIZE_BYTES {
            return Err(AbiError::InvalidLayout("debug area header size mismatch"));
        }
        if self.pgsize == 0 {
            return Err(AbiError::InvalidLayout("debug area has zero pages"));
        }
        if self.scratch_begin < u16::from(self.size) {
            return Err(AbiError::InvalidLayout("scratch region overlaps the header"));
        }
        if self.scratch_begin > self.scratch_end {
            return Err(AbiError::InvalidLayout("scratch_begin > scratch_end"));
        }
        if u32::from(self.scratch_end) > self.area_size_bytes() {
            return Err(AbiError::InvalidLayout("scratch_end past the end of the area"));
        }
        if self.flags & !DebugAreaFlags::all().bits() != 0 {
            return Err(AbiError::InvalidLayout("reserved debug area flag bits set"));
        }
        Ok(())
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut out = [0u8; Self::SIZE_BYTES];
        out[0..8].copy_from_slice(&self.magic);
        out[8..16].copy_from_slice(&self.reserved0.to_le_bytes());
        out[16] = self.version;
        out[17] = self.pgsize;
        out[18] = self.size;
        out[19] = self.reserved1;
        out[20..22].copy_from_slice(&self.scratch_begin.to_le_bytes());
        out[22..24].copy_from_slice(&self.scratch_end.to_le_bytes());
        out[24..32].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Decodes and validates a header the way a debugger reading the page would.
    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, AbiError> {
        check_len(buf, Self::SIZE_BYTES)?;
        let magic = read_magic(buf, DEBUG_AREA_MAGIC)?;
        let hdr = Self {
            magic,
            reserved0: read_u64(buf, 8),
            version: buf[16],
            pgsize: buf[17],
            size: buf[18],
            reserved1: buf[19],
            scratch_begin: read_u16(buf, 20),
            scratch_end: read_u16(buf, 22),
            flags: read_u64(buf, 24),
        };
        hdr.validate()?;
        Ok(hdr)
    }
}

impl Default for DebugAreaHeader {
    fn default() -> Self {
        Self::new(false)
    }
}
