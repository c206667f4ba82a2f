//! State base address (SBA) tracking buffer (`"sbaarea"`).
//!
//! One [`SbaTrackedAddresses`] lives in GPU-visible memory per tracked execution context. The
//! driver (through store commands the command-stream encoder emits) keeps the seven base address
//! fields in sync with what was last programmed into the hardware, so a debugger that stops a
//! thread can rebase the thread's relative addresses.

use core::mem::{offset_of, size_of};

use crate::{check_len, read_magic, read_u64, AbiError};

/// `"sbaarea\0"`.
pub const SBA_TRACKED_ADDRESSES_MAGIC: [u8; 8] = *b"sbaarea\0";
pub const SBA_TRACKED_ADDRESSES_VERSION: u8 = 0;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbaTrackedAddresses {
    pub magic: [u8; 8],
    pub reserved0: u64,
    pub version: u8,
    pub reserved1: [u8; 7],
    pub general_state_base: u64,
    pub surface_state_base: u64,
    pub dynamic_state_base: u64,
    pub indirect_object_base: u64,
    pub instruction_base: u64,
    pub bindless_surface_state_base: u64,
    pub bindless_sampler_state_base: u64,
}

const _: () = {
    assert!(size_of::<SbaTrackedAddresses>() == SbaTrackedAddresses::SIZE_BYTES);
    assert!(offset_of!(SbaTrackedAddresses, version) == 16);
    assert!(offset_of!(SbaTrackedAddresses, general_state_base) == 24);
    assert!(offset_of!(SbaTrackedAddresses, bindless_sampler_state_base) == 72);
};

/// One of the seven tracked base addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SbaField {
    GeneralState,
    SurfaceState,
    DynamicState,
    IndirectObject,
    Instruction,
    BindlessSurfaceState,
    BindlessSamplerState,
}

impl SbaField {
    pub const ALL: [SbaField; 7] = [
        SbaField::GeneralState,
        SbaField::SurfaceState,
        SbaField::DynamicState,
        SbaField::IndirectObject,
        SbaField::Instruction,
        SbaField::BindlessSurfaceState,
        SbaField::BindlessSamplerState,
    ];

    /// Byte offset of the field inside [`SbaTrackedAddresses`].
    pub const fn offset(self) -> usize {
        match self {
            SbaField::GeneralState => offset_of!(SbaTrackedAddresses, general_state_base),
            SbaField::SurfaceState => offset_of!(SbaTrackedAddresses, surface_state_base),
            SbaField::DynamicState => offset_of!(SbaTrackedAddresses, dynamic_state_base),
            SbaField::IndirectObject => offset_of!(SbaTrackedAddresses, indirect_object_base),
            SbaField::Instruction => offset_of!(SbaTrackedAddresses, instruction_base),
            SbaField::BindlessSurfaceState => {
                offset_of!(SbaTrackedAddresses, bindless_surface_state_base)
            }
            SbaField::BindlessSamplerState => {
                offset_of!(SbaTrackedAddresses, bindless_sampler_state_base)
            }
        }
    }
}

/// Base addresses the driver is about to program, as handed to the tracking store.
///
/// A zero field means "not programmed by this update".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateBaseAddresses {
    pub general_state: u64,
    pub surface_state: u64,
    pub dynamic_state: u64,
    pub indirect_object: u64,
    pub instruction: u64,
    pub bindless_surface_state: u64,
    pub bindless_sampler_state: u64,
}

impl StateBaseAddresses {
    pub fn get(&self, field: SbaField) -> u64 {
        match field {
            SbaField::GeneralState => self.general_state,
            SbaField::SurfaceState => self.surface_state,
            SbaField::DynamicState => self.dynamic_state,
            SbaField::IndirectObject => self.indirect_object,
            SbaField::Instruction => self.instruction,
            SbaField::BindlessSurfaceState => self.bindless_surface_state,
            SbaField::BindlessSamplerState => self.bindless_sampler_state,
        }
    }

    /// Whether the update carries anything a debugger needs.
    ///
    /// Only general state, surface state and bindless surface state gate the write; an update
    /// with all three zero is treated as carrying no new information.
    pub fn is_worth_tracking(&self) -> bool {
        self.general_state != 0 || self.surface_state != 0 || self.bindless_surface_state != 0
    }

    /// Non-zero fields with their offsets into the tracking buffer, in layout order.
    pub fn programmed_fields(&self) -> impl Iterator<Item = (SbaField, u64)> + '_ {
        SbaField::ALL
            .into_iter()
            .map(|field| (field, self.get(field)))
            .filter(|(_, value)| *value != 0)
    }
}

impl SbaTrackedAddresses {
    pub const SIZE_BYTES: usize = 80;

    /// An empty tracking record with a valid header.
    pub fn new() -> Self {
        Self {
            magic: SBA_TRACKED_ADDRESSES_MAGIC,
            version: SBA_TRACKED_ADDRESSES_VERSION,
            ..Self::default()
        }
    }

    pub fn get(&self, field: SbaField) -> u64 {
        match field {
            SbaField::GeneralState => self.general_state_base,
            SbaField::SurfaceState => self.surface_state_base,
            SbaField::DynamicState => self.dynamic_state_base,
            SbaField::IndirectObject => self.indirect_object_base,
            SbaField::Instruction => self.instruction_base,
            SbaField::BindlessSurfaceState => self.bindless_surface_state_base,
            SbaField::BindlessSamplerState => self.bindless_sampler_state_base,
        }
    }

    pub fn set(&mut self, field: SbaField, value: u64) {
        let slot = match field {
            SbaField::GeneralState => &mut self.general_state_base,
            SbaField::SurfaceState => &mut self.surface_state_base,
            SbaField::DynamicState => &mut self.dynamic_state_base,
            SbaField::IndirectObject => &mut self.indirect_object_base,
            SbaField::Instruction => &mut self.instruction_base,
            SbaField::BindlessSurfaceState => &mut self.bindless_surface_state_base,
            SbaField::BindlessSamplerState => &mut self.bindless_sampler_state_base,
        };
        *slot = value;
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut out = [0u8; Self::SIZE_BYTES];
        out[0..8].copy_from_slice(&self.magic);
        out[8..16].copy_from_slice(&self.reserved0.to_le_bytes());
        out[16] = self.version;
        out[17..24].copy_from_slice(&self.reserved1);
        for field in SbaField::ALL {
            let off = field.offset();
            out[off..off + 8].copy_from_slice(&self.get(field).to_le_bytes());
        }
        out
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, AbiError> {
        check_len(buf, Self::SIZE_BYTES)?;
        let magic = read_magic(buf, SBA_TRACKED_ADDRESSES_MAGIC)?;
        let version = buf[16];
        if version != SBA_TRACKED_ADDRESSES_VERSION {
            return Err(AbiError::UnsupportedVersion {
                found: u32::from(version),
            });
        }
        let mut reserved1 = [0u8; 7];
        reserved1.copy_from_slice(&buf[17..24]);

        let mut out = Self {
            magic,
            reserved0: read_u64(buf, 8),
            version,
            reserved1,
            ..Self::default()
        };
        for field in SbaField::ALL {
            out.set(field, read_u64(buf, field.offset()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_follow_the_header() {
        let offsets: Vec<usize> = SbaField::ALL.iter().map(|f| f.offset()).collect();
        assert_eq!(offsets, vec![24, 32, 40, 48, 56, 64, 72]);
    }

    #[test]
    fn only_gating_fields_make_an_update_worth_tracking() {
        let mut sba = StateBaseAddresses {
            dynamic_state: 0x1000,
            indirect_object: 0x2000,
            instruction: 0x3000,
            bindless_sampler_state: 0x4000,
            ..StateBaseAddresses::default()
        };
        assert!(!sba.is_worth_tracking());

        sba.bindless_surface_state = 0x5000;
        assert!(sba.is_worth_tracking());
    }

    #[test]
    fn programmed_fields_skip_zeroes() {
        let sba = StateBaseAddresses {
            general_state: 0x10,
            instruction: 0x20,
            ..StateBaseAddresses::default()
        };
        let fields: Vec<_> = sba.programmed_fields().collect();
        assert_eq!(
            fields,
            vec![(SbaField::GeneralState, 0x10), (SbaField::Instruction, 0x20)]
        );
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let mut bytes = SbaTrackedAddresses::new().to_le_bytes();
        bytes[16] = 3;
        assert_eq!(
            SbaTrackedAddresses::decode_from_le_bytes(&bytes),
            Err(AbiError::UnsupportedVersion { found: 3 })
        );
    }
}
