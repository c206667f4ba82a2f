//! Decoder for the kernel's bit-packed topology query blob.
//!
//! Layout (matches `drm_i915_query_topology_info`): a 16-byte header of eight little-endian `u16`
//! fields followed by `data`:
//!
//! - slice enable bits at the start of `data` (bit `s` of byte `s / 8`),
//! - subslice enable bits for slice `s` at `subslice_offset + s * subslice_stride`,
//! - EU enable bits for `(s, ss)` at `eu_offset + (s * max_subslices + ss) * eu_stride`.

use crate::{check_len, read_u16, AbiError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("topology blob truncated: byte {offset} outside {len}-byte data")]
    Truncated { offset: usize, len: usize },

    /// Slices, subslices or EUs decoded to zero. No real part reports that, so the blob is
    /// treated as malformed rather than as an empty device.
    #[error("topology reports no enabled slices, subslices or EUs")]
    NoEnabledUnits,

    #[error("topology layout field {field} = {value} does not fit the 16-bit header")]
    LayoutOverflow { field: &'static str, value: usize },

    #[error(transparent)]
    Abi(#[from] AbiError),
}

fn header_u16(field: &'static str, value: usize) -> Result<u16, TopologyError> {
    u16::try_from(value).map_err(|_| TopologyError::LayoutOverflow { field, value })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyInfo {
    pub flags: u16,
    pub max_slices: u16,
    /// Subslices per slice.
    pub max_subslices: u16,
    pub max_eus_per_subslice: u16,
    pub subslice_offset: u16,
    pub subslice_stride: u16,
    pub eu_offset: u16,
    pub eu_stride: u16,
    pub data: Vec<u8>,
}

impl TopologyInfo {
    pub const HEADER_SIZE_BYTES: usize = 16;

    /// Builds a blob from per-unit enable flags, packing them with the kernel's strides.
    ///
    /// `slices[s]` enables slice `s`; `subslices[s * max_subslices + ss]` enables a subslice;
    /// `eus[(s * max_subslices + ss) * max_eus + eu]` enables an EU. Missing trailing entries
    /// count as disabled. Fails when an offset or stride does not fit the 16-bit header.
    pub fn from_flat_masks(
        max_slices: u16,
        max_subslices: u16,
        max_eus_per_subslice: u16,
        slices: &[bool],
        subslices: &[bool],
        eus: &[bool],
    ) -> Result<Self, TopologyError> {
        let slice_bytes = usize::from(max_slices).div_ceil(8);
        let subslice_stride = usize::from(max_subslices).div_ceil(8);
        let eu_stride = usize::from(max_eus_per_subslice).div_ceil(8);
        let subslice_offset = slice_bytes;
        let eu_offset = subslice_offset + usize::from(max_slices) * subslice_stride;
        let total_subslices = usize::from(max_slices) * usize::from(max_subslices);
        let len = eu_offset + total_subslices * eu_stride;

        let header = (
            header_u16("subslice_offset", subslice_offset)?,
            header_u16("subslice_stride", subslice_stride)?,
            header_u16("eu_offset", eu_offset)?,
            header_u16("eu_stride", eu_stride)?,
        );

        let mut data = vec![0u8; len];
        let mut set = |byte: usize, bit: usize| data[byte] |= 1 << bit;

        for s in 0..usize::from(max_slices) {
            if slices.get(s).copied().unwrap_or(false) {
                set(s / 8, s % 8);
            }
            for ss in 0..usize::from(max_subslices) {
                let flat_ss = s * usize::from(max_subslices) + ss;
                if subslices.get(flat_ss).copied().unwrap_or(false) {
                    set(subslice_offset + s * subslice_stride + ss / 8, ss % 8);
                }
                for eu in 0..usize::from(max_eus_per_subslice) {
                    let flat_eu = flat_ss * usize::from(max_eus_per_subslice) + eu;
                    if eus.get(flat_eu).copied().unwrap_or(false) {
                        set(eu_offset + flat_ss * eu_stride + eu / 8, eu % 8);
                    }
                }
            }
        }

        let (subslice_offset, subslice_stride, eu_offset, eu_stride) = header;
        Ok(Self {
            flags: 0,
            max_slices,
            max_subslices,
            max_eus_per_subslice,
            subslice_offset,
            subslice_stride,
            eu_offset,
            eu_stride,
            data,
        })
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, AbiError> {
        check_len(buf, Self::HEADER_SIZE_BYTES)?;
        Ok(Self {
            flags: read_u16(buf, 0),
            max_slices: read_u16(buf, 2),
            max_subslices: read_u16(buf, 4),
            max_eus_per_subslice: read_u16(buf, 6),
            subslice_offset: read_u16(buf, 8),
            subslice_stride: read_u16(buf, 10),
            eu_offset: read_u16(buf, 12),
            eu_stride: read_u16(buf, 14),
            data: buf[Self::HEADER_SIZE_BYTES..].to_vec(),
        })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_SIZE_BYTES + self.data.len());
        for v in [
            self.flags,
            self.max_slices,
            self.max_subslices,
            self.max_eus_per_subslice,
            self.subslice_offset,
            self.subslice_stride,
            self.eu_offset,
            self.eu_stride,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    fn bit(&self, byte: usize, bit: usize) -> Result<bool, TopologyError> {
        let value = self.data.get(byte).ok_or(TopologyError::Truncated {
            offset: byte,
            len: self.data.len(),
        })?;
        Ok(value & (1 << bit) != 0)
    }
}

/// Enabled slice indices, and subslice indices when exactly one slice is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyMapping {
    pub slice_indices: Vec<u32>,
    pub subslice_indices: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyCounts {
    pub slices: u32,
    pub subslices: u32,
    pub eus: u32,
    pub max_slices: u32,
    pub max_subslices_per_slice: u32,
    pub max_eus_per_subslice: u32,
    pub mapping: TopologyMapping,
}

pub fn decode_topology(info: &TopologyInfo) -> Result<TopologyCounts, TopologyError> {
    let max_slices = usize::from(info.max_slices);
    let max_subslices = usize::from(info.max_subslices);
    let max_eus = usize::from(info.max_eus_per_subslice);
    let subslice_offset = usize::from(info.subslice_offset);
    let subslice_stride = usize::from(info.subslice_stride);
    let eu_offset = usize::from(info.eu_offset);
    let eu_stride = usize::from(info.eu_stride);

    let mut counts = TopologyCounts {
        max_slices: u32::from(info.max_slices),
        max_subslices_per_slice: u32::from(info.max_subslices),
        max_eus_per_subslice: u32::from(info.max_eus_per_subslice),
        ..TopologyCounts::default()
    };
    let mut last_slice_subslices = Vec::new();

    for s in 0..max_slices {
        if !info.bit(s / 8, s % 8)? {
            continue;
        }
        counts.slices += 1;
        counts.mapping.slice_indices.push(s as u32);
        last_slice_subslices.clear();

        for ss in 0..max_subslices {
            if !info.bit(subslice_offset + s * subslice_stride + ss / 8, ss % 8)? {
                continue;
            }
            counts.subslices += 1;
            last_slice_subslices.push(ss as u32);

            let eu_base = eu_offset + (s * max_subslices + ss) * eu_stride;
            for eu in 0..max_eus {
                if info.bit(eu_base + eu / 8, eu % 8)? {
                    counts.eus += 1;
                }
            }
        }
    }

    if counts.slices == 0 || counts.subslices == 0 || counts.eus == 0 {
        return Err(TopologyError::NoEnabledUnits);
    }
    if counts.slices == 1 {
        counts.mapping.subslice_indices = last_slice_subslices;
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice0_fully_enabled() -> TopologyInfo {
        let slices = [true, false];
        let subslices = [[true; 4], [false; 4]].concat();
        let eus = [vec![true; 32], vec![false; 32]].concat();
        TopologyInfo::from_flat_masks(2, 4, 8, &slices, &subslices, &eus).unwrap()
    }

    #[test]
    fn decodes_single_enabled_slice() {
        let counts = decode_topology(&slice0_fully_enabled()).unwrap();
        assert_eq!((counts.slices, counts.subslices, counts.eus), (1, 4, 32));
        assert_eq!(counts.mapping.slice_indices, vec![0]);
        assert_eq!(counts.mapping.subslice_indices, vec![0, 1, 2, 3]);
        assert_eq!(counts.max_eus_per_subslice, 8);
    }

    #[test]
    fn all_zero_mask_is_a_failure() {
        let info = TopologyInfo::from_flat_masks(2, 4, 8, &[], &[], &[]).unwrap();
        assert_eq!(decode_topology(&info), Err(TopologyError::NoEnabledUnits));
    }

    #[test]
    fn enabled_slice_without_eus_is_a_failure() {
        let info = TopologyInfo::from_flat_masks(1, 2, 8, &[true], &[true, true], &[]).unwrap();
        assert_eq!(decode_topology(&info), Err(TopologyError::NoEnabledUnits));
    }

    #[test]
    fn disabled_subslice_eus_are_not_counted() {
        // Subslice 1 is fused off but its EU bits are still set in the blob.
        let info = TopologyInfo::from_flat_masks(1, 2, 8, &[true], &[true, false], &[true; 16]).unwrap();
        let counts = decode_topology(&info).unwrap();
        assert_eq!((counts.slices, counts.subslices, counts.eus), (1, 1, 8));
    }

    #[test]
    fn subslice_indices_only_reported_for_single_slice() {
        let info = TopologyInfo::from_flat_masks(2, 2, 8, &[true, true], &[true; 4], &[true; 32]).unwrap();
        let counts = decode_topology(&info).unwrap();
        assert_eq!(counts.mapping.slice_indices, vec![0, 1]);
        assert!(counts.mapping.subslice_indices.is_empty());
    }

    #[test]
    fn header_fields_that_overflow_are_refused() {
        let err = TopologyInfo::from_flat_masks(u16::MAX, u16::MAX, 8, &[], &[], &[]).unwrap_err();
        assert!(matches!(
            err,
            TopologyError::LayoutOverflow {
                field: "eu_offset",
                ..
            }
        ));
    }

    #[test]
    fn truncated_data_is_reported() {
        let mut info = slice0_fully_enabled();
        info.data.truncate(3);
        assert!(matches!(
            decode_topology(&info),
            Err(TopologyError::Truncated { .. })
        ));
    }

    #[test]
    fn kernel_blob_round_trips() {
        let info = slice0_fully_enabled();
        let back = TopologyInfo::decode_from_le_bytes(&info.to_le_bytes()).unwrap();
        assert_eq!(back, info);
    }
}
