//! Per-family hardware parameters.
//!
//! The registry is an explicit map populated by [`FamilyRegistry::bootstrap`] and owned by the
//! [`crate::DeviceManager`]. Devices of a family that is not registered run without debug
//! support.

use std::collections::HashMap;

use gpudbg_abi::SaveAreaVersion;

use crate::cache::{CacheGeometry, CacheLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuFamily {
    Gen12Lp,
    XeHpg,
    XeHpc,
    Xe2Hpg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyDescriptor {
    pub name: &'static str,
    pub cache: CacheGeometry,
    /// Layout version of the per-thread state save area.
    pub save_area_version: SaveAreaVersion,
    /// Whether bindless surface/sampler state bases are tracked for this family.
    pub tracks_bindless: bool,
}

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct FamilyRegistry {
    families: HashMap<GpuFamily, FamilyDescriptor>,
}

impl FamilyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in family.
    pub fn bootstrap() -> Self {
        let mut registry = Self::new();
        registry.register(
            GpuFamily::Gen12Lp,
            FamilyDescriptor {
                name: "gen12lp",
                cache: CacheGeometry::UNPARTITIONED,
                save_area_version: SaveAreaVersion::new(1, 0, 0),
                tracks_bindless: false,
            },
        );
        registry.register(
            GpuFamily::XeHpg,
            FamilyDescriptor {
                name: "xe_hpg",
                cache: CacheGeometry::UNPARTITIONED,
                save_area_version: SaveAreaVersion::new(2, 0, 0),
                tracks_bindless: true,
            },
        );
        registry.register(
            GpuFamily::XeHpc,
            FamilyDescriptor {
                name: "xe_hpc",
                cache: CacheGeometry {
                    level: CacheLevel::L3,
                    max_size_bytes: 16 * MIB,
                    max_ways: 32,
                },
                save_area_version: SaveAreaVersion::new(2, 0, 0),
                tracks_bindless: true,
            },
        );
        registry.register(
            GpuFamily::Xe2Hpg,
            FamilyDescriptor {
                name: "xe2_hpg",
                cache: CacheGeometry {
                    level: CacheLevel::L2,
                    max_size_bytes: 8 * MIB,
                    max_ways: 16,
                },
                save_area_version: SaveAreaVersion::new(3, 0, 0),
                tracks_bindless: true,
            },
        );
        registry
    }

    /// Adds or replaces a family, returning the previous descriptor.
    pub fn register(
        &mut self,
        family: GpuFamily,
        descriptor: FamilyDescriptor,
    ) -> Option<FamilyDescriptor> {
        self.families.insert(family, descriptor)
    }

    pub fn unregister(&mut self, family: GpuFamily) -> Option<FamilyDescriptor> {
        self.families.remove(&family)
    }

    pub fn get(&self, family: GpuFamily) -> Option<&FamilyDescriptor> {
        self.families.get(&family)
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use gpudbg_abi::state_save_area::STATE_SAVE_AREA_MAX_MAJOR;

    use super::*;

    #[test]
    fn bootstrap_registers_every_family() {
        let registry = FamilyRegistry::bootstrap();
        for family in [
            GpuFamily::Gen12Lp,
            GpuFamily::XeHpg,
            GpuFamily::XeHpc,
            GpuFamily::Xe2Hpg,
        ] {
            let desc = registry.get(family).unwrap();
            assert!(desc.save_area_version.major >= 1);
            assert!(desc.save_area_version.major <= STATE_SAVE_AREA_MAX_MAJOR);
        }
    }

    #[test]
    fn register_replaces() {
        let mut registry = FamilyRegistry::bootstrap();
        let mut desc = *registry.get(GpuFamily::XeHpc).unwrap();
        desc.tracks_bindless = false;
        let previous = registry.register(GpuFamily::XeHpc, desc).unwrap();
        assert!(previous.tracks_bindless);
        assert!(!registry.get(GpuFamily::XeHpc).unwrap().tracks_bindless);

        registry.unregister(GpuFamily::XeHpc);
        assert!(registry.get(GpuFamily::XeHpc).is_none());
    }
}
