//! Cache region (class of service) reservations.
//!
//! A region is a class-of-service index with a number of ways of one cache level assigned to it.
//! Callers think in bytes; the allocator converts a byte size to ways against the family's cache
//! geometry, rounding down, and refuses sizes that round to zero ways or exceed the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::registrar::DrmDevice;

/// Class-of-service index. Index 0 is the default region every workload runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheRegionId(pub u16);

impl CacheRegionId {
    pub const DEFAULT: CacheRegionId = CacheRegionId(0);

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheLevel {
    L2 = 2,
    L3 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    pub level: CacheLevel,
    pub max_size_bytes: u64,
    /// Zero when the cache cannot be partitioned.
    pub max_ways: u16,
}

impl CacheGeometry {
    pub const UNPARTITIONED: CacheGeometry = CacheGeometry {
        level: CacheLevel::L3,
        max_size_bytes: 0,
        max_ways: 0,
    };

    /// Ways needed for `size_bytes`, rounded down.
    pub fn ways_for(&self, size_bytes: u64) -> u16 {
        if self.max_size_bytes == 0 {
            return 0;
        }
        let ways = u128::from(self.max_ways) * u128::from(size_bytes) / u128::from(self.max_size_bytes);
        u16::try_from(ways).unwrap_or(u16::MAX)
    }
}

/// Kernel side of a reservation.
pub trait CacheReservation: Send + Sync {
    fn reserve(&self, level: CacheLevel, num_ways: u16) -> Option<CacheRegionId>;

    fn free(&self, level: CacheLevel, region: CacheRegionId);
}

/// Reservations through the DRM class-of-service ioctls.
pub struct ClosCacheReservation {
    drm: Arc<dyn DrmDevice>,
}

impl ClosCacheReservation {
    pub fn new(drm: Arc<dyn DrmDevice>) -> Self {
        Self { drm }
    }
}

impl CacheReservation for ClosCacheReservation {
    fn reserve(&self, level: CacheLevel, num_ways: u16) -> Option<CacheRegionId> {
        let clos = match self.drm.clos_reserve() {
            Ok(clos) => clos,
            Err(err) => {
                tracing::debug!(%err, "class of service reservation failed");
                return None;
            }
        };
        if let Err(err) = self.drm.cache_reserve(clos, level as u16, num_ways) {
            tracing::debug!(clos, num_ways, %err, "cache ways reservation failed");
            if let Err(err) = self.drm.clos_free(clos) {
                tracing::warn!(clos, %err, "failed to release class of service");
            }
            return None;
        }
        Some(CacheRegionId(clos))
    }

    fn free(&self, level: CacheLevel, region: CacheRegionId) {
        if let Err(err) = self.drm.cache_reserve(region.0, level as u16, 0) {
            tracing::warn!(clos = region.0, %err, "failed to release cache ways");
        }
        if let Err(err) = self.drm.clos_free(region.0) {
            tracing::warn!(clos = region.0, %err, "failed to release class of service");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullCacheReservation;

impl CacheReservation for NullCacheReservation {
    fn reserve(&self, _level: CacheLevel, _num_ways: u16) -> Option<CacheRegionId> {
        None
    }

    fn free(&self, _level: CacheLevel, _region: CacheRegionId) {}
}

pub struct CacheRegionAllocator {
    geometry: CacheGeometry,
    ways_override: Option<u16>,
    backend: Box<dyn CacheReservation>,
    regions: Mutex<HashMap<CacheRegionId, u64>>,
}

impl CacheRegionAllocator {
    pub fn new(
        geometry: CacheGeometry,
        ways_override: Option<u16>,
        backend: Box<dyn CacheReservation>,
    ) -> Self {
        Self {
            geometry,
            ways_override,
            backend,
            regions: Mutex::new(HashMap::new()),
        }
    }

    pub fn geometry(&self) -> CacheGeometry {
        self.geometry
    }

    pub fn reserve(&self, size_bytes: u64) -> Option<CacheRegionId> {
        let ways = self
            .ways_override
            .unwrap_or_else(|| self.geometry.ways_for(size_bytes));
        if ways == 0 || ways > self.geometry.max_ways {
            tracing::debug!(size_bytes, ways, max_ways = self.geometry.max_ways, "cache region size out of range");
            return None;
        }

        let region = self.backend.reserve(self.geometry.level, ways)?;
        self.lock().insert(region, size_bytes);
        tracing::debug!(clos = region.0, size_bytes, ways, "reserved cache region");
        Some(region)
    }

    pub fn free(&self, region: CacheRegionId) -> Option<CacheRegionId> {
        self.lock().remove(&region)?;
        self.backend.free(self.geometry.level, region);
        Some(region)
    }

    /// Makes sure `region` is reserved with `size_bytes`.
    ///
    /// Returns `false` if the region could not be reserved under that index. A region already
    /// reserved with another size is left alone.
    pub fn ensure_reserved(&self, region: CacheRegionId, size_bytes: u64) -> bool {
        if region.is_default() {
            return true;
        }

        let existing = self.lock().get(&region).copied();
        match existing {
            Some(size) if size == size_bytes => true,
            Some(size) => {
                tracing::warn!(
                    clos = region.0,
                    reserved = size,
                    requested = size_bytes,
                    "cache region already reserved with a different size"
                );
                debug_assert!(false, "cache region {} size mismatch", region.0);
                true
            }
            None => match self.reserve(size_bytes) {
                Some(got) if got == region => true,
                Some(got) => {
                    tracing::debug!(wanted = region.0, got = got.0, "kernel handed out another region");
                    self.free(got);
                    false
                }
                None => false,
            },
        }
    }

    pub fn is_reserved(&self, region: CacheRegionId, size_bytes: u64) -> bool {
        self.lock().get(&region) == Some(&size_bytes)
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheRegionId, u64>> {
        self.regions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for CacheRegionAllocator {
    fn drop(&mut self) {
        let regions: Vec<_> = self.lock().drain().map(|(region, _)| region).collect();
        for region in regions {
            self.backend.free(self.geometry.level, region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::FakeClosBackend;

    const MIB: u64 = 1024 * 1024;

    fn geometry() -> CacheGeometry {
        CacheGeometry {
            level: CacheLevel::L3,
            max_size_bytes: 16 * MIB,
            max_ways: 32,
        }
    }

    fn allocator(backend: &FakeClosBackend) -> CacheRegionAllocator {
        CacheRegionAllocator::new(geometry(), None, Box::new(backend.clone()))
    }

    #[test]
    fn ways_round_down() {
        let g = geometry();
        assert_eq!(g.ways_for(MIB / 2), 1);
        assert_eq!(g.ways_for(MIB / 2 - 1), 0);
        assert_eq!(g.ways_for(MIB - 1), 1);
        assert_eq!(g.ways_for(16 * MIB), 32);
        assert_eq!(g.ways_for(u64::MAX), u16::MAX);
        assert_eq!(CacheGeometry::UNPARTITIONED.ways_for(MIB), 0);
    }

    #[test]
    fn reserve_sizes_out_of_range_are_refused() {
        let backend = FakeClosBackend::new(4);
        let cache = allocator(&backend);
        assert_eq!(cache.reserve(0), None);
        assert_eq!(cache.reserve(MIB / 4), None);
        assert_eq!(cache.reserve(17 * MIB), None);
        assert_eq!(backend.reserve_calls(), 0);
    }

    #[test]
    fn reserve_then_free_then_reserve_again() {
        let backend = FakeClosBackend::new(1);
        let cache = allocator(&backend);

        let a = cache.reserve(2 * MIB).unwrap();
        assert!(cache.is_reserved(a, 2 * MIB));
        assert_eq!(backend.ways(a), Some(4));
        assert_eq!(cache.reserve(2 * MIB), None);

        assert_eq!(cache.free(a), Some(a));
        assert_eq!(cache.free(a), None);
        assert_eq!(backend.ways(a), None);

        let b = cache.reserve(MIB).unwrap();
        assert!(cache.is_reserved(b, MIB));
        assert_eq!(cache.reserved_count(), 1);
    }

    #[test]
    fn ways_override_ignores_size() {
        let backend = FakeClosBackend::new(2);
        let cache = CacheRegionAllocator::new(geometry(), Some(8), Box::new(backend.clone()));
        let region = cache.reserve(1).unwrap();
        assert_eq!(backend.ways(region), Some(8));

        let too_many = CacheRegionAllocator::new(geometry(), Some(33), Box::new(backend.clone()));
        assert_eq!(too_many.reserve(MIB), None);
    }

    #[test]
    fn ensure_reserved_default_region_needs_nothing() {
        let backend = FakeClosBackend::new(1);
        let cache = allocator(&backend);
        assert!(cache.ensure_reserved(CacheRegionId::DEFAULT, 123));
        assert_eq!(backend.reserve_calls(), 0);
    }

    #[test]
    fn ensure_reserved_reserves_missing_region() {
        let backend = FakeClosBackend::new(2);
        let cache = allocator(&backend);
        assert!(cache.ensure_reserved(CacheRegionId(1), MIB));
        assert!(cache.ensure_reserved(CacheRegionId(1), MIB));
        assert_eq!(backend.reserve_calls(), 1);
    }

    #[test]
    fn ensure_reserved_releases_a_mismatched_index() {
        let backend = FakeClosBackend::new(4);
        let cache = allocator(&backend);
        backend.force_next(CacheRegionId(3));
        assert!(!cache.ensure_reserved(CacheRegionId(1), MIB));
        assert_eq!(cache.reserved_count(), 0);
        assert_eq!(backend.ways(CacheRegionId(3)), None);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "size mismatch"))]
    fn ensure_reserved_with_another_size_keeps_the_region() {
        let backend = FakeClosBackend::new(2);
        let cache = allocator(&backend);
        let region = cache.reserve(MIB).unwrap();
        assert!(cache.ensure_reserved(region, 2 * MIB));
        assert!(cache.is_reserved(region, MIB));
    }

    #[test]
    fn null_backend_never_reserves() {
        let cache = CacheRegionAllocator::new(geometry(), None, Box::new(NullCacheReservation));
        assert_eq!(cache.reserve(MIB), None);
        assert!(!cache.ensure_reserved(CacheRegionId(1), MIB));
    }

    #[test]
    fn drop_releases_outstanding_regions() {
        let backend = FakeClosBackend::new(2);
        let cache = allocator(&backend);
        let a = cache.reserve(MIB).unwrap();
        drop(cache);
        assert_eq!(backend.ways(a), None);
    }
}
