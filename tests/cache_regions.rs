use std::sync::Arc;

use gpudbg_session::test_utils::FakeDrmDevice;
use gpudbg_session::{
    CacheGeometry, CacheLevel, CacheRegionAllocator, CacheRegionId, ClosCacheReservation,
    DebuggerConfig, DeviceManager, GpuFamily, OsInterface,
};

const MIB: u64 = 1024 * 1024;

fn xe_hpc_cache(drm: &Arc<FakeDrmDevice>, config: DebuggerConfig) -> CacheRegionAllocator {
    DeviceManager::new(config)
        .open_cache_allocator(GpuFamily::XeHpc, &OsInterface::Linux(drm.clone()))
        .unwrap()
}

#[test]
fn reservation_programs_clos_ways() {
    let drm = Arc::new(FakeDrmDevice::new());
    let cache = xe_hpc_cache(&drm, DebuggerConfig::default());

    let region = cache.reserve(4 * MIB).unwrap();
    assert_eq!(drm.cache_ways(region.0), Some((CacheLevel::L3 as u16, 8)));
    assert_eq!(drm.reserved_clos(), 1);

    assert_eq!(cache.free(region), Some(region));
    assert_eq!(drm.cache_ways(region.0), None);
    assert_eq!(drm.reserved_clos(), 0);
}

#[test]
fn free_then_reserve_gets_a_fresh_region() {
    let drm = Arc::new(FakeDrmDevice::new().with_clos_count(1));
    let cache = xe_hpc_cache(&drm, DebuggerConfig::default());

    let a = cache.reserve(MIB).unwrap();
    assert_eq!(cache.reserve(MIB), None);
    cache.free(a).unwrap();
    let b = cache.reserve(2 * MIB).unwrap();
    assert!(cache.is_reserved(b, 2 * MIB));
    assert!(!cache.is_reserved(b, MIB));
    assert_eq!(cache.free(CacheRegionId(9)), None);
}

#[test]
fn failed_ways_reservation_releases_the_clos() {
    let drm = Arc::new(FakeDrmDevice::new());
    drm.fail_cache_reserve(true);
    let cache = xe_hpc_cache(&drm, DebuggerConfig::default());
    assert_eq!(cache.reserve(MIB), None);
    assert_eq!(drm.reserved_clos(), 0);
    assert_eq!(cache.reserved_count(), 0);
}

#[test]
fn configured_ways_override_the_size() {
    let drm = Arc::new(FakeDrmDevice::new());
    let config = DebuggerConfig {
        clos_num_cache_ways: Some(2),
        ..Default::default()
    };
    let cache = xe_hpc_cache(&drm, config);
    let region = cache.reserve(12 * MIB).unwrap();
    assert_eq!(drm.cache_ways(region.0), Some((CacheLevel::L3 as u16, 2)));
}

#[test]
fn ensure_reserved_against_the_kernel() {
    let drm = Arc::new(FakeDrmDevice::new());
    let cache = xe_hpc_cache(&drm, DebuggerConfig::default());

    assert!(cache.ensure_reserved(CacheRegionId::DEFAULT, MIB));
    assert_eq!(drm.ioctl_count(), 0);

    // The kernel hands out the lowest free index first.
    assert!(cache.ensure_reserved(CacheRegionId(1), MIB));
    assert!(cache.ensure_reserved(CacheRegionId(1), MIB));
    assert!(cache.is_reserved(CacheRegionId(1), MIB));

    // Index 3 is not what the kernel returns next (2); the stray reservation is released.
    assert!(!cache.ensure_reserved(CacheRegionId(3), MIB));
    assert_eq!(drm.reserved_clos(), 1);
    assert_eq!(cache.reserved_count(), 1);
}

#[test]
fn ways_rounding_boundaries() {
    let geometry = CacheGeometry {
        level: CacheLevel::L3,
        max_size_bytes: 16 * MIB,
        max_ways: 32,
    };
    let way = 16 * MIB / 32;
    let drm = Arc::new(FakeDrmDevice::new());
    let cache = CacheRegionAllocator::new(geometry, None, Box::new(ClosCacheReservation::new(drm.clone())));

    assert_eq!(cache.reserve(way - 1), None);
    let one = cache.reserve(way).unwrap();
    assert_eq!(drm.cache_ways(one.0).map(|(_, ways)| ways), Some(1));
    let floor = cache.reserve(2 * way - 1).unwrap();
    assert_eq!(drm.cache_ways(floor.0).map(|(_, ways)| ways), Some(1));
    assert_eq!(cache.reserve(16 * MIB + way), None);
}

#[test]
fn unpartitioned_family_never_reserves() {
    let drm = Arc::new(FakeDrmDevice::new());
    let cache = DeviceManager::default()
        .open_cache_allocator(GpuFamily::Gen12Lp, &OsInterface::Linux(drm.clone()))
        .unwrap();
    assert_eq!(cache.reserve(MIB), None);
    assert_eq!(drm.ioctl_count(), 0);
}
