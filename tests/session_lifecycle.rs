use std::sync::Arc;

use gpudbg_abi::{SbaField, StateBaseAddresses, StateSaveAreaHeader, SBA_TRACKED_ADDRESSES_MAGIC};
use gpudbg_session::registrar::EscapeCode;
use pretty_assertions::assert_eq;
use gpudbg_session::test_utils::{FakeDrmDevice, FakeKmd};
use gpudbg_session::{
    AllocationKind, AllocationRequest, ContextAffinity, DebuggerConfig, DeviceManager, GpuFamily,
    HostMemoryAllocator, MemoryAllocator, OsInterface, RegistrarPlatform, ResourceClass,
    SbaTrackingMode,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn isa_segment(allocator: &HostMemoryAllocator) -> Arc<gpudbg_session::GpuAllocation> {
    allocator
        .allocate(AllocationRequest {
            size_bytes: 0x2000,
            kind: AllocationKind::KernelIsa,
            affinity: ContextAffinity::Device,
        })
        .unwrap()
}

#[test]
fn linux_session_end_to_end() {
    init_tracing();
    let drm = Arc::new(FakeDrmDevice::new());
    let allocator = Arc::new(HostMemoryAllocator::new());
    let manager = DeviceManager::default();

    let session = manager
        .open_session(GpuFamily::XeHpc, &OsInterface::Linux(drm.clone()), allocator.clone())
        .unwrap();
    assert!(session.is_active());
    assert_eq!(session.platform(), Some(RegistrarPlatform::Linux));

    let class_uuids = ResourceClass::ALL.len();
    // Class names, debug area and state save area header.
    assert_eq!(drm.live_uuids(), class_uuids + 2);

    // Debug area is discoverable through its registration payload.
    let area = session.debug_area().unwrap();
    let area_uuid = drm.uuid(area.handle().unwrap()).unwrap();
    assert_eq!(area_uuid.payload, area.gpu_va().to_le_bytes());

    // State base address tracking.
    let va = session.ensure_context(4).unwrap().unwrap();
    assert_eq!(session.tracking_address(4), Some(va));
    let sba = StateBaseAddresses {
        general_state: 0x10_0000,
        surface_state: 0x20_0000,
        bindless_surface_state: 0x30_0000,
        ..Default::default()
    };
    assert!(session.capture_state_base_addresses(4, &sba).unwrap());
    let store = session.sba_tracking().unwrap();
    assert_eq!(store.field_address(4, SbaField::SurfaceState).unwrap(), va + 32);

    let snap = store.snapshot(4).unwrap();
    assert_eq!(snap.magic, SBA_TRACKED_ADDRESSES_MAGIC);
    assert_eq!(snap.bindless_surface_state_base, 0x30_0000);

    // Modules.
    let segment = isa_segment(&allocator);
    let module = session.register_module(&[segment.clone()]).unwrap();
    assert_eq!(segment.linked_resources(), vec![module]);
    assert_eq!(drm.uuid(module).unwrap().payload, 1u32.to_le_bytes());
    assert!(session.unregister_module(module));
    assert!(drm.uuid(module).is_none());

    // Queues.
    session.on_queue_created();
    session.on_queue_created();
    let token = session.queues().unwrap().session_token().unwrap();
    assert!(drm.uuid(token).is_some());
    session.on_queue_destroyed();
    session.on_queue_destroyed();
    assert!(drm.uuid(token).is_none());

    drop(session);
    assert_eq!(drm.live_uuids(), class_uuids);
    allocator.free(segment);
    assert_eq!(allocator.live_allocations(), 0);
}

#[test]
fn linux_teardown_releases_what_the_driver_left_behind() {
    let drm = Arc::new(FakeDrmDevice::new());
    let allocator = Arc::new(HostMemoryAllocator::new());
    let session = DeviceManager::default()
        .open_session(GpuFamily::XeHpc, &OsInterface::Linux(drm.clone()), allocator.clone())
        .unwrap();

    let segment = isa_segment(&allocator);
    let isa = isa_segment(&allocator);
    let module = session.register_module(&[segment.clone()]).unwrap();
    let elf = session.register_elf(b"\x7fELF", &isa).unwrap();
    session.on_queue_created();
    let token = session.queues().unwrap().session_token().unwrap();

    // An ELF release unlinks its ISA right away.
    assert!(session.unregister_module(elf));
    assert!(drm.uuid(elf).is_none());
    assert!(isa.linked_resources().is_empty());

    drop(session);
    assert!(drm.uuid(module).is_none());
    assert!(drm.uuid(token).is_none());
    assert!(segment.linked_resources().is_empty());
    assert_eq!(drm.live_uuids(), ResourceClass::ALL.len());
}

#[test]
fn linux_debug_area_failure_leaves_the_device_inactive() {
    let drm = Arc::new(FakeDrmDevice::new());
    let allocator = Arc::new(HostMemoryAllocator::with_capacity(0));
    let session = DeviceManager::default()
        .open_session(GpuFamily::XeHpc, &OsInterface::Linux(drm.clone()), allocator.clone())
        .unwrap();

    assert!(!session.is_active());
    session.on_queue_created();
    assert_eq!(session.queues().map(|q| q.queue_count()), None);
    // Only the class names registered by the probe remain.
    assert_eq!(drm.live_uuids(), ResourceClass::ALL.len());
    assert_eq!(allocator.live_allocations(), 0);
}

#[test]
fn linux_save_area_header_matches_family() {
    let drm = Arc::new(FakeDrmDevice::new());
    let manager = DeviceManager::default();
    let session = manager
        .open_session(
            GpuFamily::Xe2Hpg,
            &OsInterface::Linux(drm.clone()),
            Arc::new(HostMemoryAllocator::new()),
        )
        .unwrap();
    assert!(session.is_active());

    let registrar_class = drm.class_handle_named(ResourceClass::ContextSaveArea.name()).unwrap();
    let save_areas = drm.uuids_of_class(registrar_class);
    assert_eq!(save_areas.len(), 1);
    let header = StateSaveAreaHeader::decode_from_le_bytes(&save_areas[0].1.payload).unwrap();
    assert_eq!(header.version.major, 3);
}

#[test]
fn windows_session_end_to_end() {
    init_tracing();
    let kmd = Arc::new(FakeKmd::supported());
    let allocator = Arc::new(HostMemoryAllocator::new());
    let config = DebuggerConfig {
        sba_tracking_mode: SbaTrackingMode::Single,
        ..Default::default()
    };
    let manager = DeviceManager::new(config);

    let session = manager
        .open_session(GpuFamily::XeHpg, &OsInterface::Windows(kmd.clone()), allocator.clone())
        .unwrap();
    assert_eq!(session.platform(), Some(RegistrarPlatform::Windows));
    assert!(session.debug_area().unwrap().header().unwrap().is_shared());

    let a = session.ensure_context(1).unwrap().unwrap();
    let b = session.ensure_context(2).unwrap().unwrap();
    assert_eq!(a, b);

    let segment = isa_segment(&allocator);
    let elf = session.register_elf(b"\x7fELF", &segment).unwrap();
    assert!(kmd
        .live_resources()
        .iter()
        .any(|(handle, class, _)| *handle == elf && *class == ResourceClass::ElfBinary.wire_id()));
    assert!(session.unregister_module(elf));

    session.on_queue_created();
    assert_eq!(kmd.open_sessions(), 1);
    session.on_queue_destroyed();
    assert_eq!(kmd.open_sessions(), 0);

    drop(session);
    assert!(kmd.live_resources().is_empty());
    let unregisters = kmd
        .escapes()
        .iter()
        .filter(|e| e.code == EscapeCode::UnregisterResource)
        .count();
    // Debug area, state save area, one shared tracking buffer and the ELF.
    assert_eq!(unregisters, 4);
}
