//! Devices without debug support must behave as if the subsystem were not there.

use std::sync::Arc;

use gpudbg_abi::StateBaseAddresses;
use gpudbg_session::test_utils::{FakeDrmDevice, FakeKmd};
use gpudbg_session::{
    AllocationKind, ContextAffinity, DebugSession, DebuggerConfig, DebuggerError, DeviceManager,
    GpuAllocation, GpuFamily, HostMemoryAllocator, OsInterface, RegistrarCapabilities,
};

fn exercise(session: &DebugSession) {
    let isa = Arc::new(GpuAllocation::new(
        1,
        0x4000,
        0x1000,
        AllocationKind::KernelIsa,
        ContextAffinity::Device,
    ));

    assert!(!session.is_active());
    for _ in 0..3 {
        session.on_queue_created();
    }
    for _ in 0..4 {
        session.on_queue_destroyed();
    }
    assert!(matches!(
        session.register_module(&[isa.clone()]),
        Err(DebuggerError::Unsupported(_))
    ));
    assert!(!session.unregister_module(1));
    assert_eq!(session.register_elf(b"\x7fELF", &isa), None);
    assert_eq!(session.ensure_context(1).unwrap(), None);
    assert!(!session
        .capture_state_base_addresses(
            1,
            &StateBaseAddresses {
                general_state: 0x1000,
                ..Default::default()
            }
        )
        .unwrap());
    assert_eq!(session.tracking_address(1), None);
    assert!(isa.linked_resources().is_empty());
}

#[test]
fn linux_without_debugger_attach_only_probes() {
    let drm = Arc::new(FakeDrmDevice::with_capabilities(true, false));
    let allocator = Arc::new(HostMemoryAllocator::new());
    let session = DeviceManager::default()
        .open_session(GpuFamily::XeHpc, &OsInterface::Linux(drm.clone()), allocator.clone())
        .unwrap();

    let probe_ioctls = drm.ioctl_count();
    assert_eq!(probe_ioctls, 2);
    exercise(&session);
    drop(session);

    assert_eq!(drm.ioctl_count(), probe_ioctls);
    assert_eq!(drm.live_uuids(), 0);
    assert_eq!(allocator.live_allocations(), 0);
}

#[test]
fn windows_without_debug_caps_only_probes() {
    let kmd = Arc::new(FakeKmd::new(RegistrarCapabilities::empty()));
    let session = DeviceManager::default()
        .open_session(
            GpuFamily::XeHpg,
            &OsInterface::Windows(kmd.clone()),
            Arc::new(HostMemoryAllocator::new()),
        )
        .unwrap();

    exercise(&session);
    drop(session);
    assert_eq!(kmd.escape_count(), 1);
}

#[test]
fn disabled_config_never_touches_the_kernel() {
    let drm = Arc::new(FakeDrmDevice::new());
    let config = DebuggerConfig {
        enabled: false,
        ..Default::default()
    };
    let session = DeviceManager::new(config)
        .open_session(
            GpuFamily::XeHpc,
            &OsInterface::Linux(drm.clone()),
            Arc::new(HostMemoryAllocator::new()),
        )
        .unwrap();

    exercise(&session);
    assert_eq!(drm.ioctl_count(), 0);
}

#[test]
fn unregistered_family_never_touches_the_kernel() {
    let drm = Arc::new(FakeDrmDevice::new());
    let mut manager = DeviceManager::default();
    manager.families_mut().unregister(GpuFamily::Gen12Lp);
    let session = manager
        .open_session(
            GpuFamily::Gen12Lp,
            &OsInterface::Linux(drm.clone()),
            Arc::new(HostMemoryAllocator::new()),
        )
        .unwrap();

    exercise(&session);
    assert_eq!(drm.ioctl_count(), 0);
}

#[test]
fn no_os_interface_is_inactive() {
    let session = DeviceManager::default()
        .open_session(
            GpuFamily::XeHpc,
            &OsInterface::Unavailable,
            Arc::new(HostMemoryAllocator::new()),
        )
        .unwrap();
    exercise(&session);
}
