//! GPU debug-session resource subsystem.
//!
//! Lets an external debugger attach to compute contexts of this process: tracks the state base
//! addresses each context currently runs with, registers code modules with the kernel driver for
//! symbolication, and notifies the kernel when the first command queue of a device is created and
//! when the last one goes away.
//!
//! Everything hangs off a [`DebugSession`], opened per device through a [`DeviceManager`]. When
//! the kernel (or configuration) does not support debugging the session is inactive and every
//! operation degrades to a benign no-op without touching the kernel.
#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod debug_area;
pub mod device;
mod error;
pub mod family;
pub mod memory;
pub mod module;
pub mod queue;
pub mod registrar;
pub mod sba;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// Hardware execution context id, as assigned by the device.
pub type ContextId = u32;

pub use cache::{
    CacheGeometry, CacheLevel, CacheRegionAllocator, CacheRegionId, CacheReservation,
    ClosCacheReservation, NullCacheReservation,
};
pub use config::{DebuggerConfig, SbaTrackingMode};
pub use debug_area::ModuleDebugArea;
pub use device::DeviceManager;
pub use error::{DebuggerError, Result};
pub use family::{FamilyDescriptor, FamilyRegistry, GpuFamily};
pub use memory::{
    AllocationKind, AllocationRequest, ContextAffinity, GpuAllocation, HostMemoryAllocator,
    MemoryAllocator, MemoryError,
};
pub use module::ModuleSegmentRegistry;
pub use queue::CommandQueueLifecycleTracker;
pub use registrar::{
    initialize_for_device, select_registrar, KernelResourceRegistrar, OsInterface,
    RegistrarCapabilities, RegistrarError, RegistrarPlatform, ResourceClass, ResourceHandle,
    SessionToken, NULL_RESOURCE_HANDLE, NULL_SESSION_TOKEN,
};
pub use sba::SbaTrackingStore;
pub use session::DebugSession;
