//! Kernel resource registration, one adapter per host OS model.
//!
//! The policy layer (module registry, queue tracker, debug area) only ever talks to a
//! [`KernelResourceRegistrar`]. Which implementation backs it is decided once, when the device is
//! opened, from the [`OsInterface`] tag:
//!
//! - [`LinuxRegistrar`]: resource-class/ioctl model. Classes are registered by name first, then
//!   every resource is a UUID registered against its class handle.
//! - [`WindowsRegistrar`]: escape-call model. Every operation is one escape into the kernel-mode
//!   driver with a little-endian input block.
//! - [`NullRegistrar`]: no channel at all. Every call is a benign no-op.
//!
//! No registrar call ever panics or propagates an OS error: debug bookkeeping must never abort
//! GPU work that would otherwise have run fine.

use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

mod linux;
mod null;
mod windows;

pub use linux::{DrmDevice, LinuxRegistrar, UUID_CLASS_STRING};
pub use null::NullRegistrar;
pub use windows::{EscapeCode, EscapeStatus, KmdEscape, WindowsRegistrar, ESCAPE_HEADER_SIZE_BYTES};

/// Opaque kernel-issued handle. `0` is never a valid handle.
pub type ResourceHandle = u32;
pub const NULL_RESOURCE_HANDLE: ResourceHandle = 0;

/// Token returned by the session-start notification and handed back at session end.
pub type SessionToken = u32;
pub const NULL_SESSION_TOKEN: SessionToken = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    ElfBinary,
    Isa,
    ModuleHeapDebugArea,
    ContextSaveArea,
    SbaTrackingBuffer,
    ZebinModule,
    CommandQueue,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 7] = [
        ResourceClass::ElfBinary,
        ResourceClass::Isa,
        ResourceClass::ModuleHeapDebugArea,
        ResourceClass::ContextSaveArea,
        ResourceClass::SbaTrackingBuffer,
        ResourceClass::ZebinModule,
        ResourceClass::CommandQueue,
    ];

    /// Name the class is registered under with the kernel.
    pub const fn name(self) -> &'static str {
        match self {
            ResourceClass::ElfBinary => "GPUDBG_CLASS_ELF_BINARY",
            ResourceClass::Isa => "GPUDBG_CLASS_ISA",
            ResourceClass::ModuleHeapDebugArea => "GPUDBG_CLASS_MODULE_AREA",
            ResourceClass::ContextSaveArea => "GPUDBG_CLASS_SIP_AREA",
            ResourceClass::SbaTrackingBuffer => "GPUDBG_CLASS_SBA_AREA",
            ResourceClass::ZebinModule => "GPUDBG_CLASS_ZEBIN_MODULE",
            ResourceClass::CommandQueue => "GPUDBG_CLASS_COMMAND_QUEUE",
        }
    }

    /// Numeric id used on the wire by the escape-call model.
    pub const fn wire_id(self) -> u32 {
        match self {
            ResourceClass::ElfBinary => 1,
            ResourceClass::Isa => 2,
            ResourceClass::ModuleHeapDebugArea => 3,
            ResourceClass::ContextSaveArea => 4,
            ResourceClass::SbaTrackingBuffer => 5,
            ResourceClass::ZebinModule => 6,
            ResourceClass::CommandQueue => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarPlatform {
    Linux,
    Windows,
    Null,
}

bitflags! {
    /// What the probe found the kernel driver able to do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegistrarCapabilities: u32 {
        /// Each context gets its own GPU virtual address space.
        const CONTEXT_ISOLATED_VM = 1 << 0;
        /// An external debugger can attach to contexts of this process.
        const DEBUG_ATTACH = 1 << 1;
    }
}

impl RegistrarCapabilities {
    pub fn supports_debugging(self) -> bool {
        self.contains(Self::CONTEXT_ISOLATED_VM | Self::DEBUG_ATTACH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistrarError {
    #[error("no kernel registration channel")]
    Unsupported,

    #[error("kernel rejected {} registration", .0.name())]
    Rejected(ResourceClass),
}

pub trait KernelResourceRegistrar: Send + Sync {
    fn platform(&self) -> RegistrarPlatform;

    /// Probes the OS/driver combination and prepares the channel.
    ///
    /// Returns `false` when debugging is unsupported; the owner must then never issue any other
    /// call for the lifetime of the device.
    fn initialize_for_device(&mut self) -> bool;

    /// Whether a successful probe left a usable registration channel.
    fn has_channel(&self) -> bool;

    fn register_resource(
        &self,
        class: ResourceClass,
        payload: &[u8],
    ) -> Result<ResourceHandle, RegistrarError>;

    /// Best effort; unknown and null handles are ignored.
    fn unregister_resource(&self, handle: ResourceHandle);

    fn notify_session_start(&self) -> SessionToken;

    fn notify_session_end(&self, token: SessionToken);
}

/// Host OS handle the device was opened with.
#[derive(Clone)]
pub enum OsInterface {
    Linux(Arc<dyn DrmDevice>),
    Windows(Arc<dyn KmdEscape>),
    Unavailable,
}

impl std::fmt::Debug for OsInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsInterface::Linux(_) => f.write_str("OsInterface::Linux"),
            OsInterface::Windows(_) => f.write_str("OsInterface::Windows"),
            OsInterface::Unavailable => f.write_str("OsInterface::Unavailable"),
        }
    }
}

/// Picks the registrar variant for `os`. Called once per device.
pub fn select_registrar(os: &OsInterface) -> Box<dyn KernelResourceRegistrar> {
    match os {
        OsInterface::Linux(drm) => Box::new(LinuxRegistrar::new(drm.clone())),
        OsInterface::Windows(kmd) => Box::new(WindowsRegistrar::new(kmd.clone())),
        OsInterface::Unavailable => Box::new(NullRegistrar),
    }
}

/// Selects and probes the registrar for `os`.
///
/// `None` means debugging is unsupported on this device, which is a normal device state.
pub fn initialize_for_device(os: &OsInterface) -> Option<Box<dyn KernelResourceRegistrar>> {
    let mut registrar = select_registrar(os);
    if registrar.initialize_for_device() {
        Some(registrar)
    } else {
        tracing::debug!(?os, "kernel debug registration unavailable");
        None
    }
}
