//! Resource-class/ioctl registrar.
//!
//! The kernel tracks debug resources as UUIDs. A UUID is always registered against a class
//! handle, and class handles themselves are obtained by registering the class name against the
//! built-in string class ([`UUID_CLASS_STRING`]). All classes are registered up front during the
//! probe so the per-resource path is a single ioctl.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{
    KernelResourceRegistrar, RegistrarCapabilities, RegistrarError, RegistrarPlatform,
    ResourceClass, ResourceHandle, SessionToken, NULL_RESOURCE_HANDLE, NULL_SESSION_TOKEN,
};

/// Class handle of the kernel's built-in "string" class, used to register class names.
pub const UUID_CLASS_STRING: u32 = u32::MAX;

/// The DRM ioctls this subsystem issues. Implemented over a real device node by the driver, and
/// by fakes in tests.
pub trait DrmDevice: Send + Sync {
    /// Whether the device runs with one GPU VM per context (VM_BIND).
    fn query_vm_bind(&self) -> io::Result<bool>;

    /// Whether the kernel exposes the debugger attach interface.
    fn query_debugger_attach(&self) -> io::Result<bool>;

    fn uuid_register(&self, class_handle: u32, uuid: &[u8; 36], payload: &[u8]) -> io::Result<u32>;

    fn uuid_unregister(&self, handle: u32) -> io::Result<()>;

    /// Reserves a cache class of service index.
    fn clos_reserve(&self) -> io::Result<u16>;

    fn clos_free(&self, clos: u16) -> io::Result<()>;

    /// Assigns `num_ways` ways of cache `level` to `clos`. Zero ways releases them.
    fn cache_reserve(&self, clos: u16, level: u16, num_ways: u16) -> io::Result<()>;
}

pub struct LinuxRegistrar {
    drm: Arc<dyn DrmDevice>,
    class_handles: HashMap<ResourceClass, u32>,
    capabilities: RegistrarCapabilities,
    ready: bool,
    uuid_seq: AtomicU64,
}

impl LinuxRegistrar {
    pub fn new(drm: Arc<dyn DrmDevice>) -> Self {
        Self {
            drm,
            class_handles: HashMap::new(),
            capabilities: RegistrarCapabilities::empty(),
            ready: false,
            uuid_seq: AtomicU64::new(1),
        }
    }

    pub fn capabilities(&self) -> RegistrarCapabilities {
        self.capabilities
    }

    pub fn class_handle(&self, class: ResourceClass) -> Option<u32> {
        self.class_handles.get(&class).copied()
    }

    fn probe(&self) -> io::Result<RegistrarCapabilities> {
        let mut caps = RegistrarCapabilities::empty();
        if self.drm.query_vm_bind()? {
            caps |= RegistrarCapabilities::CONTEXT_ISOLATED_VM;
        }
        if self.drm.query_debugger_attach()? {
            caps |= RegistrarCapabilities::DEBUG_ATTACH;
        }
        Ok(caps)
    }

    fn next_uuid(&self) -> [u8; 36] {
        let seq = self.uuid_seq.fetch_add(1, Ordering::Relaxed);
        format_uuid(std::process::id(), 0, seq)
    }
}

/// `xxxxxxxx-xxxx-4xxx-8xxx-xxxxxxxxxxxx` built from an owner id, a tag and a sequence number.
fn format_uuid(owner: u32, tag: u16, seq: u64) -> [u8; 36] {
    let text = format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        owner,
        tag,
        0x4000 | ((seq >> 48) & 0x0fff),
        0x8000 | ((seq >> 32) & 0x3fff),
        seq & 0xffff_ffff,
    );
    let mut out = [0u8; 36];
    out.copy_from_slice(text.as_bytes());
    out
}

fn class_uuid(class: ResourceClass) -> [u8; 36] {
    // Fixed per class so every process agrees on them.
    format_uuid(0x6770_7564, 0, u64::from(class.wire_id()))
}

impl KernelResourceRegistrar for LinuxRegistrar {
    fn platform(&self) -> RegistrarPlatform {
        RegistrarPlatform::Linux
    }

    fn initialize_for_device(&mut self) -> bool {
        let caps = match self.probe() {
            Ok(caps) => caps,
            Err(err) => {
                tracing::debug!(%err, "debugger capability probe failed");
                return false;
            }
        };
        self.capabilities = caps;
        if !caps.supports_debugging() {
            tracing::debug!(?caps, "kernel does not support per-context debug attach");
            return false;
        }

        for class in ResourceClass::ALL {
            match self
                .drm
                .uuid_register(UUID_CLASS_STRING, &class_uuid(class), class.name().as_bytes())
            {
                Ok(handle) if handle != NULL_RESOURCE_HANDLE => {
                    self.class_handles.insert(class, handle);
                }
                Ok(_) | Err(_) => {
                    tracing::warn!(class = class.name(), "failed to register resource class");
                    self.class_handles.clear();
                    return false;
                }
            }
        }

        self.ready = true;
        true
    }

    fn has_channel(&self) -> bool {
        self.ready
    }

    fn register_resource(
        &self,
        class: ResourceClass,
        payload: &[u8],
    ) -> Result<ResourceHandle, RegistrarError> {
        if !self.ready {
            return Err(RegistrarError::Unsupported);
        }
        let class_handle = self
            .class_handle(class)
            .ok_or(RegistrarError::Unsupported)?;

        match self.drm.uuid_register(class_handle, &self.next_uuid(), payload) {
            Ok(handle) if handle != NULL_RESOURCE_HANDLE => {
                tracing::trace!(class = class.name(), handle, "registered resource");
                Ok(handle)
            }
            Ok(_) => Err(RegistrarError::Rejected(class)),
            Err(err) => {
                tracing::warn!(class = class.name(), %err, "resource registration failed");
                Err(RegistrarError::Rejected(class))
            }
        }
    }

    fn unregister_resource(&self, handle: ResourceHandle) {
        if !self.ready || handle == NULL_RESOURCE_HANDLE {
            return;
        }
        if let Err(err) = self.drm.uuid_unregister(handle) {
            tracing::debug!(handle, %err, "resource unregister ignored");
        }
    }

    fn notify_session_start(&self) -> SessionToken {
        let payload = self.next_uuid();
        self.register_resource(ResourceClass::CommandQueue, &payload)
            .unwrap_or(NULL_SESSION_TOKEN)
    }

    fn notify_session_end(&self, token: SessionToken) {
        self.unregister_resource(token);
    }
}
