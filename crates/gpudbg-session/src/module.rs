//! Module registration for symbolication.
//!
//! A module is the group of segment allocations a device binary was loaded into. The kernel sees
//! it as one [`ResourceClass::ZebinModule`] resource whose payload is the segment count, and every
//! segment allocation is linked to that resource so the kernel binds them together and a debugger
//! can map an instruction pointer back to the module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::memory::GpuAllocation;
use crate::registrar::{KernelResourceRegistrar, ResourceClass, ResourceHandle, NULL_RESOURCE_HANDLE};
use crate::{DebuggerError, Result};

pub struct ModuleSegmentRegistry {
    registrar: Arc<dyn KernelResourceRegistrar>,
    modules: Mutex<HashMap<ResourceHandle, Vec<Arc<GpuAllocation>>>>,
}

impl ModuleSegmentRegistry {
    pub fn new(registrar: Arc<dyn KernelResourceRegistrar>) -> Self {
        Self {
            registrar,
            modules: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_module(&self, segments: &[Arc<GpuAllocation>]) -> Result<ResourceHandle> {
        if !self.registrar.has_channel() {
            return Err(DebuggerError::Unsupported("no kernel registration channel"));
        }

        let count = u32::try_from(segments.len()).unwrap_or(u32::MAX);
        let handle = self
            .registrar
            .register_resource(ResourceClass::ZebinModule, &count.to_le_bytes())?;
        for segment in segments {
            segment.link_resource(handle);
        }

        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle, segments.to_vec());
        tracing::debug!(handle, segments = count, "registered module");
        Ok(handle)
    }

    /// Returns `false` without calling the kernel for the null handle or when there is no
    /// registration channel.
    pub fn unregister_module(&self, handle: ResourceHandle) -> bool {
        if handle == NULL_RESOURCE_HANDLE || !self.registrar.has_channel() {
            return false;
        }

        self.registrar.unregister_resource(handle);
        let segments = self
            .modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle);
        for segment in segments.iter().flatten() {
            segment.unlink_resource(handle);
        }
        true
    }

    /// Registers a device ELF and links it with the ISA allocation holding its code.
    ///
    /// Release the handle with [`ModuleSegmentRegistry::unregister_module`], which also unlinks
    /// the ISA.
    pub fn register_elf(&self, elf: &[u8], isa: &Arc<GpuAllocation>) -> Option<ResourceHandle> {
        if !self.registrar.has_channel() {
            return None;
        }
        match self.registrar.register_resource(ResourceClass::ElfBinary, elf) {
            Ok(handle) => {
                isa.link_resource(handle);
                self.modules
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(handle, vec![isa.clone()]);
                Some(handle)
            }
            Err(err) => {
                tracing::warn!(%err, "ELF not registered with the kernel");
                None
            }
        }
    }

    pub fn segments(&self, handle: ResourceHandle) -> Option<Vec<Arc<GpuAllocation>>> {
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&handle)
            .cloned()
    }

    pub fn module_count(&self) -> usize {
        self.modules.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for ModuleSegmentRegistry {
    fn drop(&mut self) {
        let modules = std::mem::take(self.modules.get_mut().unwrap_or_else(|e| e.into_inner()));
        for (handle, segments) in modules {
            tracing::debug!(handle, "unregistering module left at teardown");
            self.registrar.unregister_resource(handle);
            for segment in &segments {
                segment.unlink_resource(handle);
            }
        }
    }
}
