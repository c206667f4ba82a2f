//! Module heap debug area.
//!
//! One page per device, starting with a [`DebugAreaHeader`]. The page is registered with the
//! kernel under [`ResourceClass::ModuleHeapDebugArea`] with its GPU VA as payload, which is how
//! a debugger locates it.

use std::sync::Arc;

use gpudbg_abi::DebugAreaHeader;

use crate::memory::{AllocationKind, AllocationRequest, ContextAffinity, GpuAllocation, MemoryAllocator};
use crate::registrar::{KernelResourceRegistrar, ResourceClass, ResourceHandle};
use crate::{DebuggerError, Result};

pub struct ModuleDebugArea {
    allocator: Arc<dyn MemoryAllocator>,
    registrar: Arc<dyn KernelResourceRegistrar>,
    allocation: Option<Arc<GpuAllocation>>,
    handle: Option<ResourceHandle>,
}

impl ModuleDebugArea {
    pub fn create(
        allocator: Arc<dyn MemoryAllocator>,
        registrar: Arc<dyn KernelResourceRegistrar>,
        shared: bool,
    ) -> Result<Self> {
        let header = DebugAreaHeader::new(shared);
        let size_bytes = u64::from(header.area_size_bytes());
        let allocation = allocator
            .allocate(AllocationRequest {
                size_bytes,
                kind: AllocationKind::DebugArea,
                affinity: ContextAffinity::Device,
            })
            .map_err(|source| DebuggerError::AllocationFailure { size_bytes, source })?;

        if let Err(err) = allocator.write(&allocation, 0, &header.to_le_bytes()) {
            allocator.free(allocation);
            return Err(err.into());
        }

        let handle = match registrar.register_resource(
            ResourceClass::ModuleHeapDebugArea,
            &allocation.gpu_va().to_le_bytes(),
        ) {
            Ok(handle) => {
                allocation.link_resource(handle);
                Some(handle)
            }
            Err(err) => {
                tracing::warn!(%err, "module debug area not registered with the kernel");
                None
            }
        };

        Ok(Self {
            allocator,
            registrar,
            allocation: Some(allocation),
            handle,
        })
    }

    pub fn gpu_va(&self) -> u64 {
        self.allocation.as_ref().map_or(0, |a| a.gpu_va())
    }

    pub fn handle(&self) -> Option<ResourceHandle> {
        self.handle
    }

    /// Reads the header back and validates it.
    pub fn header(&self) -> Result<DebugAreaHeader> {
        let Some(allocation) = &self.allocation else {
            return Err(DebuggerError::Unsupported("debug area released"));
        };
        let mut raw = [0u8; DebugAreaHeader::SIZE_BYTES];
        self.allocator.read(allocation, 0, &mut raw)?;
        let header = DebugAreaHeader::decode_from_le_bytes(&raw)?;
        header.validate()?;
        Ok(header)
    }
}

impl Drop for ModuleDebugArea {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.registrar.unregister_resource(handle);
        }
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free(allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use gpudbg_abi::GPU_PAGE_SIZE_BYTES;

    use crate::memory::HostMemoryAllocator;
    use crate::test_utils::{RecordingRegistrar, RegistrarCall};

    #[test]
    fn area_is_one_page_with_a_valid_header() {
        let allocator = Arc::new(HostMemoryAllocator::new());
        let registrar = RecordingRegistrar::supported();
        let area = ModuleDebugArea::create(allocator.clone(), Arc::new(registrar.clone()), true).unwrap();

        assert_eq!(allocator.used_bytes(), u64::from(GPU_PAGE_SIZE_BYTES));
        let header = area.header().unwrap();
        assert!(header.is_shared());
        assert_eq!(header.size, 32);

        let handle = area.handle().unwrap();
        assert_eq!(
            registrar.registrations(ResourceClass::ModuleHeapDebugArea),
            vec![(handle, area.gpu_va().to_le_bytes().to_vec())]
        );
    }

    #[test]
    fn drop_unregisters_and_frees() {
        let allocator = Arc::new(HostMemoryAllocator::new());
        let registrar = RecordingRegistrar::supported();
        let area = ModuleDebugArea::create(allocator.clone(), Arc::new(registrar.clone()), false).unwrap();
        let handle = area.handle().unwrap();
        drop(area);

        assert_eq!(allocator.live_allocations(), 0);
        assert_eq!(registrar.calls().last(), Some(&RegistrarCall::Unregister(handle)));
    }

    #[test]
    fn allocation_failure_is_reported() {
        let allocator = Arc::new(HostMemoryAllocator::with_capacity(64));
        let result = ModuleDebugArea::create(allocator, Arc::new(RecordingRegistrar::supported()), false);
        assert!(matches!(
            result,
            Err(DebuggerError::AllocationFailure { size_bytes: 4096, .. })
        ));
    }
}
