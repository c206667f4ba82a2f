//! Contract with the device memory allocator, plus an in-process implementation.
//!
//! The debug subsystem never owns a memory manager. It asks the device's allocator for small
//! GPU-visible buffers (tracking records, the debug area page) and writes them through a CPU
//! mapping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::registrar::ResourceHandle;
use crate::ContextId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of device memory (requested {requested} bytes, {available} available)")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("access out of bounds (offset={offset}, len={len}, size={size})")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("unknown allocation {0}")]
    UnknownAllocation(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    SbaTrackingBuffer,
    DebugArea,
    KernelIsa,
    Other,
}

/// Which context the allocation has to be visible to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextAffinity {
    /// Mapped into every context of the device.
    Device,
    Context(ContextId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub size_bytes: u64,
    pub kind: AllocationKind,
    pub affinity: ContextAffinity,
}

/// A GPU-visible buffer handed out by a [`MemoryAllocator`].
///
/// Besides its placement the allocation carries the kernel resource handles it was linked with,
/// which the kernel driver binds alongside the buffer so a debugger can map addresses inside it
/// back to a registered module or ELF.
#[derive(Debug)]
pub struct GpuAllocation {
    id: u64,
    gpu_va: u64,
    size_bytes: u64,
    kind: AllocationKind,
    affinity: ContextAffinity,
    linked: Mutex<Vec<ResourceHandle>>,
}

impl GpuAllocation {
    pub fn new(
        id: u64,
        gpu_va: u64,
        size_bytes: u64,
        kind: AllocationKind,
        affinity: ContextAffinity,
    ) -> Self {
        Self {
            id,
            gpu_va,
            size_bytes,
            kind,
            affinity,
            linked: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gpu_va(&self) -> u64 {
        self.gpu_va
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    pub fn affinity(&self) -> ContextAffinity {
        self.affinity
    }

    pub fn link_resource(&self, handle: ResourceHandle) {
        let mut linked = self.linked.lock().unwrap_or_else(|e| e.into_inner());
        if !linked.contains(&handle) {
            linked.push(handle);
        }
    }

    pub fn unlink_resource(&self, handle: ResourceHandle) {
        let mut linked = self.linked.lock().unwrap_or_else(|e| e.into_inner());
        linked.retain(|h| *h != handle);
    }

    pub fn linked_resources(&self) -> Vec<ResourceHandle> {
        self.linked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), MemoryError> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size_bytes => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                len,
                size: self.size_bytes,
            }),
        }
    }
}

pub trait MemoryAllocator: Send + Sync {
    fn allocate(&self, request: AllocationRequest) -> Result<Arc<GpuAllocation>, MemoryError>;

    fn free(&self, allocation: Arc<GpuAllocation>);

    /// Writes through the allocation's CPU mapping.
    fn write(&self, allocation: &GpuAllocation, offset: u64, src: &[u8]) -> Result<(), MemoryError>;

    fn read(&self, allocation: &GpuAllocation, offset: u64, dst: &mut [u8]) -> Result<(), MemoryError>;
}

/// Allocator backed by host memory, with GPU VAs handed out from a bump pointer.
///
/// Used by tests and host-side tooling that replays debugger views without a device.
#[derive(Debug)]
pub struct HostMemoryAllocator {
    next_id: AtomicU64,
    state: Mutex<HostState>,
}

#[derive(Debug)]
struct HostState {
    next_va: u64,
    capacity_bytes: u64,
    used_bytes: u64,
    backing: HashMap<u64, Vec<u8>>,
}

impl HostMemoryAllocator {
    pub const BASE_VA: u64 = 0x0001_0000_0000;
    const VA_ALIGNMENT: u64 = 0x1000;

    pub fn new() -> Self {
        Self::with_capacity(u64::MAX)
    }

    /// Allocator that fails once `capacity_bytes` are live.
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(HostState {
                next_va: Self::BASE_VA,
                capacity_bytes,
                used_bytes: 0,
                backing: HashMap::new(),
            }),
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).backing.len()
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).used_bytes
    }
}

impl Default for HostMemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAllocator for HostMemoryAllocator {
    fn allocate(&self, request: AllocationRequest) -> Result<Arc<GpuAllocation>, MemoryError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let available = state.capacity_bytes.saturating_sub(state.used_bytes);
        let len = usize::try_from(request.size_bytes).ok();
        let (Some(len), true) = (len, request.size_bytes <= available) else {
            return Err(MemoryError::OutOfMemory {
                requested: request.size_bytes,
                available,
            });
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let gpu_va = state.next_va;
        let span = request
            .size_bytes
            .max(1)
            .div_ceil(Self::VA_ALIGNMENT)
            .saturating_mul(Self::VA_ALIGNMENT);
        state.next_va = state.next_va.saturating_add(span);
        state.used_bytes += request.size_bytes;
        state.backing.insert(id, vec![0u8; len]);

        Ok(Arc::new(GpuAllocation::new(
            id,
            gpu_va,
            request.size_bytes,
            request.kind,
            request.affinity,
        )))
    }

    fn free(&self, allocation: Arc<GpuAllocation>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.backing.remove(&allocation.id()).is_some() {
            state.used_bytes = state.used_bytes.saturating_sub(allocation.size_bytes());
        } else {
            tracing::warn!(id = allocation.id(), "free of unknown host allocation");
        }
    }

    fn write(&self, allocation: &GpuAllocation, offset: u64, src: &[u8]) -> Result<(), MemoryError> {
        allocation.check_range(offset, src.len())?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let buf = state
            .backing
            .get_mut(&allocation.id())
            .ok_or(MemoryError::UnknownAllocation(allocation.id()))?;
        let start = offset as usize;
        buf[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read(&self, allocation: &GpuAllocation, offset: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        allocation.check_range(offset, dst.len())?;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let buf = state
            .backing
            .get(&allocation.id())
            .ok_or(MemoryError::UnknownAllocation(allocation.id()))?;
        let start = offset as usize;
        dst.copy_from_slice(&buf[start..start + dst.len()]);
        Ok(())
    }
}
