//! State base address tracking.
//!
//! Each tracked context owns a small GPU-visible buffer holding an [`SbaTrackedAddresses`]
//! record. The command-stream encoder emits stores into it whenever it reprograms state base
//! addresses, and an attached debugger reads it to translate surface/sampler offsets found in
//! thread state into GPU virtual addresses.
//!
//! The store only manages the buffers; it never builds GPU commands itself. Tracking buffers are
//! registered with the kernel as [`ResourceClass::SbaTrackingBuffer`] so a debugger can find
//! them; a refused registration is logged and tracking carries on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gpudbg_abi::{SbaField, SbaTrackedAddresses, StateBaseAddresses};

use crate::config::SbaTrackingMode;
use crate::memory::{AllocationKind, AllocationRequest, ContextAffinity, GpuAllocation, MemoryAllocator};
use crate::registrar::{KernelResourceRegistrar, ResourceClass, ResourceHandle};
use crate::{ContextId, DebuggerError, Result};

struct TrackingBuffer {
    allocation: Arc<GpuAllocation>,
    handle: Option<ResourceHandle>,
}

#[derive(Default)]
struct Tables {
    contexts: HashMap<ContextId, Arc<GpuAllocation>>,
    /// Set once in single-address-space mode.
    shared: Option<Arc<GpuAllocation>>,
    owned: Vec<TrackingBuffer>,
}

pub struct SbaTrackingStore {
    allocator: Arc<dyn MemoryAllocator>,
    registrar: Arc<dyn KernelResourceRegistrar>,
    mode: SbaTrackingMode,
    tables: Mutex<Tables>,
}

impl SbaTrackingStore {
    pub fn new(
        allocator: Arc<dyn MemoryAllocator>,
        registrar: Arc<dyn KernelResourceRegistrar>,
        mode: SbaTrackingMode,
    ) -> Self {
        Self {
            allocator,
            registrar,
            mode,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn mode(&self) -> SbaTrackingMode {
        self.mode
    }

    /// Makes sure `context_id` has a tracking buffer and returns its GPU VA.
    pub fn ensure_context(&self, context_id: ContextId) -> Result<u64> {
        {
            let mut tables = self.lock();
            if let Some(existing) = tables.contexts.get(&context_id) {
                return Ok(existing.gpu_va());
            }
            if let Some(shared) = tables.shared.clone() {
                let va = shared.gpu_va();
                tables.contexts.insert(context_id, shared);
                return Ok(va);
            }
        }

        // Allocate and register without holding the table lock; the allocator may block.
        let buffer = self.create_buffer(context_id)?;

        let mut tables = self.lock();
        let winner = tables
            .contexts
            .get(&context_id)
            .or(tables.shared.as_ref())
            .cloned();
        if let Some(winner) = winner {
            tables.contexts.insert(context_id, winner.clone());
            drop(tables);
            tracing::trace!(context_id, "lost tracking buffer race; releasing duplicate");
            self.release(buffer);
            return Ok(winner.gpu_va());
        }

        let allocation = buffer.allocation.clone();
        if self.mode == SbaTrackingMode::Single {
            tables.shared = Some(allocation.clone());
        }
        tables.contexts.insert(context_id, allocation.clone());
        tables.owned.push(buffer);
        tracing::debug!(context_id, gpu_va = allocation.gpu_va(), "tracking state base addresses");
        Ok(allocation.gpu_va())
    }

    /// Records the base addresses about to be programmed for `context_id`.
    ///
    /// Nothing is written unless general state, surface state or bindless surface state is
    /// non-zero. Only non-zero fields are stored; the others keep their previous value.
    pub fn record_addresses(
        &self,
        context_id: ContextId,
        addresses: &StateBaseAddresses,
    ) -> Result<bool> {
        let allocation = self.lookup(context_id)?;
        if !addresses.is_worth_tracking() {
            return Ok(false);
        }
        for (field, value) in addresses.programmed_fields() {
            self.allocator
                .write(&allocation, field.offset() as u64, &value.to_le_bytes())?;
        }
        Ok(true)
    }

    pub fn get_tracking_address(&self, context_id: ContextId) -> Result<u64> {
        Ok(self.lookup(context_id)?.gpu_va())
    }

    /// GPU VA of a single tracked field, for emitting the store into the command stream.
    pub fn field_address(&self, context_id: ContextId, field: SbaField) -> Result<u64> {
        Ok(self.get_tracking_address(context_id)? + field.offset() as u64)
    }

    /// Reads the tracking buffer back the way an attached debugger does.
    pub fn snapshot(&self, context_id: ContextId) -> Result<SbaTrackedAddresses> {
        let allocation = self.lookup(context_id)?;
        let mut raw = [0u8; SbaTrackedAddresses::SIZE_BYTES];
        self.allocator.read(&allocation, 0, &mut raw)?;
        Ok(SbaTrackedAddresses::decode_from_le_bytes(&raw)?)
    }

    pub fn tracked_contexts(&self) -> usize {
        self.lock().contexts.len()
    }

    fn lookup(&self, context_id: ContextId) -> Result<Arc<GpuAllocation>> {
        self.lock()
            .contexts
            .get(&context_id)
            .cloned()
            .ok_or(DebuggerError::NotFound(context_id))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create_buffer(&self, context_id: ContextId) -> Result<TrackingBuffer> {
        let affinity = match self.mode {
            SbaTrackingMode::PerContext => ContextAffinity::Context(context_id),
            SbaTrackingMode::Single => ContextAffinity::Device,
        };
        let size_bytes = SbaTrackedAddresses::SIZE_BYTES as u64;
        let allocation = self
            .allocator
            .allocate(AllocationRequest {
                size_bytes,
                kind: AllocationKind::SbaTrackingBuffer,
                affinity,
            })
            .map_err(|source| DebuggerError::AllocationFailure { size_bytes, source })?;

        let header = SbaTrackedAddresses::new().to_le_bytes();
        if let Err(err) = self.allocator.write(&allocation, 0, &header) {
            self.allocator.free(allocation);
            return Err(err.into());
        }

        let handle = match self
            .registrar
            .register_resource(ResourceClass::SbaTrackingBuffer, &allocation.gpu_va().to_le_bytes())
        {
            Ok(handle) => {
                allocation.link_resource(handle);
                Some(handle)
            }
            Err(err) => {
                tracing::warn!(context_id, %err, "tracking buffer not registered with the kernel");
                None
            }
        };

        Ok(TrackingBuffer { allocation, handle })
    }

    fn release(&self, buffer: TrackingBuffer) {
        if let Some(handle) = buffer.handle {
            self.registrar.unregister_resource(handle);
        }
        self.allocator.free(buffer.allocation);
    }
}

impl Drop for SbaTrackingStore {
    fn drop(&mut self) {
        let tables = std::mem::take(&mut *self.lock());
        for buffer in tables.owned {
            self.release(buffer);
        }
    }
}
