//! Per-device debug session.
//!
//! A session is opened once per device. If debugging is disabled by configuration, the family
//! is unknown, the kernel probe says no or the debug area cannot be set up, the session is
//! inactive: every operation returns a benign result and the kernel is never called again.
//!
//! Dropping an active session releases whatever is still registered, including modules the
//! driver never unregistered and a queue session left open.

use std::sync::Arc;

use gpudbg_abi::{
    decode_topology, StateBaseAddresses, StateSaveAreaHeader, TopologyCounts, TopologyInfo,
};

use crate::config::{DebuggerConfig, SbaTrackingMode};
use crate::debug_area::ModuleDebugArea;
use crate::family::FamilyDescriptor;
use crate::memory::{GpuAllocation, MemoryAllocator};
use crate::module::ModuleSegmentRegistry;
use crate::queue::CommandQueueLifecycleTracker;
use crate::registrar::{
    select_registrar, KernelResourceRegistrar, OsInterface, RegistrarPlatform, ResourceClass,
    ResourceHandle,
};
use crate::sba::SbaTrackingStore;
use crate::{ContextId, DebuggerError, Result};

struct ActiveSession {
    registrar: Arc<dyn KernelResourceRegistrar>,
    descriptor: FamilyDescriptor,
    sba: SbaTrackingStore,
    modules: ModuleSegmentRegistry,
    queues: CommandQueueLifecycleTracker,
    debug_area: ModuleDebugArea,
    save_area_handle: Option<ResourceHandle>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if let Some(handle) = self.save_area_handle.take() {
            self.registrar.unregister_resource(handle);
        }
    }
}

pub struct DebugSession {
    active: Option<ActiveSession>,
    topology: Option<TopologyCounts>,
}

impl DebugSession {
    /// Opens the session for a device, picking the registrar from `os`.
    pub fn open(
        config: &DebuggerConfig,
        family: Option<&FamilyDescriptor>,
        os: &OsInterface,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> Result<Self> {
        if !config.enabled || family.is_none() {
            return Self::with_registrar(config, family, None, allocator);
        }
        Self::with_registrar(config, family, Some(select_registrar(os)), allocator)
    }

    /// Opens the session over an already selected, not yet probed registrar.
    pub fn with_registrar(
        config: &DebuggerConfig,
        family: Option<&FamilyDescriptor>,
        registrar: Option<Box<dyn KernelResourceRegistrar>>,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> Result<Self> {
        let inactive = Self {
            active: None,
            topology: None,
        };
        if !config.enabled {
            tracing::debug!("debugging disabled by configuration");
            return Ok(inactive);
        }
        let Some(descriptor) = family.copied() else {
            tracing::debug!("no debug support for this device family");
            return Ok(inactive);
        };
        let Some(mut registrar) = registrar else {
            return Ok(inactive);
        };
        if !registrar.initialize_for_device() {
            tracing::debug!(platform = ?registrar.platform(), "kernel debug support unavailable");
            return Ok(inactive);
        }
        let registrar: Arc<dyn KernelResourceRegistrar> = Arc::from(registrar);

        let shared = config.sba_tracking_mode == SbaTrackingMode::Single;
        let debug_area = match ModuleDebugArea::create(allocator.clone(), registrar.clone(), shared)
        {
            Ok(area) => area,
            Err(err) => {
                tracing::warn!(%err, "module debug area unavailable; debugging disabled for this device");
                return Ok(inactive);
            }
        };

        let save_area = StateSaveAreaHeader::new(descriptor.save_area_version);
        let save_area_handle = match registrar
            .register_resource(ResourceClass::ContextSaveArea, &save_area.to_le_bytes())
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(%err, "state save area header not registered with the kernel");
                None
            }
        };

        tracing::debug!(
            family = descriptor.name,
            platform = ?registrar.platform(),
            mode = ?config.sba_tracking_mode,
            "debug session opened"
        );

        Ok(Self {
            active: Some(ActiveSession {
                sba: SbaTrackingStore::new(allocator, registrar.clone(), config.sba_tracking_mode),
                modules: ModuleSegmentRegistry::new(registrar.clone()),
                queues: CommandQueueLifecycleTracker::new(registrar.clone()),
                registrar,
                descriptor,
                debug_area,
                save_area_handle,
            }),
            topology: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn platform(&self) -> Option<RegistrarPlatform> {
        self.active.as_ref().map(|a| a.registrar.platform())
    }

    pub fn family(&self) -> Option<&FamilyDescriptor> {
        self.active.as_ref().map(|a| &a.descriptor)
    }

    pub fn on_queue_created(&self) {
        if let Some(active) = &self.active {
            active.queues.on_queue_created();
        }
    }

    pub fn on_queue_destroyed(&self) {
        if let Some(active) = &self.active {
            active.queues.on_queue_destroyed();
        }
    }

    pub fn register_module(&self, segments: &[Arc<GpuAllocation>]) -> Result<ResourceHandle> {
        match &self.active {
            Some(active) => active.modules.register_module(segments),
            None => Err(DebuggerError::Unsupported("debug session inactive")),
        }
    }

    pub fn unregister_module(&self, handle: ResourceHandle) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.modules.unregister_module(handle))
    }

    pub fn register_elf(&self, elf: &[u8], isa: &Arc<GpuAllocation>) -> Option<ResourceHandle> {
        self.active.as_ref()?.modules.register_elf(elf, isa)
    }

    /// Sets up state base address tracking for a context. `None` when the session is inactive.
    pub fn ensure_context(&self, context_id: ContextId) -> Result<Option<u64>> {
        match &self.active {
            Some(active) => active.sba.ensure_context(context_id).map(Some),
            None => Ok(None),
        }
    }

    /// Records the state base addresses a context is about to run with.
    ///
    /// Bindless bases are dropped for families that do not track them.
    pub fn capture_state_base_addresses(
        &self,
        context_id: ContextId,
        addresses: &StateBaseAddresses,
    ) -> Result<bool> {
        let Some(active) = &self.active else {
            return Ok(false);
        };
        let mut addresses = *addresses;
        if !active.descriptor.tracks_bindless {
            addresses.bindless_surface_state = 0;
            addresses.bindless_sampler_state = 0;
        }
        active.sba.record_addresses(context_id, &addresses)
    }

    pub fn tracking_address(&self, context_id: ContextId) -> Option<u64> {
        self.active
            .as_ref()
            .and_then(|a| a.sba.get_tracking_address(context_id).ok())
    }

    pub fn sba_tracking(&self) -> Option<&SbaTrackingStore> {
        self.active.as_ref().map(|a| &a.sba)
    }

    pub fn modules(&self) -> Option<&ModuleSegmentRegistry> {
        self.active.as_ref().map(|a| &a.modules)
    }

    pub fn queues(&self) -> Option<&CommandQueueLifecycleTracker> {
        self.active.as_ref().map(|a| &a.queues)
    }

    pub fn debug_area(&self) -> Option<&ModuleDebugArea> {
        self.active.as_ref().map(|a| &a.debug_area)
    }

    /// Decodes and caches the device topology.
    pub fn set_topology(&mut self, info: &TopologyInfo) -> Result<&TopologyCounts> {
        let counts = decode_topology(info)?;
        Ok(&*self.topology.insert(counts))
    }

    pub fn topology(&self) -> Option<&TopologyCounts> {
        self.topology.as_ref()
    }
}
