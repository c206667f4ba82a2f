//! Device manager: the context object every device is opened through.

use std::sync::Arc;

use crate::cache::{CacheRegionAllocator, CacheReservation, ClosCacheReservation, NullCacheReservation};
use crate::config::DebuggerConfig;
use crate::family::{FamilyRegistry, GpuFamily};
use crate::memory::MemoryAllocator;
use crate::registrar::OsInterface;
use crate::session::DebugSession;
use crate::Result;

#[derive(Debug, Clone)]
pub struct DeviceManager {
    config: DebuggerConfig,
    families: FamilyRegistry,
}

impl DeviceManager {
    /// Manager with the built-in families.
    pub fn new(config: DebuggerConfig) -> Self {
        Self::with_families(config, FamilyRegistry::bootstrap())
    }

    pub fn with_families(config: DebuggerConfig, families: FamilyRegistry) -> Self {
        Self { config, families }
    }

    /// Built-in families, configured from the environment.
    pub fn from_env() -> Self {
        Self::new(DebuggerConfig::from_env())
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn families(&self) -> &FamilyRegistry {
        &self.families
    }

    pub fn families_mut(&mut self) -> &mut FamilyRegistry {
        &mut self.families
    }

    pub fn open_session(
        &self,
        family: GpuFamily,
        os: &OsInterface,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> Result<DebugSession> {
        DebugSession::open(&self.config, self.families.get(family), os, allocator)
    }

    /// Cache region allocator for a device. `None` for unknown families.
    ///
    /// Hosts without the class-of-service ioctls get an allocator that never reserves.
    pub fn open_cache_allocator(
        &self,
        family: GpuFamily,
        os: &OsInterface,
    ) -> Option<CacheRegionAllocator> {
        let descriptor = self.families.get(family)?;
        let backend: Box<dyn CacheReservation> = match os {
            OsInterface::Linux(drm) => Box::new(ClosCacheReservation::new(drm.clone())),
            OsInterface::Windows(_) | OsInterface::Unavailable => Box::new(NullCacheReservation),
        };
        Some(CacheRegionAllocator::new(
            descriptor.cache,
            self.config.clos_num_cache_ways,
            backend,
        ))
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new(DebuggerConfig::default())
    }
}
