//! Fake kernel interfaces for tests.
//!
//! - [`FakeDrmDevice`]: in-memory DRM device with UUID and class-of-service bookkeeping.
//! - [`FakeKmd`]: kernel-mode driver answering escape calls.
//! - [`RecordingRegistrar`]: registrar that logs every call it receives.
//! - [`FakeClosBackend`]: cache reservation backend with a fixed pool of regions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::{CacheLevel, CacheRegionId, CacheReservation};
use crate::registrar::{
    DrmDevice, EscapeCode, EscapeStatus, KernelResourceRegistrar, KmdEscape,
    RegistrarCapabilities, RegistrarError, RegistrarPlatform, ResourceClass, ResourceHandle,
    SessionToken, ESCAPE_HEADER_SIZE_BYTES, NULL_RESOURCE_HANDLE, UUID_CLASS_STRING,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeUuid {
    pub class_handle: u32,
    pub uuid: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct DrmState {
    next_handle: u32,
    uuids: HashMap<u32, FakeUuid>,
    fail_uuid_register: bool,
    fail_cache_reserve: bool,
    free_clos: BTreeSet<u16>,
    reserved_clos: BTreeSet<u16>,
    cache_ways: HashMap<u16, (u16, u16)>,
}

#[derive(Debug)]
pub struct FakeDrmDevice {
    vm_bind: bool,
    debugger_attach: bool,
    ioctls: AtomicUsize,
    state: Mutex<DrmState>,
}

impl FakeDrmDevice {
    /// Debug-capable device with three free class-of-service indices.
    pub fn new() -> Self {
        Self::with_capabilities(true, true)
    }

    pub fn with_capabilities(vm_bind: bool, debugger_attach: bool) -> Self {
        let state = DrmState {
            next_handle: 1,
            free_clos: (1..=3).collect(),
            ..Default::default()
        };
        Self {
            vm_bind,
            debugger_attach,
            ioctls: AtomicUsize::new(0),
            state: Mutex::new(state),
        }
    }

    pub fn with_clos_count(self, count: u16) -> Self {
        lock(&self.state).free_clos = (1..=count).collect();
        self
    }

    pub fn ioctl_count(&self) -> usize {
        self.ioctls.load(Ordering::SeqCst)
    }

    pub fn fail_uuid_register(&self, fail: bool) {
        lock(&self.state).fail_uuid_register = fail;
    }

    pub fn fail_cache_reserve(&self, fail: bool) {
        lock(&self.state).fail_cache_reserve = fail;
    }

    pub fn uuid(&self, handle: u32) -> Option<FakeUuid> {
        lock(&self.state).uuids.get(&handle).cloned()
    }

    /// Handle the class called `name` was registered under.
    pub fn class_handle_named(&self, name: &str) -> Option<u32> {
        lock(&self.state).uuids.iter().find_map(|(handle, uuid)| {
            (uuid.class_handle == UUID_CLASS_STRING && uuid.payload == name.as_bytes())
                .then_some(*handle)
        })
    }

    /// Live UUIDs registered against `class_handle`, ordered by handle.
    pub fn uuids_of_class(&self, class_handle: u32) -> Vec<(u32, FakeUuid)> {
        let state = lock(&self.state);
        let mut out: Vec<_> = state
            .uuids
            .iter()
            .filter(|(_, uuid)| uuid.class_handle == class_handle)
            .map(|(handle, uuid)| (*handle, uuid.clone()))
            .collect();
        out.sort_by_key(|(handle, _)| *handle);
        out
    }

    pub fn live_uuids(&self) -> usize {
        lock(&self.state).uuids.len()
    }

    /// `(level, ways)` currently assigned to `clos`.
    pub fn cache_ways(&self, clos: u16) -> Option<(u16, u16)> {
        lock(&self.state).cache_ways.get(&clos).copied()
    }

    pub fn reserved_clos(&self) -> usize {
        lock(&self.state).reserved_clos.len()
    }

    fn ioctl(&self) -> MutexGuard<'_, DrmState> {
        self.ioctls.fetch_add(1, Ordering::SeqCst);
        lock(&self.state)
    }
}

impl Default for FakeDrmDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DrmDevice for FakeDrmDevice {
    fn query_vm_bind(&self) -> io::Result<bool> {
        let _state = self.ioctl();
        Ok(self.vm_bind)
    }

    fn query_debugger_attach(&self) -> io::Result<bool> {
        let _state = self.ioctl();
        Ok(self.debugger_attach)
    }

    fn uuid_register(&self, class_handle: u32, uuid: &[u8; 36], payload: &[u8]) -> io::Result<u32> {
        let mut state = self.ioctl();
        if state.fail_uuid_register {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        if class_handle != UUID_CLASS_STRING && !state.uuids.contains_key(&class_handle) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let uuid = String::from_utf8(uuid.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.uuids.insert(
            handle,
            FakeUuid {
                class_handle,
                uuid,
                payload: payload.to_vec(),
            },
        );
        Ok(handle)
    }

    fn uuid_unregister(&self, handle: u32) -> io::Result<()> {
        let mut state = self.ioctl();
        state
            .uuids
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn clos_reserve(&self) -> io::Result<u16> {
        let mut state = self.ioctl();
        let clos = state
            .free_clos
            .pop_first()
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        state.reserved_clos.insert(clos);
        Ok(clos)
    }

    fn clos_free(&self, clos: u16) -> io::Result<()> {
        let mut state = self.ioctl();
        if !state.reserved_clos.remove(&clos) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        state.cache_ways.remove(&clos);
        state.free_clos.insert(clos);
        Ok(())
    }

    fn cache_reserve(&self, clos: u16, level: u16, num_ways: u16) -> io::Result<()> {
        let mut state = self.ioctl();
        if state.fail_cache_reserve {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        }
        if !state.reserved_clos.contains(&clos) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        if num_ways == 0 {
            state.cache_ways.remove(&clos);
        } else {
            state.cache_ways.insert(clos, (level, num_ways));
        }
        Ok(())
    }
}

/// One escape as decoded by [`FakeKmd`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeEscape {
    pub code: EscapeCode,
    pub class_id: u32,
    pub payload: Vec<u8>,
}

pub const STATUS_UNSUCCESSFUL: u32 = 0xC000_0001;
pub const STATUS_INVALID_HANDLE: u32 = 0xC000_0008;
pub const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;

#[derive(Debug, Default)]
struct KmdState {
    next_handle: u32,
    resources: HashMap<u32, (u32, Vec<u8>)>,
    sessions: BTreeSet<u32>,
    failing: HashSet<u32>,
    log: Vec<FakeEscape>,
}

#[derive(Debug)]
pub struct FakeKmd {
    caps: RegistrarCapabilities,
    state: Mutex<KmdState>,
}

impl FakeKmd {
    pub fn new(caps: RegistrarCapabilities) -> Self {
        Self {
            caps,
            state: Mutex::new(KmdState {
                next_handle: 0x100,
                ..Default::default()
            }),
        }
    }

    /// Driver reporting full debug support.
    pub fn supported() -> Self {
        Self::new(RegistrarCapabilities::all())
    }

    /// Makes every later escape with `code` fail.
    pub fn fail(&self, code: EscapeCode) {
        lock(&self.state).failing.insert(code as u32);
    }

    pub fn escape_count(&self) -> usize {
        lock(&self.state).log.len()
    }

    pub fn escapes(&self) -> Vec<FakeEscape> {
        lock(&self.state).log.clone()
    }

    /// Live resources as `(handle, class wire id, payload)`, ordered by handle.
    pub fn live_resources(&self) -> Vec<(u32, u32, Vec<u8>)> {
        let state = lock(&self.state);
        let mut out: Vec<_> = state
            .resources
            .iter()
            .map(|(handle, (class, payload))| (*handle, *class, payload.clone()))
            .collect();
        out.sort_by_key(|(handle, _, _)| *handle);
        out
    }

    pub fn open_sessions(&self) -> usize {
        lock(&self.state).sessions.len()
    }
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl KmdEscape for FakeKmd {
    fn escape(&self, input: &[u8], output: &mut [u8]) -> Result<(), EscapeStatus> {
        let invalid = EscapeStatus(STATUS_INVALID_PARAMETER);
        let code = read_u32(input, 0)
            .and_then(EscapeCode::from_u32)
            .ok_or(invalid)?;
        let class_id = read_u32(input, 4).ok_or(invalid)?;
        let payload_len = read_u32(input, 8).ok_or(invalid)? as usize;
        let payload = input
            .get(ESCAPE_HEADER_SIZE_BYTES..ESCAPE_HEADER_SIZE_BYTES + payload_len)
            .ok_or(invalid)?;
        if output.len() < 4 {
            return Err(invalid);
        }

        let mut state = lock(&self.state);
        state.log.push(FakeEscape {
            code,
            class_id,
            payload: payload.to_vec(),
        });
        if state.failing.contains(&(code as u32)) {
            return Err(EscapeStatus(STATUS_UNSUCCESSFUL));
        }

        let value = match code {
            EscapeCode::QueryDebugCaps => self.caps.bits(),
            EscapeCode::RegisterResource => {
                let handle = state.next_handle;
                state.next_handle += 1;
                state.resources.insert(handle, (class_id, payload.to_vec()));
                handle
            }
            EscapeCode::UnregisterResource => {
                let handle = read_u32(payload, 0).ok_or(invalid)?;
                state
                    .resources
                    .remove(&handle)
                    .ok_or(EscapeStatus(STATUS_INVALID_HANDLE))?;
                0
            }
            EscapeCode::SessionStart => {
                let token = state.next_handle;
                state.next_handle += 1;
                state.sessions.insert(token);
                token
            }
            EscapeCode::SessionEnd => {
                let token = read_u32(payload, 0).ok_or(invalid)?;
                if !state.sessions.remove(&token) {
                    return Err(EscapeStatus(STATUS_INVALID_HANDLE));
                }
                0
            }
        };
        output[..4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarCall {
    Initialize,
    /// `handle` is [`NULL_RESOURCE_HANDLE`] when the registration failed.
    Register {
        class: ResourceClass,
        payload: Vec<u8>,
        handle: ResourceHandle,
    },
    Unregister(ResourceHandle),
    SessionStart(SessionToken),
    SessionEnd(SessionToken),
}

#[derive(Debug, Default)]
struct Recording {
    calls: Vec<RegistrarCall>,
    rejected: HashSet<ResourceClass>,
}

/// Registrar that logs every call. Clones share the same log.
#[derive(Debug, Clone)]
pub struct RecordingRegistrar {
    supported: bool,
    next_handle: Arc<AtomicU32>,
    recording: Arc<Mutex<Recording>>,
}

impl RecordingRegistrar {
    pub fn supported() -> Self {
        Self::new(true)
    }

    /// Registrar whose probe fails and which has no channel.
    pub fn unsupported() -> Self {
        Self::new(false)
    }

    fn new(supported: bool) -> Self {
        Self {
            supported,
            next_handle: Arc::new(AtomicU32::new(1)),
            recording: Arc::new(Mutex::new(Recording::default())),
        }
    }

    /// Makes the kernel refuse every later registration of `class`.
    pub fn reject(&self, class: ResourceClass) {
        lock(&self.recording).rejected.insert(class);
    }

    pub fn calls(&self) -> Vec<RegistrarCall> {
        lock(&self.recording).calls.clone()
    }

    /// Successful registrations of `class` as `(handle, payload)`.
    pub fn registrations(&self, class: ResourceClass) -> Vec<(ResourceHandle, Vec<u8>)> {
        lock(&self.recording)
            .calls
            .iter()
            .filter_map(|call| match call {
                RegistrarCall::Register {
                    class: c,
                    payload,
                    handle,
                } if *c == class && *handle != NULL_RESOURCE_HANDLE => {
                    Some((*handle, payload.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Session start/end notifications in the order they were issued.
    pub fn session_events(&self) -> Vec<RegistrarCall> {
        lock(&self.recording)
            .calls
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    RegistrarCall::SessionStart(_) | RegistrarCall::SessionEnd(_)
                )
            })
            .cloned()
            .collect()
    }

    pub fn session_starts(&self) -> usize {
        self.session_events()
            .iter()
            .filter(|call| matches!(call, RegistrarCall::SessionStart(_)))
            .count()
    }

    pub fn session_ends(&self) -> usize {
        self.session_events()
            .iter()
            .filter(|call| matches!(call, RegistrarCall::SessionEnd(_)))
            .count()
    }

    fn record(&self, call: RegistrarCall) {
        lock(&self.recording).calls.push(call);
    }
}

impl KernelResourceRegistrar for RecordingRegistrar {
    fn platform(&self) -> RegistrarPlatform {
        RegistrarPlatform::Null
    }

    fn initialize_for_device(&mut self) -> bool {
        self.record(RegistrarCall::Initialize);
        self.supported
    }

    fn has_channel(&self) -> bool {
        self.supported
    }

    fn register_resource(
        &self,
        class: ResourceClass,
        payload: &[u8],
    ) -> Result<ResourceHandle, RegistrarError> {
        let mut recording = lock(&self.recording);
        let result = if !self.supported {
            Err(RegistrarError::Unsupported)
        } else if recording.rejected.contains(&class) {
            Err(RegistrarError::Rejected(class))
        } else {
            Ok(self.next_handle.fetch_add(1, Ordering::SeqCst))
        };
        recording.calls.push(RegistrarCall::Register {
            class,
            payload: payload.to_vec(),
            handle: *result.as_ref().unwrap_or(&NULL_RESOURCE_HANDLE),
        });
        result
    }

    fn unregister_resource(&self, handle: ResourceHandle) {
        self.record(RegistrarCall::Unregister(handle));
    }

    fn notify_session_start(&self) -> SessionToken {
        let token = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.record(RegistrarCall::SessionStart(token));
        token
    }

    fn notify_session_end(&self, token: SessionToken) {
        self.record(RegistrarCall::SessionEnd(token));
    }
}

#[derive(Debug, Default)]
struct ClosState {
    free: BTreeSet<u16>,
    forced: Option<CacheRegionId>,
    ways: HashMap<CacheRegionId, u16>,
    reserve_calls: usize,
}

/// Cache reservation backend over a pool of region indices `1..=count`. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeClosBackend {
    state: Arc<Mutex<ClosState>>,
}

impl FakeClosBackend {
    pub fn new(count: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClosState {
                free: (1..=count).collect(),
                ..Default::default()
            })),
        }
    }

    /// The next reservation returns `region` regardless of the pool.
    pub fn force_next(&self, region: CacheRegionId) {
        lock(&self.state).forced = Some(region);
    }

    pub fn reserve_calls(&self) -> usize {
        lock(&self.state).reserve_calls
    }

    pub fn ways(&self, region: CacheRegionId) -> Option<u16> {
        lock(&self.state).ways.get(&region).copied()
    }
}

impl CacheReservation for FakeClosBackend {
    fn reserve(&self, _level: CacheLevel, num_ways: u16) -> Option<CacheRegionId> {
        let mut state = lock(&self.state);
        state.reserve_calls += 1;
        let region = match state.forced.take() {
            Some(region) => {
                state.free.remove(&region.0);
                region
            }
            None => CacheRegionId(state.free.pop_first()?),
        };
        state.ways.insert(region, num_ways);
        Some(region)
    }

    fn free(&self, _level: CacheLevel, region: CacheRegionId) {
        let mut state = lock(&self.state);
        state.ways.remove(&region);
        state.free.insert(region.0);
    }
}
