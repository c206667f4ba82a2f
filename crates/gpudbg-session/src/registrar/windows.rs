//! Escape-call registrar.
//!
//! Every operation is a single escape into the kernel-mode driver. The input block is a 16-byte
//! little-endian header followed by the payload:
//!
//! | offset | field          |
//! |--------|----------------|
//! | 0      | escape code    |
//! | 4      | class wire id  |
//! | 8      | payload size   |
//! | 12     | reserved (0)   |
//!
//! Outputs are a single little-endian `u32` (handle, token or capability bits).

use std::sync::Arc;

use thiserror::Error;

use super::{
    KernelResourceRegistrar, RegistrarCapabilities, RegistrarError, RegistrarPlatform,
    ResourceClass, ResourceHandle, SessionToken, NULL_RESOURCE_HANDLE, NULL_SESSION_TOKEN,
};

pub const ESCAPE_HEADER_SIZE_BYTES: usize = 16;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeCode {
    QueryDebugCaps = 0x100,
    RegisterResource = 0x101,
    UnregisterResource = 0x102,
    SessionStart = 0x103,
    SessionEnd = 0x104,
}

impl EscapeCode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x100 => Some(Self::QueryDebugCaps),
            0x101 => Some(Self::RegisterResource),
            0x102 => Some(Self::UnregisterResource),
            0x103 => Some(Self::SessionStart),
            0x104 => Some(Self::SessionEnd),
            _ => None,
        }
    }
}

/// Failure status returned by the kernel-mode driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("escape failed with status {0:#010x}")]
pub struct EscapeStatus(pub u32);

pub trait KmdEscape: Send + Sync {
    fn escape(&self, input: &[u8], output: &mut [u8]) -> Result<(), EscapeStatus>;
}

pub struct WindowsRegistrar {
    kmd: Arc<dyn KmdEscape>,
    capabilities: RegistrarCapabilities,
    ready: bool,
}

/// Builds an escape input block.
pub(crate) fn encode_escape(code: EscapeCode, class_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ESCAPE_HEADER_SIZE_BYTES + payload.len());
    out.extend_from_slice(&(code as u32).to_le_bytes());
    out.extend_from_slice(&class_id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

impl WindowsRegistrar {
    pub fn new(kmd: Arc<dyn KmdEscape>) -> Self {
        Self {
            kmd,
            capabilities: RegistrarCapabilities::empty(),
            ready: false,
        }
    }

    pub fn capabilities(&self) -> RegistrarCapabilities {
        self.capabilities
    }

    fn call(&self, code: EscapeCode, class_id: u32, payload: &[u8]) -> Result<u32, EscapeStatus> {
        let input = encode_escape(code, class_id, payload);
        let mut output = [0u8; 4];
        self.kmd.escape(&input, &mut output)?;
        Ok(u32::from_le_bytes(output))
    }
}

impl KernelResourceRegistrar for WindowsRegistrar {
    fn platform(&self) -> RegistrarPlatform {
        RegistrarPlatform::Windows
    }

    fn initialize_for_device(&mut self) -> bool {
        let caps = match self.call(EscapeCode::QueryDebugCaps, 0, &[]) {
            Ok(bits) => RegistrarCapabilities::from_bits_truncate(bits),
            Err(status) => {
                tracing::debug!(%status, "debug capability escape failed");
                return false;
            }
        };
        self.capabilities = caps;
        self.ready = caps.supports_debugging();
        if !self.ready {
            tracing::debug!(?caps, "kernel-mode driver does not support debug attach");
        }
        self.ready
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
        match self.call(EscapeCode::RegisterResource, class.wire_id(), payload) {
            Ok(handle) if handle != NULL_RESOURCE_HANDLE => Ok(handle),
            Ok(_) => Err(RegistrarError::Rejected(class)),
            Err(status) => {
                tracing::warn!(class = class.name(), %status, "resource registration escape failed");
                Err(RegistrarError::Rejected(class))
            }
        }
    }

    fn unregister_resource(&self, handle: ResourceHandle) {
        if !self.ready || handle == NULL_RESOURCE_HANDLE {
            return;
        }
        if let Err(status) = self.call(EscapeCode::UnregisterResource, 0, &handle.to_le_bytes()) {
            tracing::debug!(handle, %status, "resource unregister escape ignored");
        }
    }

    fn notify_session_start(&self) -> SessionToken {
        if !self.ready {
            return NULL_SESSION_TOKEN;
        }
        let payload = std::process::id().to_le_bytes();
        match self.call(
            EscapeCode::SessionStart,
            ResourceClass::CommandQueue.wire_id(),
            &payload,
        ) {
            Ok(token) => token,
            Err(status) => {
                tracing::warn!(%status, "session start escape failed");
                NULL_SESSION_TOKEN
            }
        }
    }

    fn notify_session_end(&self, token: SessionToken) {
        if !self.ready {
            return;
        }
        if let Err(status) = self.call(
            EscapeCode::SessionEnd,
            ResourceClass::CommandQueue.wire_id(),
            &token.to_le_bytes(),
        ) {
            tracing::warn!(token, %status, "session end escape failed");
        }
    }
}
