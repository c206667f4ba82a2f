use super::{
    KernelResourceRegistrar, RegistrarError, RegistrarPlatform, ResourceClass, ResourceHandle,
    SessionToken, NULL_SESSION_TOKEN,
};

/// Registrar for hosts without any kernel debug channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRegistrar;

impl KernelResourceRegistrar for NullRegistrar {
    fn platform(&self) -> RegistrarPlatform {
        RegistrarPlatform::Null
    }

    fn initialize_for_device(&mut self) -> bool {
        false
    }

    fn has_channel(&self) -> bool {
        false
    }

    fn register_resource(
        &self,
        _class: ResourceClass,
        _payload: &[u8],
    ) -> Result<ResourceHandle, RegistrarError> {
        Err(RegistrarError::Unsupported)
    }

    fn unregister_resource(&self, _handle: ResourceHandle) {}

    fn notify_session_start(&self) -> SessionToken {
        NULL_SESSION_TOKEN
    }

    fn notify_session_end(&self, _token: SessionToken) {}
}
