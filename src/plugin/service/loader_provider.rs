//! Loader provider service: teaches the registry a new loader kind.

use super::{ServiceBehavior, ServiceContext};
use crate::plugin::host::Host;
use crate::plugin::loader::LoaderFactory;
use crate::plugin::types::ServiceType;
use crate::plugin::PluginResult;

pub struct LoaderProviderService {
    /// Loader kind other plugins name in their `[loader]` table.
    pub loader_id: String,
    factory: Option<LoaderFactory>,
    registered: bool,
}

impl LoaderProviderService {
    pub fn new(loader_id: impl Into<String>) -> Self {
        Self { loader_id: loader_id.into(), factory: None, registered: false }
    }

    pub fn bind(&mut self, factory: LoaderFactory) {
        self.factory = Some(factory);
    }

    pub fn factory(&self) -> Option<LoaderFactory> {
        self.factory.clone()
    }
}

impl std::fmt::Debug for LoaderProviderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderProviderService")
            .field("loader_id", &self.loader_id)
            .field("bound", &self.factory.is_some())
            .field("registered", &self.registered)
            .finish()
    }
}

impl ServiceBehavior for LoaderProviderService {
    fn service_type(&self) -> ServiceType {
        ServiceType::PluginLoader
    }

    fn activate(&mut self, service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        let provider = ctx.service_ref(service_id);
        ctx.loader_kinds.register_provided(&self.loader_id, provider)?;
        self.registered = true;
        Ok(())
    }

    fn deactivate(&mut self, _service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        if self.registered {
            ctx.loader_kinds.unregister(&self.loader_id);
            self.registered = false;
        }
        Ok(())
    }

    /// Always in use while the kind is registered.
    fn is_in_use(&self, _host: &Host) -> bool {
        self.registered
    }

    fn clear_bindings(&mut self) {
        self.factory = None;
    }

    fn describe(&self) -> String {
        format!("Plugin loader - {}", self.loader_id)
    }
}
