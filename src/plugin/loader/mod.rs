//! Loaders bind a plugin's declared code to its services.
//!
//! A [`Loader`] is the kind-specific strategy (native shared module, or any
//! kind contributed by a plugin's loader-provider service). Each plugin owns
//! at most one [`LoaderInstance`], created on the first service load and
//! dropped once the last loaded service is unloaded.

pub mod abi;
mod native;

use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use super::host::ServiceRef;
use super::service::{
    FileOpenerService, FileSaverService, FunctionGroupService, GeneralService,
    LoaderProviderService, Service, ServiceKind, UiService,
};
use super::types::{ServiceType, NATIVE_LOADER_KIND};
use super::{ErrorChain, ErrorKind, PluginResult};

pub use native::{ModuleOpener, NativeModuleHandle, NativeModuleLoader, SharedLibrary, StaticModule};

/// Creates fresh loader instances of one kind.
pub type LoaderFactory = Rc<dyn Fn() -> Box<dyn Loader>>;

/// Strategy turning a plugin's loader attributes into bound entry points.
///
/// Kinds a loader cannot handle keep the default implementation, which
/// reports the service as unsupported.
pub trait Loader {
    fn kind(&self) -> &str;

    fn set_attributes(&mut self, attributes: &BTreeMap<String, String>) -> PluginResult<()>;

    /// Acquire the plugin's code and run any whole-plugin init hook.
    fn load_base(&mut self, plugin_dir: &Path) -> PluginResult<()>;

    /// Release the plugin's code. Only called once every service is unloaded.
    fn unload_base(&mut self) -> PluginResult<()>;

    fn load_general(&mut self, service_id: &str, _service: &mut GeneralService) -> PluginResult<()> {
        Err(unsupported(self.kind(), service_id, ServiceType::General))
    }

    fn load_file_opener(
        &mut self,
        service_id: &str,
        _service: &mut FileOpenerService,
    ) -> PluginResult<()> {
        Err(unsupported(self.kind(), service_id, ServiceType::FileOpener))
    }

    fn load_file_saver(&mut self, service_id: &str, _service: &mut FileSaverService) -> PluginResult<()> {
        Err(unsupported(self.kind(), service_id, ServiceType::FileSaver))
    }

    fn load_function_group(
        &mut self,
        service_id: &str,
        _service: &mut FunctionGroupService,
    ) -> PluginResult<()> {
        Err(unsupported(self.kind(), service_id, ServiceType::FunctionGroup))
    }

    fn load_loader_provider(
        &mut self,
        service_id: &str,
        _service: &mut LoaderProviderService,
    ) -> PluginResult<()> {
        Err(unsupported(self.kind(), service_id, ServiceType::PluginLoader))
    }

    fn load_ui(&mut self, service_id: &str, _service: &mut UiService) -> PluginResult<()> {
        Err(unsupported(self.kind(), service_id, ServiceType::Ui))
    }

    fn unload_service(&mut self, service: &mut Service) -> PluginResult<()> {
        service.clear_bindings();
        Ok(())
    }

    /// Key/value lines for diagnostics.
    fn info(&self) -> Vec<(String, String)> {
        vec![("Loader".to_string(), self.kind().to_string())]
    }
}

fn unsupported(kind: &str, service_id: &str, service_type: ServiceType) -> ErrorChain {
    ErrorChain::new(
        ErrorKind::ServiceLoadFailed,
        format!("Loader '{kind}' cannot load {service_type} service '{service_id}'"),
    )
}

/// Per-plugin loader plus the bookkeeping shared by every loader kind.
pub struct LoaderInstance {
    loader: Box<dyn Loader>,
    base_loaded: bool,
    loaded_services: usize,
}

impl LoaderInstance {
    pub fn new(loader: Box<dyn Loader>) -> Self {
        Self { loader, base_loaded: false, loaded_services: 0 }
    }

    pub fn kind(&self) -> &str {
        self.loader.kind()
    }

    pub fn set_attributes(&mut self, attributes: &BTreeMap<String, String>) -> PluginResult<()> {
        self.loader.set_attributes(attributes)
    }

    pub fn is_base_loaded(&self) -> bool {
        self.base_loaded
    }

    pub fn loaded_services(&self) -> usize {
        self.loaded_services
    }

    pub fn load_base(&mut self, plugin_dir: &Path) -> PluginResult<()> {
        if self.base_loaded {
            return Ok(());
        }
        self.loader.load_base(plugin_dir)?;
        self.base_loaded = true;
        tracing::debug!(loader = %self.kind(), dir = %plugin_dir.display(), "Loader base loaded");
        Ok(())
    }

    pub fn unload_base(&mut self) -> PluginResult<()> {
        if !self.base_loaded {
            return Ok(());
        }
        if self.loaded_services > 0 {
            return Err(ErrorChain::new(
                ErrorKind::DeactivationBlocked,
                format!("{} service(s) are still loaded", self.loaded_services),
            ));
        }
        self.base_loaded = false;
        tracing::debug!(loader = %self.kind(), "Loader base unloaded");
        self.loader.unload_base()
    }

    /// Bind `service` through the loader, dispatching on its kind.
    pub fn load_service(&mut self, service: &mut Service) -> PluginResult<()> {
        if !self.base_loaded {
            return Err(ErrorChain::new(
                ErrorKind::ServiceLoadFailed,
                format!("Loader base is not loaded for service '{}'", service.id()),
            ));
        }
        let id = service.id().to_string();
        match service.kind_mut() {
            ServiceKind::General(s) => self.loader.load_general(&id, s),
            ServiceKind::FileOpener(s) => self.loader.load_file_opener(&id, s),
            ServiceKind::FileSaver(s) => self.loader.load_file_saver(&id, s),
            ServiceKind::FunctionGroup(s) => self.loader.load_function_group(&id, s),
            ServiceKind::LoaderProvider(s) => self.loader.load_loader_provider(&id, s),
            ServiceKind::Ui(s) => self.loader.load_ui(&id, s),
        }?;
        self.loaded_services += 1;
        Ok(())
    }

    /// Unbind `service`. Returns how many services remain loaded.
    pub fn unload_service(&mut self, service: &mut Service) -> PluginResult<usize> {
        self.loader.unload_service(service)?;
        self.loaded_services = self.loaded_services.saturating_sub(1);
        Ok(self.loaded_services)
    }

    pub fn info(&self) -> Vec<(String, String)> {
        self.loader.info()
    }
}

impl std::fmt::Debug for LoaderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderInstance")
            .field("kind", &self.kind())
            .field("base_loaded", &self.base_loaded)
            .field("loaded_services", &self.loaded_services)
            .finish()
    }
}

/// Where loaders of one kind come from.
#[derive(Clone)]
pub enum LoaderSource {
    /// Registered by the embedding application.
    Builtin(LoaderFactory),
    /// Contributed by an active loader-provider service.
    Provided(ServiceRef),
}

impl std::fmt::Debug for LoaderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin(_) => f.write_str("Builtin"),
            Self::Provided(service) => f.debug_tuple("Provided").field(service).finish(),
        }
    }
}

/// Table of loader kinds known to a registry.
#[derive(Debug, Clone, Default)]
pub struct LoaderKinds {
    kinds: BTreeMap<String, LoaderSource>,
}

impl LoaderKinds {
    /// Table with the native-module loader registered.
    pub fn with_native() -> Self {
        let mut kinds = Self::default();
        kinds.register_builtin(
            NATIVE_LOADER_KIND,
            Rc::new(|| Box::new(NativeModuleLoader::new()) as Box<dyn Loader>),
        );
        kinds
    }

    /// Register or replace a built-in loader kind.
    pub fn register_builtin(&mut self, kind: &str, factory: LoaderFactory) {
        self.kinds.insert(kind.to_string(), LoaderSource::Builtin(factory));
    }

    pub fn register_provided(&mut self, kind: &str, provider: ServiceRef) -> PluginResult<()> {
        if let Some(existing) = self.kinds.get(kind) {
            let owner = match existing {
                LoaderSource::Builtin(_) => "the application".to_string(),
                LoaderSource::Provided(service) => service.to_string(),
            };
            return Err(ErrorChain::new(
                ErrorKind::ServiceActivationFailed,
                format!("Loader kind '{kind}' is already provided by {owner}"),
            ));
        }
        tracing::debug!(kind = %kind, provider = %provider, "Registered plugin loader kind");
        self.kinds.insert(kind.to_string(), LoaderSource::Provided(provider));
        Ok(())
    }

    pub fn unregister(&mut self, kind: &str) {
        self.kinds.remove(kind);
    }

    pub fn get(&self, kind: &str) -> Option<&LoaderSource> {
        self.kinds.get(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        self.kinds.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::service::GeneralHooks;

    /// Loader that binds every general service to no-op hooks.
    struct NoopLoader;

    impl Loader for NoopLoader {
        fn kind(&self) -> &str {
            "noop"
        }

        fn set_attributes(&mut self, _attributes: &BTreeMap<String, String>) -> PluginResult<()> {
            Ok(())
        }

        fn load_base(&mut self, _plugin_dir: &Path) -> PluginResult<()> {
            Ok(())
        }

        fn unload_base(&mut self) -> PluginResult<()> {
            Ok(())
        }

        fn load_general(&mut self, _service_id: &str, service: &mut GeneralService) -> PluginResult<()> {
            service.bind(GeneralHooks::new(|| Ok(()), || Ok(())));
            Ok(())
        }
    }

    #[test]
    fn test_service_load_needs_base() {
        let mut instance = LoaderInstance::new(Box::new(NoopLoader));
        let mut service = Service::new("misc", ServiceKind::General(GeneralService::default()));

        assert!(service.load(&mut instance).is_err());
        assert!(!service.is_loaded());

        instance.load_base(Path::new(".")).unwrap();
        service.load(&mut instance).unwrap();
        assert!(service.is_loaded());
        assert_eq!(instance.loaded_services(), 1);
    }

    #[test]
    fn test_unload_base_waits_for_services() {
        let mut instance = LoaderInstance::new(Box::new(NoopLoader));
        instance.load_base(Path::new(".")).unwrap();
        let mut service = Service::new("misc", ServiceKind::General(GeneralService::default()));
        service.load(&mut instance).unwrap();

        assert!(instance.unload_base().is_err());
        assert_eq!(service.unload(&mut instance).unwrap(), 0);
        instance.unload_base().unwrap();
        assert!(!instance.is_base_loaded());
    }

    #[test]
    fn test_unsupported_kind() {
        let mut instance = LoaderInstance::new(Box::new(NoopLoader));
        instance.load_base(Path::new(".")).unwrap();
        let mut service =
            Service::new("saver", ServiceKind::FileSaver(FileSaverService::new("Text")));

        let err = service.load(&mut instance).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceLoadFailed);
        assert_eq!(instance.loaded_services(), 0);
    }

    #[test]
    fn test_provided_kind_conflicts() {
        let mut kinds = LoaderKinds::with_native();
        let err = kinds.register_provided("native", ServiceRef::new("p", "s")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceActivationFailed);

        kinds.register_provided("python", ServiceRef::new("py", "loader")).unwrap();
        assert_eq!(kinds.kinds(), vec!["native".to_string(), "python".to_string()]);
        kinds.unregister("python");
        assert!(kinds.get("python").is_none());
    }
}
