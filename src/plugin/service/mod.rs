//! Plugin services.
//!
//! A service is one typed unit of functionality contributed by a plugin. The
//! set of kinds is closed ([`ServiceKind`]); each kind module implements
//! [`ServiceBehavior`] for its payload and [`Service`] dispatches to it.
//!
//! Services move through two independent flags: *loaded* (the plugin's loader
//! has bound the kind's entry points) and *active* (the service is registered
//! with a host subsystem). A service is never active without being loaded.

mod file_opener;
mod file_saver;
mod function_group;
mod general;
mod loader_provider;
mod ui;

use std::path::Path;

use once_cell::unsync::OnceCell;

use super::host::{Host, ServiceRef};
use super::loader::{LoaderInstance, LoaderKinds};
use super::types::ServiceType;
use super::{ErrorChain, ErrorKind, PluginResult};

pub use file_opener::{FileOpenerService, FilePattern, OpenerHooks, PatternType, SaveInfo};
pub use file_saver::{FileSaverService, SaverHooks};
pub use function_group::{FunctionGroupService, FunctionSignature, FunctionTable};
pub use general::{GeneralHooks, GeneralService};
pub use loader_provider::LoaderProviderService;
pub use ui::{ActionHandler, UiAction, UiService};

/// Everything a service may touch while it is (de)activated.
pub struct ServiceContext<'a> {
    pub plugin_id: &'a str,
    pub plugin_dir: &'a Path,
    pub host: &'a mut Host,
    pub loader_kinds: &'a mut LoaderKinds,
}

impl ServiceContext<'_> {
    pub fn service_ref(&self, service_id: &str) -> ServiceRef {
        ServiceRef::new(self.plugin_id, service_id)
    }
}

/// Contract implemented once per service kind.
pub trait ServiceBehavior {
    fn service_type(&self) -> ServiceType;

    /// Register with the host subsystem. Entry points are already bound.
    fn activate(&mut self, service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()>;

    /// Unregister from the host subsystem.
    fn deactivate(&mut self, service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()>;

    /// True while the host still uses what this service registered.
    fn is_in_use(&self, host: &Host) -> bool;

    /// Drop entry points bound by a loader.
    fn clear_bindings(&mut self);

    fn describe(&self) -> String;
}

/// Kind-specific payload of a service.
pub enum ServiceKind {
    General(GeneralService),
    FileOpener(FileOpenerService),
    FileSaver(FileSaverService),
    FunctionGroup(FunctionGroupService),
    LoaderProvider(LoaderProviderService),
    Ui(UiService),
}

impl ServiceKind {
    fn behavior(&self) -> &dyn ServiceBehavior {
        match self {
            Self::General(s) => s,
            Self::FileOpener(s) => s,
            Self::FileSaver(s) => s,
            Self::FunctionGroup(s) => s,
            Self::LoaderProvider(s) => s,
            Self::Ui(s) => s,
        }
    }

    fn behavior_mut(&mut self) -> &mut dyn ServiceBehavior {
        match self {
            Self::General(s) => s,
            Self::FileOpener(s) => s,
            Self::FileSaver(s) => s,
            Self::FunctionGroup(s) => s,
            Self::LoaderProvider(s) => s,
            Self::Ui(s) => s,
        }
    }

    pub fn service_type(&self) -> ServiceType {
        self.behavior().service_type()
    }
}

impl std::fmt::Debug for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::General(s) => f.debug_tuple("General").field(s).finish(),
            Self::FileOpener(s) => f.debug_tuple("FileOpener").field(s).finish(),
            Self::FileSaver(s) => f.debug_tuple("FileSaver").field(s).finish(),
            Self::FunctionGroup(s) => f.debug_tuple("FunctionGroup").field(s).finish(),
            Self::LoaderProvider(s) => f.debug_tuple("LoaderProvider").field(s).finish(),
            Self::Ui(s) => f.debug_tuple("Ui").field(s).finish(),
        }
    }
}

/// One service owned by a plugin descriptor.
#[derive(Debug)]
pub struct Service {
    id: String,
    kind: ServiceKind,
    is_loaded: bool,
    is_active: bool,
    description: OnceCell<String>,
}

impl Service {
    pub fn new(id: impl Into<String>, kind: ServiceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            is_loaded: false,
            is_active: false,
            description: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut ServiceKind {
        &mut self.kind
    }

    pub fn service_type(&self) -> ServiceType {
        self.kind.service_type()
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Human readable one-line description, computed once.
    pub fn describe(&self) -> &str {
        self.description.get_or_init(|| self.kind.behavior().describe())
    }

    /// Bind entry points through the plugin's loader.
    ///
    /// The loader's base must already be loaded; the registry takes care of
    /// that because it involves the plugin's load dependencies.
    pub fn load(&mut self, loader: &mut LoaderInstance) -> PluginResult<()> {
        if self.is_loaded {
            return Ok(());
        }
        loader.load_service(self)?;
        self.is_loaded = true;
        tracing::debug!(service = %self.id, kind = %self.service_type(), "Service loaded");
        Ok(())
    }

    /// Release entry points. Returns the loader's remaining loaded-service count.
    pub fn unload(&mut self, loader: &mut LoaderInstance) -> PluginResult<usize> {
        if !self.is_loaded {
            return Ok(loader.loaded_services());
        }
        let remaining = loader.unload_service(self)?;
        self.is_loaded = false;
        tracing::debug!(service = %self.id, "Service unloaded");
        Ok(remaining)
    }

    pub fn activate(&mut self, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        if self.is_active {
            return Ok(());
        }
        if !self.is_loaded {
            return Err(ErrorChain::new(
                ErrorKind::ServiceActivationFailed,
                format!("Service '{}' must be loaded before it is activated", self.id),
            ));
        }
        let id = self.id.clone();
        self.kind.behavior_mut().activate(&id, ctx).map_err(|e| {
            ErrorChain::with_detail(
                ErrorKind::ServiceActivationFailed,
                format!("Error while activating service '{id}'"),
                e,
            )
        })?;
        self.is_active = true;
        Ok(())
    }

    pub fn deactivate(&mut self, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        if !self.is_active {
            return Ok(());
        }
        let id = self.id.clone();
        self.kind.behavior_mut().deactivate(&id, ctx)?;
        self.is_active = false;
        Ok(())
    }

    pub fn can_deactivate(&self, host: &Host) -> bool {
        !self.is_active || !self.kind.behavior().is_in_use(host)
    }

    /// Drop bound entry points. Loaders call this from `unload_service`.
    pub fn clear_bindings(&mut self) {
        self.kind.behavior_mut().clear_bindings();
    }
}

/// Error for a service whose kind-specific entry points are missing at call time.
pub(crate) fn not_bound(service_id: &str) -> ErrorChain {
    ErrorChain::new(
        ErrorKind::ServiceLoadFailed,
        format!("Service '{service_id}' has no entry points bound"),
    )
}
