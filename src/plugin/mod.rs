//! Plugin subsystem.
//!
//! Plugins live in directories under one or more search roots, each described
//! by a `plugin.toml`. The [`Registry`] discovers them, restores unchanged ones
//! from a fingerprint cache, activates them in dependency order and persists
//! which ones were active between sessions.
//!
//! # Architecture
//!
//! A plugin provides [`Service`]s of six kinds (general, file opener, file
//! saver, function group, plugin loader, user interface). A service's entry
//! points are bound by the plugin's [`Loader`]; the built-in
//! [`NativeModuleLoader`] resolves them from a shared library by naming
//! convention, and plugins can contribute loader kinds of their own.
//!
//! Activated services register with the application's [`Host`] subsystems.
//!
//! # Example descriptor
//!
//! ```toml
//! [plugin]
//! id = "csv"
//!
//! [information]
//! name = "CSV"
//! description = "Comma separated values"
//!
//! [loader]
//! kind = "native"
//! attributes = { module_file = "libcsv.so" }
//!
//! [[services]]
//! id = "csv_open"
//! type = "file_opener"
//! description = "Comma separated values"
//! file_patterns = [{ value = "*.csv" }]
//! ```

mod descriptor;
mod error;
mod fingerprint;
mod host;
pub mod loader;
mod manifest;
mod registry;
pub mod service;
mod state;
mod types;

pub use descriptor::{Dependency, LoaderDeclaration, PluginDescriptor};
pub use error::{ErrorChain, ErrorKind, PluginResult};
pub use fingerprint::{CacheEntry, FingerprintCache};
pub use host::{
    ActionRegistry, DocumentHandle, FileFormatRegistry, FunctionRegistry, Host, InMemoryActions,
    InMemoryFormats, InMemoryFunctions, LayoutId, OpenerRegistration, SaverRegistration,
    ServiceRef, UiRegistration,
};
pub use loader::{
    abi, Loader, LoaderFactory, LoaderInstance, LoaderKinds, LoaderSource, ModuleOpener,
    NativeModuleHandle, NativeModuleLoader, SharedLibrary, StaticModule,
};
pub use manifest::{parse as parse_descriptor, parse_str as parse_descriptor_str};
pub use registry::{DiscoveryReport, Registry, RescanReport};
pub use service::{Service, ServiceKind};
pub use state::{MemoryStateStore, PersistedState, StateStore, TomlStateStore};
pub use types::{
    DependencyKind, DependencyKinds, FormatLevel, SaveScope, ServiceType, DESCRIPTOR_FILE,
    NATIVE_LOADER_KIND, PLUGIN_PATH_ENV,
};
