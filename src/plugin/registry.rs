//! Plugin registry: discovery, activation and the persisted session state.
//!
//! The registry owns every [`PluginDescriptor`] and is the only place plugins
//! refer to each other, always by id. Dependencies are looked up on every use
//! and never cached as references, so descriptors can come and go on
//! [`Registry::rescan`].
//!
//! Dependant counters are maintained here rather than by the descriptors:
//! activating a plugin bumps the `activate` counter of each dependency it
//! pulled in, loading its code bumps the `load` counter of each load
//! dependency. A plugin with a nonzero counter refuses to deactivate.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::descriptor::PluginDescriptor;
use super::fingerprint::FingerprintCache;
use super::host::{DocumentHandle, Host, ServiceRef};
use super::loader::{Loader, LoaderFactory, LoaderInstance, LoaderKinds, LoaderSource};
use super::manifest;
use super::service::{FunctionSignature, Service, ServiceContext, ServiceKind};
use super::state::{PersistedState, StateStore};
use super::types::{DependencyKind, DESCRIPTOR_FILE};
use super::{ErrorChain, ErrorKind, PluginResult};
use crate::core::PluginsConfig;

/// Outcome of [`Registry::discover_all`].
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Ids found, in scan order.
    pub plugin_ids: Vec<String>,
    /// Directories that could not be turned into a plugin.
    pub error: Option<ErrorChain>,
}

/// Outcome of [`Registry::rescan`].
#[derive(Debug, Default)]
pub struct RescanReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Plugins whose directory vanished while they were active or loaded.
    pub vanished_active: Vec<String>,
    pub error: Option<ErrorChain>,
}

/// The set of discovered plugins and their lifecycle.
pub struct Registry {
    host: Host,
    store: Box<dyn StateStore>,
    plugins: BTreeMap<String, PluginDescriptor>,
    cache: FingerprintCache,
    loader_kinds: LoaderKinds,
    search_dirs: Vec<PathBuf>,
    extra_search_dirs: Vec<PathBuf>,
    known_ids: Vec<String>,
    marked: BTreeSet<String>,
    activating: Vec<String>,
    loading: Vec<String>,
    parse_count: usize,
}

impl Registry {
    /// Create an empty registry. Nothing is read until [`startup`](Self::startup)
    /// or [`discover_all`](Self::discover_all).
    pub fn new(host: Host, store: impl StateStore + 'static) -> Self {
        Self {
            host,
            store: Box::new(store),
            plugins: BTreeMap::new(),
            cache: FingerprintCache::new(),
            loader_kinds: LoaderKinds::with_native(),
            search_dirs: Vec::new(),
            extra_search_dirs: Vec::new(),
            known_ids: Vec::new(),
            marked: BTreeSet::new(),
            activating: Vec::new(),
            loading: Vec::new(),
            parse_count: 0,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut Host {
        &mut self.host
    }

    pub fn loader_kinds(&self) -> &LoaderKinds {
        &self.loader_kinds
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Roots used by the last discovery.
    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Number of descriptor files parsed so far.
    pub fn parse_count(&self) -> usize {
        self.parse_count
    }

    /// Register or replace a built-in loader kind.
    pub fn register_loader_kind(&mut self, kind: &str, factory: LoaderFactory) {
        self.loader_kinds.register_builtin(kind, factory);
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    /// Load persisted state, discover plugins and activate the ones that were
    /// active last session.
    ///
    /// Every failure is collected; plugins that could be activated stay active.
    pub fn startup(&mut self, config: &PluginsConfig) -> PluginResult<()> {
        let mut errors = Vec::new();

        let state = self.store.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not load plugin state, starting fresh");
            errors.push(e);
            PersistedState::default()
        });
        self.cache = FingerprintCache::from_records(&state.plugin_file_states);
        self.known_ids = state.known_plugin_ids.clone();
        self.extra_search_dirs = state.extra_plugin_search_dirs.clone();

        let mut roots = config.search_dirs.clone();
        roots.extend(self.extra_search_dirs.iter().cloned());
        roots.extend(PluginsConfig::env_search_dirs());
        let mut seen = HashSet::new();
        roots.retain(|root| seen.insert(root.clone()));

        let report = self.discover_all(&roots);
        errors.extend(report.error);

        let mut to_activate = Vec::new();
        for id in &state.active_plugin_ids {
            if self.plugins.contains_key(id) {
                to_activate.push(id.clone());
            } else {
                tracing::warn!(plugin = %id, "Previously active plugin is no longer available");
            }
        }
        for id in &report.plugin_ids {
            if self.known_ids.contains(id) {
                continue;
            }
            if config.activate_new_plugins && !to_activate.contains(id) {
                to_activate.push(id.clone());
            }
            self.known_ids.push(id.clone());
        }

        for id in &to_activate {
            if let Err(e) = self.activate(id) {
                tracing::warn!(plugin = %id, error = %e, "Plugin activation failed at startup");
                errors.push(e);
            }
        }

        aggregate("Errors while starting the plugin system", errors)
    }

    /// Deactivate plugins and persist what should be restored next session.
    ///
    /// Plugins marked for deferred deactivation are deactivated first and are
    /// not restored. Plugins that refuse to deactivate because they are still in
    /// use are left alone; other failures are returned after state is saved.
    pub fn shutdown(&mut self) -> PluginResult<()> {
        let was_active = self.active_ids();
        let marked: Vec<String> = self.marked.iter().cloned().collect();

        let mut errors = self.deactivate_dependants_first(marked.clone());
        errors.extend(self.deactivate_dependants_first(self.active_ids()));
        errors.retain(|e| {
            if e.kind() == ErrorKind::DeactivationBlocked {
                tracing::debug!(error = %e, "Plugin stays active until exit");
                false
            } else {
                true
            }
        });

        let mut state = self.store.load().unwrap_or_default();
        state.active_plugin_ids = was_active.into_iter().filter(|id| !marked.contains(id)).collect();
        state.known_plugin_ids = self.known_ids.clone();
        state.extra_plugin_search_dirs = self.extra_search_dirs.clone();
        if self.cache.is_dirty() {
            state.plugin_file_states = self.cache.to_records();
        }
        match self.store.save(&state) {
            Ok(()) => self.cache.mark_clean(),
            Err(e) => errors.push(e),
        }
        self.marked.clear();

        aggregate("Errors while shutting down the plugin system", errors)
    }

    /// Add a discovery root remembered across sessions. Takes effect on the
    /// next [`rescan`](Self::rescan).
    pub fn add_search_dir(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if !self.extra_search_dirs.contains(&dir) {
            self.extra_search_dirs.push(dir.clone());
        }
        if !self.search_dirs.contains(&dir) {
            self.search_dirs.push(dir);
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Scan each root's immediate subdirectories for plugin descriptors.
    ///
    /// Unchanged directories are restored from the fingerprint cache as stubs;
    /// the rest are parsed. A directory that fails never stops the scan.
    pub fn discover_all(&mut self, roots: &[PathBuf]) -> DiscoveryReport {
        self.search_dirs = roots.to_vec();

        let mut report = DiscoveryReport::default();
        let mut errors = Vec::new();
        let mut seen_dirs = HashSet::new();

        for root in roots {
            for dir in plugin_directories(root, &mut errors) {
                seen_dirs.insert(dir.clone());
                match self.read_directory(&dir) {
                    Ok(descriptor) => {
                        let id = descriptor.id().to_string();
                        if let Err(e) = self.insert_discovered(descriptor) {
                            errors.push(e);
                        } else if !report.plugin_ids.contains(&id) {
                            report.plugin_ids.push(id);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), "Could not read plugin descriptor");
                        self.cache.forget(&dir);
                        errors.push(e);
                    }
                }
            }
        }

        self.cache.retain_directories(&seen_dirs);
        report.error = ErrorChain::from_list(ErrorKind::Discovery, "Errors while reading plugins", errors);
        report
    }

    /// Stub on a cache hit, full parse otherwise.
    fn read_directory(&mut self, dir: &Path) -> PluginResult<PluginDescriptor> {
        if let Some(entry) = self.cache.lookup(dir) {
            if !FingerprintCache::is_stale(dir, &entry.fingerprint) {
                tracing::debug!(plugin = %entry.plugin_id, "Plugin restored from cache");
                return Ok(PluginDescriptor::stub(entry.plugin_id.clone(), dir));
            }
        }

        let descriptor = self.parse_directory(dir)?;
        tracing::debug!(plugin = %descriptor.id(), dir = %dir.display(), "Plugin descriptor parsed");
        Ok(descriptor)
    }

    fn parse_directory(&mut self, dir: &Path) -> PluginResult<PluginDescriptor> {
        self.parse_count += 1;
        let descriptor = manifest::parse(dir)?;
        if let Some(fingerprint) = FingerprintCache::current_fingerprint(dir) {
            self.cache.record(dir, &fingerprint, descriptor.id());
        }
        Ok(descriptor)
    }

    fn insert_discovered(&mut self, descriptor: PluginDescriptor) -> PluginResult<()> {
        let Some(existing) = self.plugins.get(descriptor.id()) else {
            self.plugins.insert(descriptor.id().to_string(), descriptor);
            return Ok(());
        };

        if existing.directory() != descriptor.directory() {
            return Err(ErrorChain::new(
                ErrorKind::Discovery,
                format!(
                    "Duplicate plugin id '{}' in {} and {}",
                    descriptor.id(),
                    existing.directory().display(),
                    descriptor.directory().display()
                ),
            ));
        }

        // An idle plugin picks up descriptor changes; a busy one keeps its state.
        let idle = !existing.is_active() && !existing.is_loaded() && !existing.has_dependants();
        if idle && (descriptor.has_full_metadata() || !existing.has_full_metadata()) {
            self.plugins.insert(descriptor.id().to_string(), descriptor);
        }
        Ok(())
    }

    /// Re-run discovery over the last roots and reconcile the plugin set.
    pub fn rescan(&mut self) -> RescanReport {
        let before: BTreeSet<String> = self.plugins.keys().cloned().collect();
        let roots = self.search_dirs.clone();
        let discovery = self.discover_all(&roots);
        let found: BTreeSet<String> = discovery.plugin_ids.iter().cloned().collect();

        let mut report = RescanReport { error: discovery.error, ..Default::default() };

        for id in before.difference(&found) {
            let busy = self
                .plugins
                .get(id)
                .is_some_and(|p| p.is_active() || p.is_loaded() || p.has_dependants());
            if busy {
                tracing::warn!(plugin = %id, "Plugin directory vanished while the plugin is active");
                report.vanished_active.push(id.clone());
            } else if let Some(descriptor) = self.plugins.remove(id) {
                tracing::debug!(plugin = %id, "Plugin removed");
                // Discovery may already have recorded another id for this directory.
                self.cache.forget_plugin(descriptor.directory(), id);
                self.marked.remove(id);
                report.removed.push(id.clone());
            }
        }

        for id in found.difference(&before) {
            tracing::debug!(plugin = %id, "Plugin added");
            if !self.known_ids.contains(id) {
                self.known_ids.push(id.clone());
            }
            report.added.push(id.clone());
        }

        report
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Descriptor as currently held, possibly a stub.
    pub fn get_by_id(&self, id: &str) -> Option<&PluginDescriptor> {
        self.plugins.get(id)
    }

    /// Fully parsed descriptor, promoting a stub first.
    pub fn descriptor(&mut self, id: &str) -> PluginResult<&PluginDescriptor> {
        self.ensure_full(id)?;
        self.plugin(id)
    }

    /// All plugin descriptors, ordered by id.
    pub fn plugins(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.values()
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.plugins.values().filter(|p| p.is_active()).map(|p| p.id().to_string()).collect()
    }

    /// Every plugin id seen in this or earlier sessions.
    pub fn known_ids(&self) -> &[String] {
        &self.known_ids
    }

    fn plugin(&self, id: &str) -> PluginResult<&PluginDescriptor> {
        self.plugins.get(id).ok_or_else(|| unknown_plugin(id))
    }

    fn plugin_mut(&mut self, id: &str) -> PluginResult<&mut PluginDescriptor> {
        self.plugins.get_mut(id).ok_or_else(|| unknown_plugin(id))
    }

    fn ensure_full(&mut self, id: &str) -> PluginResult<()> {
        let plugin = self.plugin(id)?;
        if plugin.has_full_metadata() {
            return Ok(());
        }
        let dir = plugin.directory().to_path_buf();

        let full = self.parse_directory(&dir).map_err(|e| {
            ErrorChain::with_detail(
                ErrorKind::Discovery,
                format!("Couldn't read descriptor of plugin '{id}'"),
                e,
            )
        })?;
        if let Err(e) = self.plugin_mut(id)?.promote(full) {
            self.cache.forget(&dir);
            return Err(e);
        }
        tracing::debug!(plugin = %id, "Plugin stub promoted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Activate a plugin and, first, everything it needs active.
    pub fn activate(&mut self, id: &str) -> PluginResult<()> {
        self.ensure_full(id)?;
        if self.plugin(id)?.is_active() {
            return Ok(());
        }
        if let Some(pos) = self.activating.iter().position(|p| p == id) {
            let mut cycle = self.activating[pos..].to_vec();
            cycle.push(id.to_string());
            return Err(ErrorChain::new(
                ErrorKind::DependencyCycle,
                format!("Dependency cycle: {}", cycle.join(" -> ")),
            ));
        }

        self.activating.push(id.to_string());
        let result = self.activate_inner(id);
        self.activating.pop();
        result
    }

    fn activate_inner(&mut self, id: &str) -> PluginResult<()> {
        let dependencies: Vec<String> =
            self.plugin(id)?.dependency_ids(DependencyKind::RequiredForActivate).map(String::from).collect();

        for dep in &dependencies {
            if !self.plugins.contains_key(dep) {
                return Err(missing_dependency(id, dep));
            }
            if let Err(e) = self.activate(dep) {
                let kind = if e.kind() == ErrorKind::DependencyCycle {
                    ErrorKind::DependencyCycle
                } else {
                    ErrorKind::DependencyActivationFailed
                };
                return Err(ErrorChain::with_detail(
                    kind,
                    format!("Couldn't activate plugin '{dep}' required by '{id}'"),
                    e,
                ));
            }
        }

        let mut errors = Vec::new();
        for index in 0..self.plugin(id)?.services().len() {
            if let Err(e) = self.load_service_at(id, index) {
                errors.push(e);
                continue;
            }
            if let Err(e) = self.activate_service_at(id, index) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            self.release_idle_base(id);
            return aggregate(format!("Error while activating plugin '{id}'"), errors);
        }

        self.plugin_mut(id)?.is_active = true;
        for dep in &dependencies {
            if let Some(plugin) = self.plugins.get_mut(dep) {
                plugin.increment_dependants(DependencyKind::RequiredForActivate);
            }
        }
        tracing::debug!(plugin = %id, "Plugin activated");
        Ok(())
    }

    fn activate_service_at(&mut self, id: &str, index: usize) -> PluginResult<()> {
        let plugin = self.plugins.get_mut(id).ok_or_else(|| unknown_plugin(id))?;
        let dir = plugin.directory().to_path_buf();
        let service = service_at(plugin, index)?;
        let mut ctx = ServiceContext {
            plugin_id: id,
            plugin_dir: &dir,
            host: &mut self.host,
            loader_kinds: &mut self.loader_kinds,
        };
        service.activate(&mut ctx)
    }

    pub fn activate_many(&mut self, ids: &[String]) -> PluginResult<()> {
        let errors = ids.iter().filter_map(|id| self.activate(id).err()).collect();
        aggregate("Errors while activating plugins", errors)
    }

    // ------------------------------------------------------------------
    // Deactivation
    // ------------------------------------------------------------------

    /// True if nothing depends on the plugin and none of its services is in use.
    pub fn can_deactivate(&self, id: &str) -> bool {
        self.plugins.get(id).is_some_and(|p| {
            !p.has_dependants() && p.services().iter().all(|s| s.can_deactivate(&self.host))
        })
    }

    /// Deactivate a plugin. Refuses without changing anything while other
    /// plugins depend on it or one of its services is in use.
    pub fn deactivate(&mut self, id: &str) -> PluginResult<()> {
        let plugin = self.plugin(id)?;
        if !plugin.is_active() {
            return Ok(());
        }
        if plugin.has_dependants() {
            return Err(ErrorChain::new(
                ErrorKind::DeactivationBlocked,
                format!("Plugin '{id}' is still required by other plugins"),
            ));
        }
        if let Some(service) = plugin.services().iter().find(|s| !s.can_deactivate(&self.host)) {
            return Err(ErrorChain::new(
                ErrorKind::DeactivationBlocked,
                format!("Service '{}' of plugin '{id}' is still in use", service.id()),
            ));
        }

        let mut errors = Vec::new();
        for index in 0..plugin.services().len() {
            if let Err(e) = self.deactivate_service_at(id, index) {
                errors.push(e);
            }
        }
        if !errors.is_empty() {
            return aggregate(format!("Error while deactivating plugin '{id}'"), errors);
        }

        let dependencies: Vec<String> =
            self.plugin(id)?.dependency_ids(DependencyKind::RequiredForActivate).map(String::from).collect();
        self.plugin_mut(id)?.is_active = false;
        for dep in &dependencies {
            if let Some(plugin) = self.plugins.get_mut(dep) {
                plugin.decrement_dependants(DependencyKind::RequiredForActivate);
            }
        }
        self.release_idle_base(id);
        tracing::debug!(plugin = %id, "Plugin deactivated");
        Ok(())
    }

    /// Unregister a service and release its entry points.
    fn deactivate_service_at(&mut self, id: &str, index: usize) -> PluginResult<()> {
        let plugin = self.plugins.get_mut(id).ok_or_else(|| unknown_plugin(id))?;
        let dir = plugin.directory().to_path_buf();
        let (service, loader) =
            plugin.service_with_loader(index).ok_or_else(|| unknown_service(id, index))?;
        let mut ctx = ServiceContext {
            plugin_id: id,
            plugin_dir: &dir,
            host: &mut self.host,
            loader_kinds: &mut self.loader_kinds,
        };
        service.deactivate(&mut ctx)?;

        if let Some(loader) = loader {
            if let Err(e) = service.unload(loader) {
                tracing::warn!(plugin = %id, service = %service.id(), error = %e, "Error while unloading service");
            }
        }
        Ok(())
    }

    pub fn deactivate_many(&mut self, ids: &[String]) -> PluginResult<()> {
        let errors = ids.iter().filter_map(|id| self.deactivate(id).err()).collect();
        aggregate("Errors while deactivating plugins", errors)
    }

    /// Deactivate `ids`, retrying those still needed until no progress is made.
    fn deactivate_dependants_first(&mut self, ids: Vec<String>) -> Vec<ErrorChain> {
        let mut errors = Vec::new();
        let mut pending = ids;
        loop {
            let mut waiting = Vec::new();
            let before = pending.len();
            for id in pending {
                let needed = self.plugins.get(&id).is_some_and(|p| p.is_active() && p.has_dependants());
                if needed {
                    waiting.push(id);
                } else if let Err(e) = self.deactivate(&id) {
                    errors.push(e);
                }
            }
            if waiting.is_empty() {
                return errors;
            }
            if waiting.len() == before {
                errors.extend(waiting.iter().filter_map(|id| self.deactivate(id).err()));
                return errors;
            }
            pending = waiting;
        }
    }

    pub fn mark_for_deferred_deactivation(&mut self, id: &str, mark: bool) {
        if mark {
            self.marked.insert(id.to_string());
        } else {
            self.marked.remove(id);
        }
    }

    pub fn is_marked(&self, id: &str) -> bool {
        self.marked.contains(id)
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    fn load_service_at(&mut self, id: &str, index: usize) -> PluginResult<()> {
        if service_ref_at(self.plugin(id)?, index)?.is_loaded() {
            return Ok(());
        }
        self.load_base(id)?;

        let plugin = self.plugin_mut(id)?;
        let (service, loader) =
            plugin.service_with_loader(index).ok_or_else(|| unknown_service(id, index))?;
        let loader = loader.ok_or_else(|| {
            ErrorChain::new(ErrorKind::ServiceLoadFailed, format!("Plugin '{id}' has no loader"))
        })?;
        let service_id = service.id().to_string();
        service.load(loader).map_err(|e| {
            ErrorChain::with_detail(
                ErrorKind::ServiceLoadFailed,
                format!("Error while loading service '{service_id}' of plugin '{id}'"),
                e,
            )
        })
    }

    /// Make sure the plugin's code is loaded, loading its load dependencies first.
    fn load_base(&mut self, id: &str) -> PluginResult<()> {
        self.ensure_full(id)?;
        if self.plugin(id)?.is_loaded() {
            return Ok(());
        }
        if let Some(pos) = self.loading.iter().position(|p| p == id) {
            let mut cycle = self.loading[pos..].to_vec();
            cycle.push(id.to_string());
            return Err(ErrorChain::new(
                ErrorKind::DependencyCycle,
                format!("Load dependency cycle: {}", cycle.join(" -> ")),
            ));
        }

        self.loading.push(id.to_string());
        let result = self.load_base_inner(id);
        self.loading.pop();
        result
    }

    fn load_base_inner(&mut self, id: &str) -> PluginResult<()> {
        self.ensure_loader_instance(id)?;

        let dependencies: Vec<String> =
            self.plugin(id)?.dependency_ids(DependencyKind::RequiredForLoad).map(String::from).collect();
        let mut acquired = Vec::new();
        for dep in &dependencies {
            let result = if self.plugins.contains_key(dep) {
                self.load_base(dep).map_err(|e| {
                    ErrorChain::with_detail(
                        ErrorKind::DependencyActivationFailed,
                        format!("Couldn't load plugin '{dep}' required by '{id}'"),
                        e,
                    )
                })
            } else {
                Err(missing_dependency(id, dep))
            };
            if let Err(e) = result {
                self.release_load_dependencies(&acquired);
                return Err(e);
            }
            if let Some(plugin) = self.plugins.get_mut(dep) {
                plugin.increment_dependants(DependencyKind::RequiredForLoad);
            }
            acquired.push(dep.clone());
        }

        let plugin = self.plugin_mut(id)?;
        let dir = plugin.directory().to_path_buf();
        let result = match plugin.loader_instance.as_mut() {
            Some(instance) => instance.load_base(&dir),
            None => Err(ErrorChain::new(ErrorKind::ServiceLoadFailed, format!("Plugin '{id}' has no loader"))),
        };
        if let Err(e) = result {
            self.release_load_dependencies(&acquired);
            return Err(ErrorChain::with_detail(
                ErrorKind::ServiceLoadFailed,
                format!("Error while loading plugin '{id}'"),
                e,
            ));
        }
        tracing::debug!(plugin = %id, "Plugin code loaded");
        Ok(())
    }

    fn ensure_loader_instance(&mut self, id: &str) -> PluginResult<()> {
        let plugin = self.plugin(id)?;
        if plugin.loader_instance.is_some() {
            return Ok(());
        }
        let declaration = plugin.loader().cloned().ok_or_else(|| {
            ErrorChain::new(ErrorKind::ServiceLoadFailed, format!("Plugin '{id}' declares no loader"))
        })?;

        let loader = self.make_loader(&declaration.kind).map_err(|e| {
            ErrorChain::with_detail(
                ErrorKind::ServiceLoadFailed,
                format!("Cannot create loader '{}' for plugin '{id}'", declaration.kind),
                e,
            )
        })?;
        let mut instance = LoaderInstance::new(loader);
        instance.set_attributes(&declaration.attributes)?;
        self.plugin_mut(id)?.loader_instance = Some(instance);
        Ok(())
    }

    fn make_loader(&mut self, kind: &str) -> PluginResult<Box<dyn Loader>> {
        match self.loader_kinds.get(kind).cloned() {
            Some(LoaderSource::Builtin(factory)) => Ok(factory()),
            Some(LoaderSource::Provided(provider)) => {
                let factory = match self.loaded_service(&provider)?.kind() {
                    ServiceKind::LoaderProvider(service) => service.factory(),
                    _ => None,
                };
                let factory = factory.ok_or_else(|| {
                    ErrorChain::new(
                        ErrorKind::ServiceLoadFailed,
                        format!("Service '{provider}' did not provide a loader"),
                    )
                })?;
                Ok(factory())
            }
            None => Err(ErrorChain::new(
                ErrorKind::ServiceLoadFailed,
                format!("Unknown loader type '{kind}'"),
            )),
        }
    }

    /// Drop the plugin's code once nothing needs it anymore.
    fn release_idle_base(&mut self, id: &str) {
        let Some(plugin) = self.plugins.get_mut(id) else {
            return;
        };
        let idle = !plugin.is_active()
            && plugin.dependant_count(DependencyKind::RequiredForLoad) == 0
            && plugin.loader_instance.as_ref().is_some_and(|l| l.loaded_services() == 0);
        if !idle {
            return;
        }
        let Some(mut instance) = plugin.loader_instance.take() else {
            return;
        };
        let was_loaded = instance.is_base_loaded();
        if let Err(e) = instance.unload_base() {
            tracing::warn!(plugin = %id, error = %e, "Error while unloading plugin code");
        }
        drop(instance);

        if was_loaded {
            let dependencies: Vec<String> =
                plugin.dependency_ids(DependencyKind::RequiredForLoad).map(String::from).collect();
            self.release_load_dependencies(&dependencies);
            tracing::debug!(plugin = %id, "Plugin code unloaded");
        }
    }

    fn release_load_dependencies(&mut self, dependencies: &[String]) {
        for dep in dependencies {
            if let Some(plugin) = self.plugins.get_mut(dep) {
                plugin.decrement_dependants(DependencyKind::RequiredForLoad);
            }
            self.release_idle_base(dep);
        }
    }

    // ------------------------------------------------------------------
    // Service invocation
    // ------------------------------------------------------------------

    /// Resolve a service reference, loading the service if needed.
    fn loaded_service(&mut self, service: &ServiceRef) -> PluginResult<&Service> {
        self.ensure_full(&service.plugin_id)?;
        let index = self.plugin(&service.plugin_id)?.service_index(&service.service_id).ok_or_else(|| {
            ErrorChain::new(ErrorKind::Invocation, format!("No service '{service}'"))
        })?;
        self.load_service_at(&service.plugin_id, index)?;
        service_ref_at(self.plugin(&service.plugin_id)?, index)
    }

    /// Ask a file opener whether it recognizes `path`.
    ///
    /// Patterns are checked without loading the plugin; the plugin's own probe
    /// runs only when the patterns leave the question open.
    pub fn probe_file(&mut self, opener: &ServiceRef, path: &Path) -> PluginResult<bool> {
        self.ensure_full(&opener.plugin_id)?;
        let wants_hook = match self.plugin(&opener.plugin_id)?.service(&opener.service_id).map(Service::kind) {
            Some(ServiceKind::FileOpener(service)) => service.wants_probe_hook(path),
            _ => return Err(wrong_kind(opener, "a file opener")),
        };
        let service = if wants_hook {
            self.loaded_service(opener)?
        } else {
            self.plugin(&opener.plugin_id)?
                .service(&opener.service_id)
                .ok_or_else(|| wrong_kind(opener, "a file opener"))?
        };
        match service.kind() {
            ServiceKind::FileOpener(service) => Ok(service.probe(path)),
            _ => Err(wrong_kind(opener, "a file opener")),
        }
    }

    pub fn open_file(&mut self, opener: &ServiceRef, path: &Path, document: DocumentHandle) -> PluginResult<()> {
        match self.loaded_service(opener)?.kind() {
            ServiceKind::FileOpener(service) => service.open(&opener.service_id, path, document),
            _ => Err(wrong_kind(opener, "a file opener")),
        }
    }

    pub fn save_file(&mut self, saver: &ServiceRef, path: &Path, document: DocumentHandle) -> PluginResult<()> {
        match self.loaded_service(saver)?.kind() {
            ServiceKind::FileSaver(service) => service.save(&saver.service_id, path, document),
            _ => Err(wrong_kind(saver, "a file saver")),
        }
    }

    /// Look up one function of a group, binding it on first use.
    pub fn resolve_function(&mut self, group: &ServiceRef, name: &str) -> PluginResult<FunctionSignature> {
        match self.loaded_service(group)?.kind() {
            ServiceKind::FunctionGroup(service) => service.resolve(&group.service_id, name),
            _ => Err(wrong_kind(group, "a function group")),
        }
    }

    pub fn call_function(&mut self, group: &ServiceRef, name: &str, args: &[f64]) -> PluginResult<f64> {
        match self.loaded_service(group)?.kind() {
            ServiceKind::FunctionGroup(service) => service.call(&group.service_id, name, args),
            _ => Err(wrong_kind(group, "a function group")),
        }
    }

    pub fn dispatch_action(&mut self, ui: &ServiceRef, action: &str) -> PluginResult<()> {
        match self.loaded_service(ui)?.kind() {
            ServiceKind::Ui(service) => service.dispatch(&ui.service_id, action),
            _ => Err(wrong_kind(ui, "a user interface")),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("search_dirs", &self.search_dirs)
            .field("marked", &self.marked)
            .finish_non_exhaustive()
    }
}

/// Subdirectories of `root` holding a descriptor file, sorted by name.
///
/// A missing root is not an error; plugin paths often list optional places.
fn plugin_directories(root: &Path, errors: &mut Vec<ErrorChain>) -> Vec<PathBuf> {
    if !root.exists() {
        tracing::debug!(root = %root.display(), "Plugin search directory does not exist");
        return Vec::new();
    }

    let mut dirs = Vec::new();
    let walker = WalkDir::new(root).min_depth(1).max_depth(1).follow_links(true).sort_by_file_name();
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => {
                if entry.path().join(DESCRIPTOR_FILE).is_file() {
                    dirs.push(entry.into_path());
                }
            }
            Ok(_) => {}
            Err(e) => errors.push(ErrorChain::new(
                ErrorKind::Discovery,
                format!("Cannot scan {}: {e}", root.display()),
            )),
        }
    }
    dirs
}

fn service_at(plugin: &mut PluginDescriptor, index: usize) -> PluginResult<&mut Service> {
    let id = plugin.id().to_string();
    plugin.services_mut().get_mut(index).ok_or_else(|| unknown_service(&id, index))
}

fn service_ref_at(plugin: &PluginDescriptor, index: usize) -> PluginResult<&Service> {
    plugin.services().get(index).ok_or_else(|| unknown_service(plugin.id(), index))
}

/// Collect `errors` under one message, keeping the first error's kind.
fn aggregate(message: impl Into<String>, errors: Vec<ErrorChain>) -> PluginResult<()> {
    match errors.first().map(ErrorChain::kind) {
        Some(kind) => ErrorChain::check(kind, message, errors),
        None => Ok(()),
    }
}

fn unknown_plugin(id: &str) -> ErrorChain {
    ErrorChain::new(ErrorKind::UnknownPlugin, format!("Unknown plugin '{id}'"))
}

fn unknown_service(id: &str, index: usize) -> ErrorChain {
    ErrorChain::new(ErrorKind::Invocation, format!("Plugin '{id}' has no service #{index}"))
}

fn missing_dependency(id: &str, dep: &str) -> ErrorChain {
    ErrorChain::new(
        ErrorKind::DependencyMissing,
        format!("Plugin '{id}' depends on '{dep}', which is not available"),
    )
}

fn wrong_kind(service: &ServiceRef, expected: &str) -> ErrorChain {
    ErrorChain::new(ErrorKind::Invocation, format!("Service '{service}' is not {expected}"))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use tempfile::TempDir;

    use super::*;
    use crate::plugin::service::GeneralHooks;
    use crate::plugin::state::MemoryStateStore;

    /// Loader binding every general service to hooks that count calls.
    struct CountingLoader {
        inits: Rc<Cell<usize>>,
        bases: Rc<Cell<usize>>,
    }

    impl Loader for CountingLoader {
        fn kind(&self) -> &str {
            "counting"
        }

        fn set_attributes(&mut self, _attributes: &BTreeMap<String, String>) -> PluginResult<()> {
            Ok(())
        }

        fn load_base(&mut self, _plugin_dir: &Path) -> PluginResult<()> {
            self.bases.set(self.bases.get() + 1);
            Ok(())
        }

        fn unload_base(&mut self) -> PluginResult<()> {
            self.bases.set(self.bases.get() - 1);
            Ok(())
        }

        fn load_general(
            &mut self,
            _service_id: &str,
            service: &mut crate::plugin::service::GeneralService,
        ) -> PluginResult<()> {
            let inits = Rc::clone(&self.inits);
            service.bind(GeneralHooks::new(
                move || {
                    inits.set(inits.get() + 1);
                    Ok(())
                },
                || Ok(()),
            ));
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        registry: Registry,
        inits: Rc<Cell<usize>>,
        bases: Rc<Cell<usize>>,
    }

    fn write_plugin(root: &Path, id: &str, extra: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        let text = format!(
            "[plugin]\nid = \"{id}\"\n{extra}\n[loader]\nkind = \"counting\"\n\n[[services]]\ntype = \"general\"\nid = \"main\"\n"
        );
        std::fs::write(dir.join(DESCRIPTOR_FILE), text).unwrap();
    }

    fn fixture(plugins: &[(&str, &str)]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("plugins");
        for (id, extra) in plugins {
            write_plugin(&root, id, extra);
        }

        let inits = Rc::new(Cell::new(0));
        let bases = Rc::new(Cell::new(0));
        let mut registry = Registry::new(Host::in_memory(), MemoryStateStore::default());
        let (i, b) = (Rc::clone(&inits), Rc::clone(&bases));
        registry.register_loader_kind(
            "counting",
            Rc::new(move || {
                Box::new(CountingLoader { inits: Rc::clone(&i), bases: Rc::clone(&b) }) as Box<dyn Loader>
            }),
        );
        let report = registry.discover_all(std::slice::from_ref(&root));
        assert!(report.error.is_none(), "{:?}", report.error);

        Fixture { _temp: temp, root, registry, inits, bases }
    }

    #[test]
    fn test_activate_is_idempotent() {
        let mut f = fixture(&[("a", "")]);

        f.registry.activate("a").unwrap();
        f.registry.activate("a").unwrap();

        assert_eq!(f.inits.get(), 1);
        assert_eq!(f.registry.active_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn test_dependency_activated_first_and_guarded() {
        let mut f = fixture(&[("base", ""), ("ext", "\n[[dependencies]]\nid = \"base\"\n")]);

        f.registry.activate("ext").unwrap();
        let base = f.registry.get_by_id("base").unwrap();
        assert!(base.is_active());
        assert_eq!(base.dependant_count(DependencyKind::RequiredForActivate), 1);
        assert_eq!(base.dependant_count(DependencyKind::RequiredForLoad), 1);

        let err = f.registry.deactivate("base").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeactivationBlocked);
        assert!(f.registry.get_by_id("base").unwrap().is_active());
        assert!(!f.registry.can_deactivate("base"));

        f.registry.deactivate("ext").unwrap();
        f.registry.deactivate("base").unwrap();
        assert!(f.registry.active_ids().is_empty());
        assert_eq!(f.bases.get(), 0);
    }

    #[test]
    fn test_missing_dependency() {
        let mut f = fixture(&[("ext", "\n[[dependencies]]\nid = \"ghost\"\n")]);

        let err = f.registry.activate("ext").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
        assert!(!f.registry.get_by_id("ext").unwrap().is_active());
    }

    #[test]
    fn test_dependency_cycle_detected() {
        let mut f = fixture(&[
            ("a", "\n[[dependencies]]\nid = \"b\"\nrequire_load = false\n"),
            ("b", "\n[[dependencies]]\nid = \"a\"\nrequire_load = false\n"),
        ]);

        let err = f.registry.activate("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyCycle);
        assert!(err.mentions("a -> b -> a"));
        assert!(f.registry.active_ids().is_empty());
    }

    #[test]
    fn test_unknown_plugin() {
        let mut f = fixture(&[]);
        assert_eq!(f.registry.activate("nope").unwrap_err().kind(), ErrorKind::UnknownPlugin);
        assert!(f.registry.deactivate("nope").is_err());
    }

    #[test]
    fn test_deferred_marks() {
        let mut f = fixture(&[("a", "")]);
        f.registry.mark_for_deferred_deactivation("a", true);
        assert!(f.registry.is_marked("a"));
        f.registry.mark_for_deferred_deactivation("a", false);
        assert!(!f.registry.is_marked("a"));
    }

    #[test]
    fn test_rescan_reports_changes() {
        let mut f = fixture(&[("a", ""), ("b", "")]);
        f.registry.activate("a").unwrap();

        std::fs::remove_dir_all(f.root.join("a")).unwrap();
        std::fs::remove_dir_all(f.root.join("b")).unwrap();
        write_plugin(&f.root, "c", "");

        let report = f.registry.rescan();
        assert_eq!(report.added, vec!["c".to_string()]);
        assert_eq!(report.removed, vec!["b".to_string()]);
        assert_eq!(report.vanished_active, vec!["a".to_string()]);
        assert!(f.registry.get_by_id("a").unwrap().is_active());
        assert!(f.registry.known_ids().contains(&"c".to_string()));
    }

    #[test]
    fn test_rescan_keeps_record_of_renamed_plugin() {
        let mut f = fixture(&[("a", "")]);
        let dir = f.root.join("a");
        let text = std::fs::read_to_string(dir.join(DESCRIPTOR_FILE)).unwrap();
        std::fs::write(dir.join(DESCRIPTOR_FILE), text.replace("id = \"a\"", "id = \"renamed\"")).unwrap();

        let report = f.registry.rescan();
        assert_eq!(report.added, vec!["renamed".to_string()]);
        assert_eq!(report.removed, vec!["a".to_string()]);
        assert_eq!(f.registry.cache().lookup(&dir).unwrap().plugin_id, "renamed");
    }

    #[test]
    fn test_duplicate_id_reported() {
        let f = fixture(&[("a", "")]);
        let other = f.root.join("copy");
        std::fs::create_dir_all(&other).unwrap();
        std::fs::copy(f.root.join("a").join(DESCRIPTOR_FILE), other.join(DESCRIPTOR_FILE)).unwrap();

        let mut registry = Registry::new(Host::in_memory(), MemoryStateStore::default());
        let report = registry.discover_all(std::slice::from_ref(&f.root));

        assert_eq!(report.plugin_ids, vec!["a".to_string()]);
        assert!(report.error.unwrap().mentions("Duplicate plugin id 'a'"));
    }
}
