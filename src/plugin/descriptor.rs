//! In-memory plugin descriptor.
//!
//! A descriptor starts either as a *stub* (id and directory, restored from the
//! fingerprint cache) or fully parsed. Stubs are promoted on first access to
//! anything beyond the id.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::loader::LoaderInstance;
use super::service::Service;
use super::types::{DependencyKind, DependencyKinds, NO_DESCRIPTION, UNKNOWN_NAME};
use super::{ErrorChain, ErrorKind, PluginResult};

/// Weak reference to another plugin, resolved by id through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub target_id: String,
    pub kinds: DependencyKinds,
}

impl Dependency {
    pub fn new(target_id: impl Into<String>, kinds: DependencyKinds) -> Self {
        Self { target_id: target_id.into(), kinds }
    }

    pub fn requires(&self, kind: DependencyKind) -> bool {
        self.kinds.contains(kind)
    }
}

/// `[loader]` table of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderDeclaration {
    pub kind: String,
    pub attributes: BTreeMap<String, String>,
}

impl LoaderDeclaration {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), attributes: BTreeMap::new() }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// A discovered plugin.
#[derive(Debug)]
pub struct PluginDescriptor {
    id: String,
    directory: PathBuf,
    has_full_metadata: bool,
    name: Option<String>,
    description: Option<String>,
    dependencies: Vec<Dependency>,
    services: Vec<Service>,
    loader: Option<LoaderDeclaration>,
    pub(crate) loader_instance: Option<LoaderInstance>,
    pub(crate) is_active: bool,
    dependant_counts: HashMap<DependencyKind, usize>,
}

impl PluginDescriptor {
    /// Descriptor known only by id, pending a full parse.
    pub fn stub(id: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            directory: directory.into(),
            has_full_metadata: false,
            name: None,
            description: None,
            dependencies: Vec::new(),
            services: Vec::new(),
            loader: None,
            loader_instance: None,
            is_active: false,
            dependant_counts: HashMap::new(),
        }
    }

    /// Fully parsed descriptor.
    pub fn new(
        id: impl Into<String>,
        directory: impl Into<PathBuf>,
        loader: LoaderDeclaration,
        services: Vec<Service>,
    ) -> Self {
        Self {
            has_full_metadata: true,
            loader: Some(loader),
            services,
            ..Self::stub(id, directory)
        }
    }

    pub fn with_information(mut self, name: Option<String>, description: Option<String>) -> Self {
        self.name = name;
        self.description = description;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn has_full_metadata(&self) -> bool {
        self.has_full_metadata
    }

    /// Display name, or a placeholder when the descriptor has none.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_NAME)
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(NO_DESCRIPTION)
    }

    pub(crate) fn raw_information(&self) -> (Option<&str>, Option<&str>) {
        (self.name.as_deref(), self.description.as_deref())
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Ids of dependencies of the given kind, in declaration order.
    pub fn dependency_ids(&self, kind: DependencyKind) -> impl Iterator<Item = &str> {
        self.dependencies.iter().filter(move |d| d.requires(kind)).map(|d| d.target_id.as_str())
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut [Service] {
        &mut self.services
    }

    pub fn service(&self, service_id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id() == service_id)
    }

    pub fn service_index(&self, service_id: &str) -> Option<usize> {
        self.services.iter().position(|s| s.id() == service_id)
    }

    /// A service together with the plugin's loader, for binding.
    pub(crate) fn service_with_loader(
        &mut self,
        index: usize,
    ) -> Option<(&mut Service, Option<&mut LoaderInstance>)> {
        let service = self.services.get_mut(index)?;
        Some((service, self.loader_instance.as_mut()))
    }

    pub fn loader(&self) -> Option<&LoaderDeclaration> {
        self.loader.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// True while the loader holds the plugin's code.
    pub fn is_loaded(&self) -> bool {
        self.loader_instance.as_ref().is_some_and(LoaderInstance::is_base_loaded)
    }

    pub fn loader_info(&self) -> Vec<(String, String)> {
        self.loader_instance.as_ref().map(LoaderInstance::info).unwrap_or_default()
    }

    pub fn dependant_count(&self, kind: DependencyKind) -> usize {
        self.dependant_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn has_dependants(&self) -> bool {
        self.dependant_counts.values().any(|n| *n > 0)
    }

    pub(crate) fn increment_dependants(&mut self, kind: DependencyKind) {
        *self.dependant_counts.entry(kind).or_insert(0) += 1;
    }

    pub(crate) fn decrement_dependants(&mut self, kind: DependencyKind) {
        if let Some(count) = self.dependant_counts.get_mut(&kind) {
            *count = count.saturating_sub(1);
        }
    }

    /// Replace stub contents with a fully parsed descriptor of the same plugin.
    pub(crate) fn promote(&mut self, full: PluginDescriptor) -> PluginResult<()> {
        if full.id != self.id {
            return Err(ErrorChain::new(
                ErrorKind::CacheCorruption,
                format!(
                    "Plugin cache is corrupted: directory {} holds plugin '{}', expected '{}'",
                    self.directory.display(),
                    full.id,
                    self.id
                ),
            ));
        }
        self.name = full.name;
        self.description = full.description;
        self.dependencies = full.dependencies;
        self.services = full.services;
        self.loader = full.loader;
        self.has_full_metadata = true;
        Ok(())
    }
}
