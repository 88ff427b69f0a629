//! Host subsystems that plugin services register themselves with.
//!
//! Activating a service is the only point where plugin state leaks into the
//! rest of the application: openers and savers go to a
//! [`FileFormatRegistry`], function groups to a [`FunctionRegistry`], UI
//! extensions to an [`ActionRegistry`]. The application supplies its own
//! implementations; the in-memory ones here are enough for embedding tools and
//! tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::rc::Rc;

use super::service::{FilePattern, SaveInfo, UiAction};
use super::types::{FormatLevel, SaveScope};
use super::{ErrorChain, ErrorKind, PluginResult};

/// Weak reference to a service: resolved through the registry on every use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceRef {
    pub plugin_id: String,
    pub service_id: String,
}

impl ServiceRef {
    pub fn new(plugin_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self { plugin_id: plugin_id.into(), service_id: service_id.into() }
    }

    /// Qualified id used by host registries, `"<plugin>:<service>"`.
    pub fn qualified_id(&self) -> String {
        format!("{}:{}", self.plugin_id, self.service_id)
    }
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.plugin_id, self.service_id)
    }
}

/// Opaque token identifying an application document across the plugin boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(pub u64);

/// A file opener offered to the file-format registry.
#[derive(Debug, Clone)]
pub struct OpenerRegistration {
    pub service: ServiceRef,
    pub description: String,
    pub priority: u32,
    pub can_open: bool,
    pub can_import: bool,
    pub has_probe: bool,
    pub patterns: Vec<FilePattern>,
    pub save_info: Option<SaveInfo>,
}

impl OpenerRegistration {
    pub fn id(&self) -> String {
        self.service.qualified_id()
    }
}

/// A file saver offered to the file-format registry.
#[derive(Debug, Clone)]
pub struct SaverRegistration {
    pub service: ServiceRef,
    pub extension: Option<String>,
    pub description: String,
    pub format_level: FormatLevel,
    pub save_scope: SaveScope,
    /// Register as a default saver with this priority.
    pub default_priority: Option<i32>,
}

impl SaverRegistration {
    pub fn id(&self) -> String {
        self.service.qualified_id()
    }
}

/// A UI extension offered to the action registry.
#[derive(Debug, Clone)]
pub struct UiRegistration {
    pub service: ServiceRef,
    pub descriptor_path: PathBuf,
    pub descriptor: String,
    pub actions: Vec<UiAction>,
}

/// Identifier returned by [`ActionRegistry::register_actions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutId(pub u64);

/// File-format registry of the host application.
pub trait FileFormatRegistry {
    fn register_opener(&mut self, priority: u32, opener: OpenerRegistration) -> PluginResult<()>;
    fn unregister_opener(&mut self, opener_id: &str);
    fn register_saver(&mut self, saver: SaverRegistration) -> PluginResult<()>;
    fn unregister_saver(&mut self, saver_id: &str);
}

/// Function-name registry of the host application.
pub trait FunctionRegistry {
    fn register_category(&mut self, name: &str, translated_name: Option<&str>);
    /// Register a function by name only; full details come from `resolver` on first use.
    fn add_function(&mut self, category: &str, name: &str, resolver: ServiceRef) -> PluginResult<()>;
    fn remove_function(&mut self, category: &str, name: &str);
    /// True while a document still references the function.
    fn is_in_use(&self, name: &str) -> bool;
}

/// UI-action registry of the host application.
pub trait ActionRegistry {
    fn register_actions(&mut self, registration: UiRegistration) -> PluginResult<LayoutId>;
    fn remove_actions(&mut self, layout: LayoutId);
}

/// Bundle of host registries handed to the plugin registry.
pub struct Host {
    pub formats: Box<dyn FileFormatRegistry>,
    pub functions: Box<dyn FunctionRegistry>,
    pub actions: Box<dyn ActionRegistry>,
}

impl Host {
    pub fn new(
        formats: Box<dyn FileFormatRegistry>,
        functions: Box<dyn FunctionRegistry>,
        actions: Box<dyn ActionRegistry>,
    ) -> Self {
        Self { formats, functions, actions }
    }

    /// Host backed by fresh in-memory registries.
    pub fn in_memory() -> Self {
        Self::new(
            Box::new(InMemoryFormats::default()),
            Box::new(InMemoryFunctions::default()),
            Box::new(InMemoryActions::default()),
        )
    }
}

#[derive(Debug, Default)]
struct FormatTable {
    openers: BTreeMap<String, (u32, OpenerRegistration)>,
    savers: BTreeMap<String, SaverRegistration>,
}

/// In-memory [`FileFormatRegistry`]. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFormats {
    inner: Rc<RefCell<FormatTable>>,
}

impl InMemoryFormats {
    pub fn opener_ids(&self) -> Vec<String> {
        self.inner.borrow().openers.keys().cloned().collect()
    }

    pub fn saver_ids(&self) -> Vec<String> {
        self.inner.borrow().savers.keys().cloned().collect()
    }

    pub fn opener(&self, id: &str) -> Option<OpenerRegistration> {
        self.inner.borrow().openers.get(id).map(|(_, o)| o.clone())
    }

    pub fn saver(&self, id: &str) -> Option<SaverRegistration> {
        self.inner.borrow().savers.get(id).cloned()
    }

    /// Openers ordered by descending priority.
    pub fn openers_by_priority(&self) -> Vec<OpenerRegistration> {
        let table = self.inner.borrow();
        let mut openers: Vec<_> = table.openers.values().cloned().collect();
        openers.sort_by(|a, b| b.0.cmp(&a.0));
        openers.into_iter().map(|(_, o)| o).collect()
    }
}

impl FileFormatRegistry for InMemoryFormats {
    fn register_opener(&mut self, priority: u32, opener: OpenerRegistration) -> PluginResult<()> {
        let id = opener.id();
        let mut table = self.inner.borrow_mut();
        if table.openers.contains_key(&id) {
            return Err(ErrorChain::new(
                ErrorKind::ServiceActivationFailed,
                format!("File opener '{id}' is already registered"),
            ));
        }
        table.openers.insert(id, (priority, opener));
        Ok(())
    }

    fn unregister_opener(&mut self, opener_id: &str) {
        self.inner.borrow_mut().openers.remove(opener_id);
    }

    fn register_saver(&mut self, saver: SaverRegistration) -> PluginResult<()> {
        let id = saver.id();
        let mut table = self.inner.borrow_mut();
        if table.savers.contains_key(&id) {
            return Err(ErrorChain::new(
                ErrorKind::ServiceActivationFailed,
                format!("File saver '{id}' is already registered"),
            ));
        }
        table.savers.insert(id, saver);
        Ok(())
    }

    fn unregister_saver(&mut self, saver_id: &str) {
        self.inner.borrow_mut().savers.remove(saver_id);
    }
}

#[derive(Debug, Default)]
struct FunctionTable {
    categories: BTreeMap<String, Option<String>>,
    functions: BTreeMap<String, (String, ServiceRef)>,
    refs: HashMap<String, usize>,
}

/// In-memory [`FunctionRegistry`]. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFunctions {
    inner: Rc<RefCell<FunctionTable>>,
}

impl InMemoryFunctions {
    pub fn categories(&self) -> Vec<String> {
        self.inner.borrow().categories.keys().cloned().collect()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.inner.borrow().functions.keys().cloned().collect()
    }

    /// Resolver registered for a function name (names are case-insensitive).
    pub fn resolver(&self, name: &str) -> Option<ServiceRef> {
        self.inner.borrow().functions.get(&name.to_ascii_uppercase()).map(|(_, r)| r.clone())
    }

    /// Record that a document now references `name`.
    pub fn acquire(&self, name: &str) {
        *self.inner.borrow_mut().refs.entry(name.to_ascii_uppercase()).or_insert(0) += 1;
    }

    /// Drop one reference to `name`.
    pub fn release(&self, name: &str) {
        let mut table = self.inner.borrow_mut();
        if let Some(count) = table.refs.get_mut(&name.to_ascii_uppercase()) {
            *count = count.saturating_sub(1);
        }
    }
}

impl FunctionRegistry for InMemoryFunctions {
    fn register_category(&mut self, name: &str, translated_name: Option<&str>) {
        self.inner
            .borrow_mut()
            .categories
            .entry(name.to_string())
            .or_insert_with(|| translated_name.map(str::to_string));
    }

    fn add_function(&mut self, category: &str, name: &str, resolver: ServiceRef) -> PluginResult<()> {
        let key = name.to_ascii_uppercase();
        let mut table = self.inner.borrow_mut();
        if let Some((_, existing)) = table.functions.get(&key) {
            return Err(ErrorChain::new(
                ErrorKind::ServiceActivationFailed,
                format!("Function '{name}' is already provided by {existing}"),
            ));
        }
        table.functions.insert(key, (category.to_string(), resolver));
        Ok(())
    }

    fn remove_function(&mut self, category: &str, name: &str) {
        let key = name.to_ascii_uppercase();
        let mut table = self.inner.borrow_mut();
        if table.functions.get(&key).is_some_and(|(c, _)| c == category) {
            table.functions.remove(&key);
            table.refs.remove(&key);
        }
    }

    fn is_in_use(&self, name: &str) -> bool {
        self.inner.borrow().refs.get(&name.to_ascii_uppercase()).is_some_and(|n| *n > 0)
    }
}

#[derive(Debug, Default)]
struct ActionTable {
    next_id: u64,
    layouts: BTreeMap<u64, UiRegistration>,
}

/// In-memory [`ActionRegistry`]. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryActions {
    inner: Rc<RefCell<ActionTable>>,
}

impl InMemoryActions {
    pub fn layout_count(&self) -> usize {
        self.inner.borrow().layouts.len()
    }

    /// Action names across all registered layouts.
    pub fn action_names(&self) -> Vec<String> {
        self.inner
            .borrow()
            .layouts
            .values()
            .flat_map(|l| l.actions.iter().map(|a| a.name.clone()))
            .collect()
    }

    /// Service that dispatches `action`, if any layout declares it.
    pub fn dispatcher(&self, action: &str) -> Option<ServiceRef> {
        self.inner
            .borrow()
            .layouts
            .values()
            .find(|l| l.actions.iter().any(|a| a.name == action))
            .map(|l| l.service.clone())
    }
}

impl ActionRegistry for InMemoryActions {
    fn register_actions(&mut self, registration: UiRegistration) -> PluginResult<LayoutId> {
        let mut table = self.inner.borrow_mut();
        table.next_id += 1;
        let id = table.next_id;
        table.layouts.insert(id, registration);
        Ok(LayoutId(id))
    }

    fn remove_actions(&mut self, layout: LayoutId) {
        self.inner.borrow_mut().layouts.remove(&layout.0);
    }
}
