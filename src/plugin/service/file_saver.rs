//! File saver service: writes documents in a plugin-provided format.

use std::path::Path;
use std::rc::Rc;

use super::{not_bound, ServiceBehavior, ServiceContext};
use crate::plugin::host::{DocumentHandle, Host, SaverRegistration};
use crate::plugin::types::{FormatLevel, SaveScope, ServiceType};
use crate::plugin::PluginResult;

/// Entry points bound by a loader for a file saver.
#[derive(Clone)]
pub struct SaverHooks {
    pub save: Rc<dyn Fn(&Path, DocumentHandle) -> PluginResult<()>>,
}

impl SaverHooks {
    pub fn new(save: impl Fn(&Path, DocumentHandle) -> PluginResult<()> + 'static) -> Self {
        Self { save: Rc::new(save) }
    }
}

impl std::fmt::Debug for SaverHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaverHooks").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct FileSaverService {
    pub description: String,
    pub extension: Option<String>,
    pub format_level: FormatLevel,
    pub save_scope: SaveScope,
    pub default_priority: Option<i32>,
    hooks: Option<SaverHooks>,
    registered_as: Option<String>,
}

impl FileSaverService {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            extension: None,
            format_level: FormatLevel::WriteOnly,
            save_scope: SaveScope::Workbook,
            default_priority: None,
            hooks: None,
            registered_as: None,
        }
    }

    pub fn bind(&mut self, hooks: SaverHooks) {
        self.hooks = Some(hooks);
    }

    pub fn hooks(&self) -> Option<&SaverHooks> {
        self.hooks.as_ref()
    }

    pub fn save(&self, service_id: &str, path: &Path, document: DocumentHandle) -> PluginResult<()> {
        let hooks = self.hooks.as_ref().ok_or_else(|| not_bound(service_id))?;
        (hooks.save)(path, document)
    }
}

impl ServiceBehavior for FileSaverService {
    fn service_type(&self) -> ServiceType {
        ServiceType::FileSaver
    }

    fn activate(&mut self, service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        let registration = SaverRegistration {
            service: ctx.service_ref(service_id),
            extension: self.extension.clone(),
            description: self.description.clone(),
            format_level: self.format_level,
            save_scope: self.save_scope,
            default_priority: self.default_priority,
        };
        let id = registration.id();
        ctx.host.formats.register_saver(registration)?;
        self.registered_as = Some(id);
        Ok(())
    }

    fn deactivate(&mut self, _service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        if let Some(id) = self.registered_as.take() {
            ctx.host.formats.unregister_saver(&id);
        }
        Ok(())
    }

    fn is_in_use(&self, _host: &Host) -> bool {
        false
    }

    fn clear_bindings(&mut self) {
        self.hooks = None;
    }

    fn describe(&self) -> String {
        format!("File saver - {}", self.description)
    }
}
