//! UI extension service: menu/toolbar actions described by a layout file.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{not_bound, ServiceBehavior, ServiceContext};
use crate::plugin::host::{Host, LayoutId, UiRegistration};
use crate::plugin::types::ServiceType;
use crate::plugin::{ErrorChain, ErrorKind, PluginResult};

/// One action declared by a UI service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiAction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub always_available: bool,
}

impl UiAction {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), label: None, icon: None, always_available: false }
    }
}

/// Dispatch function bound by a loader; receives the action name.
pub type ActionHandler = Rc<dyn Fn(&str) -> PluginResult<()>>;

pub struct UiService {
    /// Layout file, relative to the plugin directory.
    pub file: String,
    pub actions: Vec<UiAction>,
    handler: Option<ActionHandler>,
    layout: Option<LayoutId>,
}

impl UiService {
    pub fn new(file: impl Into<String>, actions: Vec<UiAction>) -> Self {
        Self { file: file.into(), actions, handler: None, layout: None }
    }

    pub fn bind(&mut self, handler: ActionHandler) {
        self.handler = Some(handler);
    }

    pub fn declares(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.name == action)
    }

    pub fn dispatch(&self, service_id: &str, action: &str) -> PluginResult<()> {
        if !self.declares(action) {
            return Err(ErrorChain::new(
                ErrorKind::Invocation,
                format!("Unknown action '{action}' for service '{service_id}'"),
            ));
        }
        let handler = self.handler.as_ref().ok_or_else(|| not_bound(service_id))?;
        handler(action)
    }
}

impl std::fmt::Debug for UiService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiService")
            .field("file", &self.file)
            .field("actions", &self.actions)
            .field("bound", &self.handler.is_some())
            .field("layout", &self.layout)
            .finish()
    }
}

impl ServiceBehavior for UiService {
    fn service_type(&self) -> ServiceType {
        ServiceType::Ui
    }

    fn activate(&mut self, service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        let path = ctx.plugin_dir.join(&self.file);
        let descriptor = std::fs::read_to_string(&path).map_err(|e| {
            ErrorChain::with_detail(
                ErrorKind::ServiceActivationFailed,
                format!("Cannot read UI description from file {}", path.display()),
                ErrorChain::io(&path, &e),
            )
        })?;
        let layout = ctx.host.actions.register_actions(UiRegistration {
            service: ctx.service_ref(service_id),
            descriptor_path: path,
            descriptor,
            actions: self.actions.clone(),
        })?;
        self.layout = Some(layout);
        Ok(())
    }

    fn deactivate(&mut self, _service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        if let Some(layout) = self.layout.take() {
            ctx.host.actions.remove_actions(layout);
        }
        Ok(())
    }

    fn is_in_use(&self, _host: &Host) -> bool {
        false
    }

    fn clear_bindings(&mut self) {
        self.handler = None;
    }

    fn describe(&self) -> String {
        format!("User interface with {} action(s)", self.actions.len())
    }
}
