//! General-purpose service: whole-plugin init and cleanup hooks.

use std::rc::Rc;

use super::{not_bound, ServiceBehavior, ServiceContext};
use crate::plugin::host::Host;
use crate::plugin::types::ServiceType;
use crate::plugin::PluginResult;

/// Entry points bound by a loader for a general service.
#[derive(Clone)]
pub struct GeneralHooks {
    pub init: Rc<dyn Fn() -> PluginResult<()>>,
    pub cleanup: Rc<dyn Fn() -> PluginResult<()>>,
    /// Absent when the plugin does not export a veto; the service is then
    /// always deactivatable.
    pub can_deactivate: Option<Rc<dyn Fn() -> bool>>,
}

impl GeneralHooks {
    pub fn new(
        init: impl Fn() -> PluginResult<()> + 'static,
        cleanup: impl Fn() -> PluginResult<()> + 'static,
    ) -> Self {
        Self { init: Rc::new(init), cleanup: Rc::new(cleanup), can_deactivate: None }
    }

    pub fn with_can_deactivate(mut self, f: impl Fn() -> bool + 'static) -> Self {
        self.can_deactivate = Some(Rc::new(f));
        self
    }
}

impl std::fmt::Debug for GeneralHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneralHooks")
            .field("can_deactivate", &self.can_deactivate.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct GeneralService {
    hooks: Option<GeneralHooks>,
}

impl GeneralService {
    pub fn bind(&mut self, hooks: GeneralHooks) {
        self.hooks = Some(hooks);
    }

    pub fn hooks(&self) -> Option<&GeneralHooks> {
        self.hooks.as_ref()
    }
}

impl ServiceBehavior for GeneralService {
    fn service_type(&self) -> ServiceType {
        ServiceType::General
    }

    fn activate(&mut self, service_id: &str, _ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        let hooks = self.hooks.as_ref().ok_or_else(|| not_bound(service_id))?;
        (hooks.init)()
    }

    fn deactivate(&mut self, service_id: &str, _ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        let hooks = self.hooks.as_ref().ok_or_else(|| not_bound(service_id))?;
        (hooks.cleanup)()
    }

    fn is_in_use(&self, _host: &Host) -> bool {
        self.hooks
            .as_ref()
            .and_then(|h| h.can_deactivate.as_ref())
            .is_some_and(|can_deactivate| !can_deactivate())
    }

    fn clear_bindings(&mut self) {
        self.hooks = None;
    }

    fn describe(&self) -> String {
        "General".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::path::Path;
    use std::rc::Rc;

    use super::*;
    use crate::plugin::loader::LoaderKinds;

    #[test]
    fn test_hooks_drive_lifecycle() {
        let calls = Rc::new(Cell::new(0));
        let (on_init, on_cleanup) = (calls.clone(), calls.clone());
        let mut service = GeneralService::default();
        service.bind(GeneralHooks::new(
            move || {
                on_init.set(on_init.get() + 1);
                Ok(())
            },
            move || {
                on_cleanup.set(on_cleanup.get() + 10);
                Ok(())
            },
        ));

        let mut host = Host::in_memory();
        let mut kinds = LoaderKinds::default();
        let mut ctx = ServiceContext {
            plugin_id: "p",
            plugin_dir: Path::new("."),
            host: &mut host,
            loader_kinds: &mut kinds,
        };
        service.activate("misc", &mut ctx).unwrap();
        service.deactivate("misc", &mut ctx).unwrap();
        assert_eq!(calls.get(), 11);
    }

    #[test]
    fn test_can_deactivate_veto() {
        let mut service = GeneralService::default();
        let host = Host::in_memory();
        assert!(!service.is_in_use(&host));

        service.bind(GeneralHooks::new(|| Ok(()), || Ok(())).with_can_deactivate(|| false));
        assert!(service.is_in_use(&host));

        service.clear_bindings();
        assert!(!service.is_in_use(&host));
    }
}
