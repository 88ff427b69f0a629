//! Function group service: a category of worksheet functions.
//!
//! Activation only registers function *names*. The full signature of a
//! function (argument spec, argument names, help) is fetched from the bound
//! [`FunctionTable`] the first time that function is resolved, then cached.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use super::{not_bound, ServiceBehavior, ServiceContext};
use crate::plugin::host::Host;
use crate::plugin::types::ServiceType;
use crate::plugin::{ErrorChain, ErrorKind, PluginResult};

/// Full description of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: String,
    /// Argument type spec, one character per argument.
    pub args: String,
    pub arg_names: Vec<String>,
    pub help: String,
}

/// Table of functions exported by a plugin.
pub trait FunctionTable {
    /// Look up one function by name (case-insensitive).
    fn signature(&self, name: &str) -> Option<FunctionSignature>;

    fn call(&self, name: &str, args: &[f64]) -> PluginResult<f64>;
}

#[derive(Debug)]
pub struct FunctionGroupService {
    pub category: String,
    pub translated_category: Option<String>,
    pub functions: Vec<String>,
    table: Option<Rc<dyn FunctionTable>>,
    resolved: RefCell<HashMap<String, FunctionSignature>>,
    resolutions: Cell<usize>,
    registered: Vec<String>,
}

impl std::fmt::Debug for dyn FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FunctionTable")
    }
}

impl FunctionGroupService {
    pub fn new(category: impl Into<String>, functions: Vec<String>) -> Self {
        Self {
            category: category.into(),
            translated_category: None,
            functions,
            table: None,
            resolved: RefCell::new(HashMap::new()),
            resolutions: Cell::new(0),
            registered: Vec::new(),
        }
    }

    pub fn bind(&mut self, table: Rc<dyn FunctionTable>) {
        self.table = Some(table);
    }

    pub fn is_bound(&self) -> bool {
        self.table.is_some()
    }

    pub fn declares(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.eq_ignore_ascii_case(name))
    }

    /// Number of signatures fetched from the table so far.
    pub fn resolution_count(&self) -> usize {
        self.resolutions.get()
    }

    /// Full signature of `name`, fetched from the table on first request.
    pub fn resolve(&self, service_id: &str, name: &str) -> PluginResult<FunctionSignature> {
        if !self.declares(name) {
            return Err(ErrorChain::new(
                ErrorKind::Invocation,
                format!("Function '{name}' is not part of category \"{}\"", self.category),
            ));
        }
        let key = name.to_ascii_uppercase();
        if let Some(signature) = self.resolved.borrow().get(&key) {
            return Ok(signature.clone());
        }

        let table = self.table.as_ref().ok_or_else(|| not_bound(service_id))?;
        let signature = table.signature(name).ok_or_else(|| {
            ErrorChain::new(
                ErrorKind::ServiceLoadFailed,
                format!("Function '{name}' is missing from the table of service '{service_id}'"),
            )
        })?;
        self.resolutions.set(self.resolutions.get() + 1);
        tracing::debug!(function = %key, service = %service_id, "Resolved function signature");
        self.resolved.borrow_mut().insert(key, signature.clone());
        Ok(signature)
    }

    pub fn call(&self, service_id: &str, name: &str, args: &[f64]) -> PluginResult<f64> {
        let signature = self.resolve(service_id, name)?;
        let table = self.table.as_ref().ok_or_else(|| not_bound(service_id))?;
        table.call(&signature.name, args)
    }
}

impl ServiceBehavior for FunctionGroupService {
    fn service_type(&self) -> ServiceType {
        ServiceType::FunctionGroup
    }

    fn activate(&mut self, service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        ctx.host.functions.register_category(&self.category, self.translated_category.as_deref());
        let resolver = ctx.service_ref(service_id);
        for name in &self.functions {
            if let Err(e) = ctx.host.functions.add_function(&self.category, name, resolver.clone()) {
                for added in self.registered.drain(..) {
                    ctx.host.functions.remove_function(&self.category, &added);
                }
                return Err(e);
            }
            self.registered.push(name.clone());
        }
        Ok(())
    }

    fn deactivate(&mut self, _service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        for name in self.registered.drain(..) {
            ctx.host.functions.remove_function(&self.category, &name);
        }
        Ok(())
    }

    fn is_in_use(&self, host: &Host) -> bool {
        self.registered.iter().any(|name| host.functions.is_in_use(name))
    }

    fn clear_bindings(&mut self) {
        self.table = None;
        self.resolved.borrow_mut().clear();
    }

    fn describe(&self) -> String {
        match self.functions.len() {
            1 => format!("1 function in category \"{}\"", self.category),
            n => format!("Group of {n} functions in category \"{}\"", self.category),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl FunctionTable for Doubler {
        fn signature(&self, name: &str) -> Option<FunctionSignature> {
            name.eq_ignore_ascii_case("DOUBLE").then(|| FunctionSignature {
                name: "DOUBLE".to_string(),
                args: "f".to_string(),
                arg_names: vec!["value".to_string()],
                help: "Doubles a number".to_string(),
            })
        }

        fn call(&self, _name: &str, args: &[f64]) -> PluginResult<f64> {
            Ok(args.first().copied().unwrap_or_default() * 2.0)
        }
    }

    #[test]
    fn test_resolve_is_lazy_and_cached() {
        let mut group = FunctionGroupService::new("MATH", vec!["DOUBLE".to_string()]);
        group.bind(Rc::new(Doubler));
        assert_eq!(group.resolution_count(), 0);

        group.resolve("math", "double").unwrap();
        group.resolve("math", "DOUBLE").unwrap();
        assert_eq!(group.resolution_count(), 1);

        assert!((group.call("math", "DOUBLE", &[21.0]).unwrap() - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_undeclared_function_rejected() {
        let mut group = FunctionGroupService::new("MATH", vec!["DOUBLE".to_string()]);
        group.bind(Rc::new(Doubler));

        let err = group.resolve("math", "TRIPLE").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invocation);
    }

    #[test]
    fn test_describe_counts_functions() {
        let one = FunctionGroupService::new("CSV", vec!["CSVPARSE".to_string()]);
        assert_eq!(one.describe(), "1 function in category \"CSV\"");

        let two = FunctionGroupService::new("CSV", vec!["A".to_string(), "B".to_string()]);
        assert_eq!(two.describe(), "Group of 2 functions in category \"CSV\"");
    }
}
