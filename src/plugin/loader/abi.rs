//! Binary interface between the native loader and plugin modules.
//!
//! A native plugin module exports:
//!
//! - `plugboard_module_marker`: a [`ModuleMarker`] static, checked on load.
//! - optional `plugboard_init` / `plugboard_cleanup` hooks ([`ModuleHookFn`]).
//! - per-service entry points named after the service id or function
//!   category (see [`symbol_names`]).
//!
//! Integer return codes follow the C convention: zero is success.

use std::ffi::{c_char, c_void};

use super::Loader;

pub const MODULE_MARKER_SYMBOL: &str = "plugboard_module_marker";
pub const MODULE_INIT_SYMBOL: &str = "plugboard_init";
pub const MODULE_CLEANUP_SYMBOL: &str = "plugboard_cleanup";

/// "PLBG"
pub const MODULE_MAGIC: u32 = 0x504c_4247;
pub const MODULE_ABI_VERSION: u32 = 1;

/// Version record every native module must export.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleMarker {
    pub magic: u32,
    pub abi_version: u32,
}

impl ModuleMarker {
    pub const CURRENT: Self = Self { magic: MODULE_MAGIC, abi_version: MODULE_ABI_VERSION };
}

/// Whole-module init/cleanup hook.
pub type ModuleHookFn = extern "C" fn() -> i32;

/// `<id>_init` / `<id>_cleanup` of a general service.
pub type GeneralHookFn = extern "C" fn() -> i32;

/// `<id>_can_deactivate` of a general service.
pub type CanDeactivateFn = extern "C" fn() -> bool;

/// `<id>_file_probe`: receives a NUL-terminated path.
pub type FileProbeFn = extern "C" fn(path: *const c_char) -> bool;

/// `<id>_file_open` / `<id>_file_save`: path plus document token.
pub type FileIoFn = extern "C" fn(path: *const c_char, document: u64) -> i32;

/// Worksheet function body: reads `count` arguments, writes one result.
pub type FunctionFn = extern "C" fn(args: *const f64, count: usize, result: *mut f64) -> i32;

/// UI verb handler.
pub type VerbFn = extern "C" fn() -> i32;

/// `<service_id>_get_loader_type`. Rust ABI: the module must be built with the
/// same compiler as the host.
pub type GetLoaderTypeFn = fn() -> Box<dyn Loader>;

/// One row of a `<category>_functions` table. The table ends with a row whose
/// `name` is null.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FunctionInfo {
    pub name: *const c_char,
    pub args: *const c_char,
    /// Comma separated.
    pub arg_names: *const c_char,
    pub help: *const c_char,
    pub func: Option<FunctionFn>,
}

impl FunctionInfo {
    pub const END: Self = Self {
        name: std::ptr::null(),
        args: std::ptr::null(),
        arg_names: std::ptr::null(),
        help: std::ptr::null(),
        func: None,
    };
}

/// One row of a `<id>_ui_verbs` table, terminated by a null `name`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UiVerb {
    pub name: *const c_char,
    pub handler: Option<VerbFn>,
}

impl UiVerb {
    pub const END: Self = Self { name: std::ptr::null(), handler: None };
}

// Tables are immutable data exported by the module; the pointers only ever
// reference static strings and functions inside it.
#[allow(unsafe_code)]
unsafe impl Sync for FunctionInfo {}
#[allow(unsafe_code)]
unsafe impl Sync for UiVerb {}

/// Erase a static or function pointer for registration in a symbol table.
pub fn symbol_ptr<T>(value: &'static T) -> *const c_void {
    std::ptr::from_ref(value).cast()
}

/// Entry-point naming convention.
pub mod symbol_names {
    pub fn general_init(service_id: &str) -> String {
        format!("{service_id}_init")
    }

    pub fn general_cleanup(service_id: &str) -> String {
        format!("{service_id}_cleanup")
    }

    pub fn general_can_deactivate(service_id: &str) -> String {
        format!("{service_id}_can_deactivate")
    }

    pub fn file_probe(service_id: &str) -> String {
        format!("{service_id}_file_probe")
    }

    pub fn file_open(service_id: &str) -> String {
        format!("{service_id}_file_open")
    }

    pub fn file_save(service_id: &str) -> String {
        format!("{service_id}_file_save")
    }

    pub fn function_table(category: &str) -> String {
        format!("{category}_functions")
    }

    pub fn loader_type(service_id: &str) -> String {
        format!("{service_id}_get_loader_type")
    }

    pub fn ui_verbs(service_id: &str) -> String {
        format!("{service_id}_ui_verbs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_names() {
        assert_eq!(symbol_names::file_open("csv"), "csv_file_open");
        assert_eq!(symbol_names::file_probe("csv"), "csv_file_probe");
        assert_eq!(symbol_names::function_table("CSV"), "CSV_functions");
        assert_eq!(symbol_names::loader_type("py"), "py_get_loader_type");
        assert_eq!(symbol_names::ui_verbs("menu"), "menu_ui_verbs");
    }

    #[test]
    fn test_current_marker() {
        assert_eq!(ModuleMarker::CURRENT.magic, MODULE_MAGIC);
        assert_eq!(ModuleMarker::CURRENT.abi_version, MODULE_ABI_VERSION);
    }
}
