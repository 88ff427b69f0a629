//! Native shared-module loader.
//!
//! Opens `<plugin dir>/<module_file>`, verifies its [`ModuleMarker`], and binds
//! services to exported symbols named by [`symbol_names`]. Every bound entry
//! point keeps a reference to the module, so the module stays mapped until
//! the last service using it is unloaded.

#![allow(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::abi::{
    symbol_names, CanDeactivateFn, FileIoFn, FileProbeFn, FunctionInfo, GeneralHookFn,
    GetLoaderTypeFn, ModuleHookFn, ModuleMarker, UiVerb, MODULE_ABI_VERSION,
    MODULE_CLEANUP_SYMBOL, MODULE_INIT_SYMBOL, MODULE_MAGIC, MODULE_MARKER_SYMBOL,
};
use super::{Loader, LoaderFactory};
use crate::plugin::service::{
    FileOpenerService, FileSaverService, FunctionGroupService, FunctionSignature, FunctionTable,
    GeneralHooks, GeneralService, LoaderProviderService, OpenerHooks, SaverHooks, UiService,
};
use crate::plugin::types::NATIVE_LOADER_KIND;
use crate::plugin::{ErrorChain, ErrorKind, PluginResult};

/// A loaded module that exported symbols can be looked up in.
pub trait NativeModuleHandle {
    /// Address of `name`, or `None` if the module does not export it.
    fn resolve_symbol(&self, name: &str) -> Option<*const c_void>;
}

/// Shared library opened with `libloading`.
pub struct SharedLibrary {
    library: libloading::Library,
    path: PathBuf,
}

impl SharedLibrary {
    pub fn open(path: &Path) -> PluginResult<Self> {
        // SAFETY: opening a library runs its initializers. Plugin modules are
        // code the user installed and chose to activate.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| {
            ErrorChain::new(
                ErrorKind::ServiceLoadFailed,
                format!("Unable to open module file \"{}\": {e}", path.display()),
            )
        })?;
        Ok(Self { library, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NativeModuleHandle for SharedLibrary {
    fn resolve_symbol(&self, name: &str) -> Option<*const c_void> {
        // SAFETY: the symbol is read as a plain address; callers cast it to the
        // type the ABI documents for that name.
        let symbol = unsafe { self.library.get::<*const c_void>(name.as_bytes()) }.ok()?;
        let address = *symbol;
        (!address.is_null()).then_some(address)
    }
}

impl std::fmt::Debug for SharedLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLibrary").field("path", &self.path).finish()
    }
}

/// Symbol table for a module linked into the host binary.
#[derive(Debug, Clone, Default)]
pub struct StaticModule {
    symbols: HashMap<String, *const c_void>,
}

impl StaticModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(mut self, name: impl Into<String>, address: *const c_void) -> Self {
        self.symbols.insert(name.into(), address);
        self
    }

    pub fn symbol_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.symbols.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl NativeModuleHandle for StaticModule {
    fn resolve_symbol(&self, name: &str) -> Option<*const c_void> {
        self.symbols.get(name).copied().filter(|p| !p.is_null())
    }
}

/// Opens the module file of a plugin.
pub type ModuleOpener = Rc<dyn Fn(&Path) -> PluginResult<Rc<dyn NativeModuleHandle>>>;

/// Loader for the `native` kind.
pub struct NativeModuleLoader {
    opener: ModuleOpener,
    module_file: Option<String>,
    module_path: Option<PathBuf>,
    module: Option<Rc<dyn NativeModuleHandle>>,
}

impl Default for NativeModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeModuleLoader {
    /// Loader that opens shared libraries from disk.
    pub fn new() -> Self {
        Self::with_opener(Rc::new(|path: &Path| {
            SharedLibrary::open(path).map(|lib| Rc::new(lib) as Rc<dyn NativeModuleHandle>)
        }))
    }

    /// Loader with a custom way of opening module files.
    pub fn with_opener(opener: ModuleOpener) -> Self {
        Self { opener, module_file: None, module_path: None, module: None }
    }

    /// Factory producing loaders that share `opener`.
    pub fn factory(opener: ModuleOpener) -> LoaderFactory {
        Rc::new(move || Box::new(Self::with_opener(opener.clone())) as Box<dyn Loader>)
    }

    pub fn module_path(&self) -> Option<&Path> {
        self.module_path.as_deref()
    }

    fn module(&self) -> PluginResult<Rc<dyn NativeModuleHandle>> {
        self.module.clone().ok_or_else(|| {
            ErrorChain::new(ErrorKind::ServiceLoadFailed, "Plugin module is not loaded")
        })
    }

    fn module_name(&self) -> String {
        self.module_file.clone().unwrap_or_default()
    }

    /// Resolve every name in `names` or report all missing ones at once.
    fn resolve_required(
        &self,
        service_id: &str,
        names: &[String],
    ) -> PluginResult<(Rc<dyn NativeModuleHandle>, Vec<*const c_void>)> {
        let module = self.module()?;
        let mut found = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match module.resolve_symbol(name) {
                Some(address) => found.push(address),
                None => missing.push(name.as_str()),
            }
        }
        if missing.is_empty() {
            return Ok((module, found));
        }

        let mut err = ErrorChain::new(
            ErrorKind::ServiceLoadFailed,
            format!(
                "Module \"{}\" lacks required symbol(s) for service '{service_id}': {}",
                self.module_name(),
                missing.join(", ")
            ),
        );
        for name in missing {
            err.push_detail(ErrorChain::new(
                ErrorKind::ServiceLoadFailed,
                format!("File doesn't contain \"{name}\" function."),
            ));
        }
        Err(err)
    }

    fn resolve_optional(&self, module: &Rc<dyn NativeModuleHandle>, name: &str) -> Option<*const c_void> {
        let address = module.resolve_symbol(name);
        if address.is_none() {
            tracing::debug!(symbol = %name, module = %self.module_name(), "Optional symbol not exported");
        }
        address
    }
}

/// Reinterpret a resolved symbol address as a function pointer.
///
/// # Safety
///
/// `address` must be the address of a function whose signature is `F`.
unsafe fn cast_fn<F: Copy>(address: *const c_void) -> F {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const c_void>());
    std::mem::transmute_copy(&address)
}

fn check_status(code: i32, what: &str) -> PluginResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(ErrorChain::new(ErrorKind::Invocation, format!("{what} failed with code {code}")))
    }
}

fn c_path(path: &Path) -> PluginResult<CString> {
    CString::new(path.to_string_lossy().into_owned()).map_err(|_| {
        ErrorChain::new(ErrorKind::Invocation, format!("Path {} contains a NUL byte", path.display()))
    })
}

/// # Safety
///
/// `ptr` must be null or point at a NUL-terminated string that outlives the call.
unsafe fn owned_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

fn check_marker(module: &dyn NativeModuleHandle, path: &Path) -> PluginResult<()> {
    let address = module.resolve_symbol(MODULE_MARKER_SYMBOL).ok_or_else(|| {
        ErrorChain::new(
            ErrorKind::ServiceLoadFailed,
            format!("Module file \"{}\" has no {MODULE_MARKER_SYMBOL} record", path.display()),
        )
    })?;
    // SAFETY: by ABI contract the marker symbol is a `ModuleMarker` static.
    let marker = unsafe { address.cast::<ModuleMarker>().read_unaligned() };

    let mut problems = Vec::new();
    if marker.magic != MODULE_MAGIC {
        problems.push(ErrorChain::new(
            ErrorKind::ServiceLoadFailed,
            format!("Magic number mismatch: found {:#010x}, expected {MODULE_MAGIC:#010x}", marker.magic),
        ));
    }
    if marker.abi_version != MODULE_ABI_VERSION {
        problems.push(ErrorChain::new(
            ErrorKind::ServiceLoadFailed,
            format!(
                "ABI version mismatch: found {}, expected {MODULE_ABI_VERSION}",
                marker.abi_version
            ),
        ));
    }
    ErrorChain::check(
        ErrorKind::ServiceLoadFailed,
        format!("Module file \"{}\" has an invalid format", path.display()),
        problems,
    )
}

impl Loader for NativeModuleLoader {
    fn kind(&self) -> &str {
        NATIVE_LOADER_KIND
    }

    fn set_attributes(&mut self, attributes: &BTreeMap<String, String>) -> PluginResult<()> {
        let file = attributes
            .get("module_file")
            .or_else(|| attributes.get("module"))
            .filter(|f| !f.is_empty())
            .ok_or_else(|| {
                ErrorChain::new(ErrorKind::ServiceLoadFailed, "Module file name not given")
            })?;
        self.module_file = Some(file.clone());
        Ok(())
    }

    fn load_base(&mut self, plugin_dir: &Path) -> PluginResult<()> {
        let file = self.module_file.as_deref().ok_or_else(|| {
            ErrorChain::new(ErrorKind::ServiceLoadFailed, "Module file name not given")
        })?;
        let path = plugin_dir.join(file);
        let module = (self.opener)(&path)?;
        check_marker(module.as_ref(), &path)?;

        if let Some(address) = module.resolve_symbol(MODULE_INIT_SYMBOL) {
            // SAFETY: `plugboard_init` has the `ModuleHookFn` signature.
            let init: ModuleHookFn = unsafe { cast_fn(address) };
            check_status(init(), &format!("Initialization of \"{}\"", path.display())).map_err(
                |e| ErrorChain::with_detail(ErrorKind::ServiceLoadFailed, "Module init hook failed", e),
            )?;
        }

        self.module = Some(module);
        self.module_path = Some(path);
        Ok(())
    }

    fn unload_base(&mut self) -> PluginResult<()> {
        let Some(module) = self.module.take() else {
            return Ok(());
        };
        let result = match module.resolve_symbol(MODULE_CLEANUP_SYMBOL) {
            Some(address) => {
                // SAFETY: `plugboard_cleanup` has the `ModuleHookFn` signature.
                let cleanup: ModuleHookFn = unsafe { cast_fn(address) };
                check_status(cleanup(), &format!("Cleanup of \"{}\"", self.module_name()))
            }
            None => Ok(()),
        };
        drop(module);
        self.module_path = None;
        result
    }

    fn load_general(&mut self, service_id: &str, service: &mut GeneralService) -> PluginResult<()> {
        let names = [symbol_names::general_init(service_id), symbol_names::general_cleanup(service_id)];
        let (module, found) = self.resolve_required(service_id, &names)?;
        // SAFETY: naming convention fixes these signatures.
        let (init, cleanup): (GeneralHookFn, GeneralHookFn) =
            unsafe { (cast_fn(found[0]), cast_fn(found[1])) };

        let init_module = module.clone();
        let cleanup_module = module.clone();
        let mut hooks = GeneralHooks::new(
            move || {
                let _ = &init_module;
                check_status(init(), "Plugin init")
            },
            move || {
                let _ = &cleanup_module;
                check_status(cleanup(), "Plugin cleanup")
            },
        );

        let can_deactivate_name = symbol_names::general_can_deactivate(service_id);
        if let Some(address) = self.resolve_optional(&module, &can_deactivate_name) {
            // SAFETY: naming convention fixes the signature.
            let can_deactivate: CanDeactivateFn = unsafe { cast_fn(address) };
            let keep = module.clone();
            hooks = hooks.with_can_deactivate(move || {
                let _ = &keep;
                can_deactivate()
            });
        }
        service.bind(hooks);
        Ok(())
    }

    fn load_file_opener(&mut self, service_id: &str, service: &mut FileOpenerService) -> PluginResult<()> {
        let names = [symbol_names::file_open(service_id)];
        let (module, found) = self.resolve_required(service_id, &names)?;
        // SAFETY: naming convention fixes the signature.
        let open: FileIoFn = unsafe { cast_fn(found[0]) };

        let keep = module.clone();
        let mut hooks = OpenerHooks::new(move |path, document| {
            let _ = &keep;
            let path = c_path(path)?;
            check_status(open(path.as_ptr(), document.0), "File open")
        });

        if service.has_probe {
            let probe_name = symbol_names::file_probe(service_id);
            if let Some(address) = self.resolve_optional(&module, &probe_name) {
                // SAFETY: naming convention fixes the signature.
                let probe: FileProbeFn = unsafe { cast_fn(address) };
                let keep = module.clone();
                hooks = hooks.with_probe(move |path| {
                    let _ = &keep;
                    c_path(path).is_ok_and(|p| probe(p.as_ptr()))
                });
            }
        }
        service.bind(hooks);
        Ok(())
    }

    fn load_file_saver(&mut self, service_id: &str, service: &mut FileSaverService) -> PluginResult<()> {
        let names = [symbol_names::file_save(service_id)];
        let (module, found) = self.resolve_required(service_id, &names)?;
        // SAFETY: naming convention fixes the signature.
        let save: FileIoFn = unsafe { cast_fn(found[0]) };

        service.bind(SaverHooks::new(move |path, document| {
            let _ = &module;
            let path = c_path(path)?;
            check_status(save(path.as_ptr(), document.0), "File save")
        }));
        Ok(())
    }

    fn load_function_group(
        &mut self,
        service_id: &str,
        service: &mut FunctionGroupService,
    ) -> PluginResult<()> {
        let names = [symbol_names::function_table(&service.category)];
        let (module, found) = self.resolve_required(service_id, &names)?;
        service.bind(Rc::new(NativeFunctionTable { _module: module, table: found[0].cast() }));
        Ok(())
    }

    fn load_loader_provider(
        &mut self,
        service_id: &str,
        service: &mut LoaderProviderService,
    ) -> PluginResult<()> {
        let names = [symbol_names::loader_type(service_id)];
        let (module, found) = self.resolve_required(service_id, &names)?;
        // SAFETY: naming convention fixes the signature.
        let get_loader_type: GetLoaderTypeFn = unsafe { cast_fn(found[0]) };

        service.bind(Rc::new(move || {
            let _ = &module;
            get_loader_type()
        }));
        Ok(())
    }

    fn load_ui(&mut self, service_id: &str, service: &mut UiService) -> PluginResult<()> {
        let names = [symbol_names::ui_verbs(service_id)];
        let (module, found) = self.resolve_required(service_id, &names)?;
        let verbs = NativeVerbTable { _module: module, table: found[0].cast() };
        service.bind(Rc::new(move |action: &str| verbs.dispatch(action)));
        Ok(())
    }

    fn info(&self) -> Vec<(String, String)> {
        let mut info = vec![("Loader".to_string(), NATIVE_LOADER_KIND.to_string())];
        if let Some(file) = &self.module_file {
            info.push(("Module file".to_string(), file.clone()));
        }
        if let Some(path) = &self.module_path {
            info.push(("Module path".to_string(), path.display().to_string()));
        }
        info
    }
}

/// `<category>_functions` table of a loaded module.
struct NativeFunctionTable {
    _module: Rc<dyn NativeModuleHandle>,
    table: *const FunctionInfo,
}

impl NativeFunctionTable {
    fn find(&self, name: &str) -> Option<FunctionInfo> {
        let mut index = 0;
        loop {
            // SAFETY: the table is terminated by a null-name row and lives as
            // long as the module, which `self` keeps loaded.
            let entry = unsafe { *self.table.add(index) };
            // SAFETY: non-null names are NUL-terminated static strings.
            let entry_name = unsafe { owned_str(entry.name) }?;
            if entry_name.eq_ignore_ascii_case(name) {
                return Some(entry);
            }
            index += 1;
        }
    }
}

impl FunctionTable for NativeFunctionTable {
    fn signature(&self, name: &str) -> Option<FunctionSignature> {
        let entry = self.find(name)?;
        // SAFETY: see `find`.
        let (fn_name, args, arg_names, help) = unsafe {
            (owned_str(entry.name), owned_str(entry.args), owned_str(entry.arg_names), owned_str(entry.help))
        };
        Some(FunctionSignature {
            name: fn_name.unwrap_or_else(|| name.to_string()),
            args: args.unwrap_or_default(),
            arg_names: arg_names
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            help: help.unwrap_or_default(),
        })
    }

    fn call(&self, name: &str, args: &[f64]) -> PluginResult<f64> {
        let func = self.find(name).and_then(|e| e.func).ok_or_else(|| {
            ErrorChain::new(ErrorKind::Invocation, format!("Function '{name}' has no implementation"))
        })?;
        let mut result = 0.0;
        check_status(func(args.as_ptr(), args.len(), &mut result), &format!("Function '{name}'"))?;
        Ok(result)
    }
}

/// `<id>_ui_verbs` table of a loaded module.
struct NativeVerbTable {
    _module: Rc<dyn NativeModuleHandle>,
    table: *const UiVerb,
}

impl NativeVerbTable {
    fn dispatch(&self, action: &str) -> PluginResult<()> {
        let mut index = 0;
        loop {
            // SAFETY: null-name terminated table kept alive by `self.module`.
            let verb = unsafe { *self.table.add(index) };
            // SAFETY: non-null names are NUL-terminated static strings.
            let Some(verb_name) = (unsafe { owned_str(verb.name) }) else {
                return Err(ErrorChain::new(
                    ErrorKind::Invocation,
                    format!("Unknown action: {action}"),
                ));
            };
            if verb_name == action {
                let handler = verb.handler.ok_or_else(|| {
                    ErrorChain::new(ErrorKind::Invocation, format!("Action '{action}' has no handler"))
                })?;
                return check_status(handler(), &format!("Action '{action}'"));
            }
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::plugin::loader::abi::symbol_ptr;
    use crate::plugin::loader::{LoaderInstance, LoaderKinds};
    use crate::plugin::service::{Service, ServiceContext, ServiceKind, UiAction};
    use crate::plugin::{DocumentHandle, Host};

    static MARKER: ModuleMarker = ModuleMarker::CURRENT;
    static BAD_MARKER: ModuleMarker = ModuleMarker { magic: 0xdead_beef, abi_version: 99 };
    static OPENED: AtomicUsize = AtomicUsize::new(0);
    static SAVED: AtomicUsize = AtomicUsize::new(0);
    static MISC_INITS: AtomicUsize = AtomicUsize::new(0);
    static MISC_CLEANUPS: AtomicUsize = AtomicUsize::new(0);
    static SORTS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn csv_file_open(_path: *const c_char, document: u64) -> i32 {
        OPENED.store(usize::try_from(document).unwrap_or_default(), Ordering::SeqCst);
        0
    }

    extern "C" fn csv_file_probe(_path: *const c_char) -> bool {
        true
    }

    extern "C" fn csvparse(args: *const f64, count: usize, result: *mut f64) -> i32 {
        let args = unsafe { std::slice::from_raw_parts(args, count) };
        unsafe { *result = args.iter().sum() };
        0
    }

    extern "C" fn txt_file_save(_path: *const c_char, document: u64) -> i32 {
        SAVED.store(usize::try_from(document).unwrap_or_default(), Ordering::SeqCst);
        0
    }

    extern "C" fn misc_init() -> i32 {
        MISC_INITS.fetch_add(1, Ordering::SeqCst);
        0
    }

    extern "C" fn misc_cleanup() -> i32 {
        MISC_CLEANUPS.fetch_add(1, Ordering::SeqCst);
        0
    }

    extern "C" fn noop_hook() -> i32 {
        0
    }

    extern "C" fn refuse_deactivation() -> bool {
        false
    }

    extern "C" fn sort_verb() -> i32 {
        SORTS.fetch_add(1, Ordering::SeqCst);
        0
    }

    extern "C" fn failing_verb() -> i32 {
        3
    }

    static MENU_VERBS: [UiVerb; 3] = [
        UiVerb { name: c"Sort".as_ptr(), handler: Some(sort_verb) },
        UiVerb { name: c"Break".as_ptr(), handler: Some(failing_verb) },
        UiVerb::END,
    ];

    struct ScriptLoader;

    impl Loader for ScriptLoader {
        fn kind(&self) -> &str {
            "python"
        }

        fn set_attributes(&mut self, _attributes: &BTreeMap<String, String>) -> PluginResult<()> {
            Ok(())
        }

        fn load_base(&mut self, _plugin_dir: &Path) -> PluginResult<()> {
            Ok(())
        }

        fn unload_base(&mut self) -> PluginResult<()> {
            Ok(())
        }
    }

    fn script_loader() -> Box<dyn Loader> {
        Box::new(ScriptLoader)
    }

    static CSV_FUNCTIONS: [FunctionInfo; 2] = [
        FunctionInfo {
            name: c"CSVPARSE".as_ptr(),
            args: c"ff".as_ptr(),
            arg_names: c"a, b".as_ptr(),
            help: c"Sums two numbers".as_ptr(),
            func: Some(csvparse),
        },
        FunctionInfo::END,
    ];

    fn module(symbols: &[(&str, *const c_void)]) -> ModuleOpener {
        let module = symbols
            .iter()
            .fold(StaticModule::new(), |m, (name, address)| m.with_symbol(*name, *address));
        Rc::new(move |_path: &Path| {
            Ok::<_, ErrorChain>(Rc::new(module.clone()) as Rc<dyn NativeModuleHandle>)
        })
    }

    fn instance(opener: ModuleOpener) -> PluginResult<LoaderInstance> {
        let mut instance = LoaderInstance::new(Box::new(NativeModuleLoader::with_opener(opener)));
        let attributes = BTreeMap::from([("module_file".to_string(), "libcsv.so".to_string())]);
        instance.set_attributes(&attributes)?;
        instance.load_base(Path::new("/plugins/csv"))?;
        Ok(instance)
    }

    fn opener_service() -> Service {
        Service::new("csv", ServiceKind::FileOpener(FileOpenerService::new("CSV")))
    }

    #[test]
    fn test_missing_required_symbol() {
        let opener = module(&[(MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER))]);
        let mut loader = instance(opener).unwrap();
        let mut service = opener_service();

        let err = service.load(&mut loader).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceLoadFailed);
        assert!(err.mentions("csv_file_open"));
        assert!(!service.is_loaded());
        assert_eq!(loader.loaded_services(), 0);
    }

    #[test]
    fn test_file_opener_binds_by_name() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("csv_file_open", csv_file_open as FileIoFn as *const c_void),
            ("csv_file_probe", csv_file_probe as FileProbeFn as *const c_void),
        ]);
        let mut loader = instance(opener).unwrap();
        let mut service = opener_service();
        service.load(&mut loader).unwrap();

        let ServiceKind::FileOpener(opener) = service.kind() else { unreachable!() };
        assert!(opener.hooks().is_some_and(|h| h.probe.is_some()));
        opener.open("csv", Path::new("data.csv"), DocumentHandle(17)).unwrap();
        assert_eq!(OPENED.load(Ordering::SeqCst), 17);
    }

    #[test]
    fn test_missing_probe_is_optional() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("csv_file_open", csv_file_open as FileIoFn as *const c_void),
        ]);
        let mut loader = instance(opener).unwrap();
        let mut service = opener_service();

        service.load(&mut loader).unwrap();
        let ServiceKind::FileOpener(opener) = service.kind() else { unreachable!() };
        assert!(opener.hooks().is_some_and(|h| h.probe.is_none()));
    }

    #[test]
    fn test_marker_mismatch_reports_each_field() {
        let opener = module(&[(MODULE_MARKER_SYMBOL, symbol_ptr(&BAD_MARKER))]);
        let err = instance(opener).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ServiceLoadFailed);
        assert_eq!(err.details().len(), 2);
        assert!(err.mentions("Magic number"));
        assert!(err.mentions("ABI version"));
    }

    #[test]
    fn test_missing_marker() {
        let err = instance(module(&[])).unwrap_err();
        assert!(err.mentions(MODULE_MARKER_SYMBOL));
    }

    #[test]
    fn test_module_file_alias() {
        let mut loader = NativeModuleLoader::new();
        let attributes = BTreeMap::from([("module".to_string(), "x.so".to_string())]);
        loader.set_attributes(&attributes).unwrap();
        assert!(loader.info().contains(&("Module file".to_string(), "x.so".to_string())));

        assert!(NativeModuleLoader::new().set_attributes(&BTreeMap::new()).is_err());
    }

    #[test]
    fn test_function_table_resolution() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("CSV_functions", CSV_FUNCTIONS.as_ptr().cast::<c_void>()),
        ]);
        let mut loader = instance(opener).unwrap();
        let mut service = Service::new(
            "funcs",
            ServiceKind::FunctionGroup(FunctionGroupService::new("CSV", vec!["CSVPARSE".to_string()])),
        );
        service.load(&mut loader).unwrap();

        let ServiceKind::FunctionGroup(group) = service.kind() else { unreachable!() };
        let signature = group.resolve("funcs", "csvparse").unwrap();
        assert_eq!(signature.args, "ff");
        assert_eq!(signature.arg_names, vec!["a".to_string(), "b".to_string()]);
        let sum = group.call("funcs", "CSVPARSE", &[1.5, 2.5]).unwrap();
        assert!((sum - 4.0).abs() < f64::EPSILON);
    }

    fn with_context<R>(host: &mut Host, f: impl FnOnce(&mut ServiceContext<'_>) -> R) -> R {
        let mut kinds = LoaderKinds::default();
        let mut ctx = ServiceContext {
            plugin_id: "csv",
            plugin_dir: Path::new("/plugins/csv"),
            host,
            loader_kinds: &mut kinds,
        };
        f(&mut ctx)
    }

    fn general_service() -> Service {
        Service::new("misc", ServiceKind::General(GeneralService::default()))
    }

    #[test]
    fn test_general_hooks_bind_by_name() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("misc_init", misc_init as GeneralHookFn as *const c_void),
            ("misc_cleanup", misc_cleanup as GeneralHookFn as *const c_void),
        ]);
        let mut loader = instance(opener).unwrap();
        let mut service = general_service();
        service.load(&mut loader).unwrap();

        let mut host = Host::in_memory();
        with_context(&mut host, |ctx| service.activate(ctx)).unwrap();
        assert_eq!(MISC_INITS.load(Ordering::SeqCst), 1);
        assert_eq!(MISC_CLEANUPS.load(Ordering::SeqCst), 0);

        // No veto exported: always deactivatable.
        assert!(service.can_deactivate(&host));
        with_context(&mut host, |ctx| service.deactivate(ctx)).unwrap();
        assert_eq!(MISC_CLEANUPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_general_can_deactivate_hook() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("misc_init", noop_hook as GeneralHookFn as *const c_void),
            ("misc_cleanup", noop_hook as GeneralHookFn as *const c_void),
            ("misc_can_deactivate", refuse_deactivation as CanDeactivateFn as *const c_void),
        ]);
        let mut loader = instance(opener).unwrap();
        let mut service = general_service();
        service.load(&mut loader).unwrap();

        let ServiceKind::General(general) = service.kind() else { unreachable!() };
        assert!(general.hooks().is_some_and(|h| h.can_deactivate.is_some()));

        let mut host = Host::in_memory();
        with_context(&mut host, |ctx| service.activate(ctx)).unwrap();
        assert!(!service.can_deactivate(&host));
    }

    #[test]
    fn test_general_requires_cleanup() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("misc_init", noop_hook as GeneralHookFn as *const c_void),
        ]);
        let mut loader = instance(opener).unwrap();
        let mut service = general_service();

        let err = service.load(&mut loader).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceLoadFailed);
        assert!(err.mentions("misc_cleanup"));
    }

    #[test]
    fn test_file_saver_binds_by_name() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("txt_file_save", txt_file_save as FileIoFn as *const c_void),
        ]);
        let mut loader = instance(opener).unwrap();
        let mut service = Service::new("txt", ServiceKind::FileSaver(FileSaverService::new("Text")));
        service.load(&mut loader).unwrap();

        let ServiceKind::FileSaver(saver) = service.kind() else { unreachable!() };
        saver.save("txt", Path::new("out.txt"), DocumentHandle(23)).unwrap();
        assert_eq!(SAVED.load(Ordering::SeqCst), 23);
    }

    #[test]
    fn test_ui_verbs_dispatch() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("menu_ui_verbs", MENU_VERBS.as_ptr().cast::<c_void>()),
        ]);
        let mut loader = instance(opener).unwrap();
        let actions = vec![UiAction::named("Sort"), UiAction::named("Break"), UiAction::named("Delete")];
        let mut service = Service::new("menu", ServiceKind::Ui(UiService::new("menu.toml", actions)));
        service.load(&mut loader).unwrap();

        let ServiceKind::Ui(ui) = service.kind() else { unreachable!() };
        ui.dispatch("menu", "Sort").unwrap();
        assert_eq!(SORTS.load(Ordering::SeqCst), 1);

        let err = ui.dispatch("menu", "Break").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invocation);
        assert!(err.mentions("code 3"));

        // Declared in the descriptor but missing from the module's table.
        let err = ui.dispatch("menu", "Delete").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invocation);
        assert!(err.mentions("Unknown action: Delete"));
    }

    #[test]
    fn test_loader_provider_named_after_service() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("prov_get_loader_type", script_loader as GetLoaderTypeFn as *const c_void),
        ]);
        let mut loader = instance(opener).unwrap();
        let mut service =
            Service::new("prov", ServiceKind::LoaderProvider(LoaderProviderService::new("python")));
        service.load(&mut loader).unwrap();

        let ServiceKind::LoaderProvider(provider) = service.kind() else { unreachable!() };
        let factory = provider.factory().unwrap();
        assert_eq!(factory().kind(), "python");
    }

    #[test]
    fn test_loader_provider_ignores_kind_named_symbol() {
        let opener = module(&[
            (MODULE_MARKER_SYMBOL, symbol_ptr(&MARKER)),
            ("python_get_loader_type", script_loader as GetLoaderTypeFn as *const c_void),
        ]);
        let mut loader = instance(opener).unwrap();
        let mut service =
            Service::new("prov", ServiceKind::LoaderProvider(LoaderProviderService::new("python")));

        let err = service.load(&mut loader).unwrap_err();
        assert!(err.mentions("prov_get_loader_type"));
    }
}
