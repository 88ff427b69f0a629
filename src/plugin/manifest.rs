//! Plugin descriptor parsing.
//!
//! Each plugin directory holds a `plugin.toml` describing the plugin's
//! identity, dependencies, loader and services. Structural problems are hard
//! failures and every one of them is reported; missing metadata falls back to
//! placeholders.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::descriptor::{Dependency, LoaderDeclaration, PluginDescriptor};
use super::service::{
    FileOpenerService, FilePattern, FileSaverService, FunctionGroupService, GeneralService,
    LoaderProviderService, SaveInfo, Service, ServiceKind, UiAction, UiService,
};
use super::types::{
    DependencyKind, DependencyKinds, FormatLevel, SaveScope, ServiceType, DESCRIPTOR_FILE,
};
use super::{ErrorChain, ErrorKind, PluginResult};

/// Raw `plugin.toml` contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plugin: Option<PluginSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    information: Option<InformationSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<DependencySection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loader: Option<LoaderSection>,
    #[serde(default)]
    services: Vec<toml::Table>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PluginSection {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InformationSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DependencySection {
    id: String,
    /// Target must be active before the dependant.
    #[serde(default = "default_true")]
    require_activate: bool,
    /// Target's code must be loaded before the dependant's loader runs.
    #[serde(default = "default_true")]
    require_load: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LoaderSection {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// Keys shared by every `[[services]]` entry.
#[derive(Debug, Deserialize)]
struct ServiceHeader {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    service_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenerKeys {
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default = "default_true")]
    probe: bool,
    #[serde(default = "default_true")]
    open: bool,
    #[serde(default)]
    import: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    file_patterns: Vec<FilePattern>,
    #[serde(default)]
    save_info: Option<SaveInfoKeys>,
}

#[derive(Debug, Deserialize)]
struct SaveInfoKeys {
    #[serde(default)]
    saver_id: Option<String>,
    #[serde(default)]
    format_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SaverKeys {
    #[serde(default)]
    extension: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    format_level: Option<String>,
    #[serde(default)]
    default_saver_priority: Option<i32>,
    #[serde(default)]
    save_scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FunctionGroupKeys {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    translated_category: Option<String>,
    #[serde(default)]
    functions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LoaderProviderKeys {
    #[serde(default)]
    loader_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UiKeys {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    actions: Vec<UiAction>,
}

/// Parse `<directory>/plugin.toml`.
pub fn parse(directory: &Path) -> PluginResult<PluginDescriptor> {
    let path = directory.join(DESCRIPTOR_FILE);
    let text = std::fs::read_to_string(&path).map_err(|e| {
        ErrorChain::with_detail(
            ErrorKind::Discovery,
            format!("Cannot read plugin descriptor {}", path.display()),
            ErrorChain::io(&path, &e),
        )
    })?;
    parse_str(directory, &text)
}

/// Parse descriptor text for a plugin living in `directory`.
pub fn parse_str(directory: &Path, text: &str) -> PluginResult<PluginDescriptor> {
    let context = || format!("Errors while reading plugin descriptor in {}", directory.display());
    let manifest: Manifest = toml::from_str(text)
        .map_err(|e| ErrorChain::with_detail(ErrorKind::Discovery, context(), e.into()))?;

    let mut problems = Vec::new();

    let id = manifest.plugin.as_ref().and_then(|p| p.id.clone()).filter(|id| !id.is_empty());
    if id.is_none() {
        problems.push(discovery("Plugin has no id"));
    }

    let loader = match manifest.loader {
        Some(LoaderSection { kind: Some(kind), attributes }) if !kind.is_empty() => {
            Some(LoaderDeclaration { kind, attributes })
        }
        Some(_) => {
            problems.push(discovery("Loader has no kind"));
            None
        }
        None => {
            problems.push(discovery("Plugin has no loader"));
            None
        }
    };

    let mut dependencies = Vec::with_capacity(manifest.dependencies.len());
    for dep in manifest.dependencies {
        if dep.id.is_empty() {
            problems.push(discovery("Dependency has an empty plugin id"));
            continue;
        }
        dependencies.push(Dependency::new(
            dep.id,
            DependencyKinds::from_flags(dep.require_activate, dep.require_load),
        ));
    }

    let mut services: Vec<Service> = Vec::with_capacity(manifest.services.len());
    if manifest.services.is_empty() {
        problems.push(discovery("Plugin provides no services"));
    }
    for (index, table) in manifest.services.into_iter().enumerate() {
        match parse_service(index, table) {
            Ok(service) if services.iter().any(|s| s.id() == service.id()) => {
                problems.push(discovery(format!("Duplicate service id '{}'", service.id())));
            }
            Ok(service) => services.push(service),
            Err(e) => problems.push(e),
        }
    }

    ErrorChain::check(ErrorKind::Discovery, context(), problems)?;
    let (Some(id), Some(loader)) = (id, loader) else {
        return Err(discovery(context()));
    };

    let information = manifest.information.unwrap_or_default();
    Ok(PluginDescriptor::new(id, directory, loader, services)
        .with_information(information.name, information.description)
        .with_dependencies(dependencies))
}

fn discovery(message: impl Into<String>) -> ErrorChain {
    ErrorChain::new(ErrorKind::Discovery, message)
}

fn keys<T: for<'de> Deserialize<'de>>(table: &toml::Table, service_id: &str) -> PluginResult<T> {
    toml::Value::Table(table.clone()).try_into().map_err(|e: toml::de::Error| {
        ErrorChain::with_detail(
            ErrorKind::Discovery,
            format!("Invalid keys for service '{service_id}'"),
            e.into(),
        )
    })
}

fn parse_service(index: usize, table: toml::Table) -> PluginResult<Service> {
    let header: ServiceHeader = keys(&table, &format!("#{}", index + 1))?;
    let id = header
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| discovery(format!("Service #{} has no id", index + 1)))?;
    let type_name = header
        .service_type
        .ok_or_else(|| discovery(format!("Service '{id}' has no type")))?;
    let service_type = ServiceType::parse(&type_name)
        .ok_or_else(|| discovery(format!("Service '{id}' has unknown type '{type_name}'")))?;

    let kind = match service_type {
        ServiceType::General => ServiceKind::General(GeneralService::default()),
        ServiceType::FileOpener => ServiceKind::FileOpener(parse_opener(&id, &table)?),
        ServiceType::FileSaver => ServiceKind::FileSaver(parse_saver(&id, &table)?),
        ServiceType::FunctionGroup => ServiceKind::FunctionGroup(parse_function_group(&id, &table)?),
        ServiceType::PluginLoader => {
            let keys: LoaderProviderKeys = keys(&table, &id)?;
            let loader_id = keys.loader_id.filter(|l| !l.is_empty()).unwrap_or_else(|| id.clone());
            ServiceKind::LoaderProvider(LoaderProviderService::new(loader_id))
        }
        ServiceType::Ui => {
            let keys: UiKeys = keys(&table, &id)?;
            let file = keys
                .file
                .filter(|f| !f.is_empty())
                .ok_or_else(|| discovery(format!("UI service '{id}' is missing its layout file")))?;
            ServiceKind::Ui(UiService::new(file, keys.actions))
        }
    };
    Ok(Service::new(id, kind))
}

fn parse_opener(id: &str, table: &toml::Table) -> PluginResult<FileOpenerService> {
    let keys: OpenerKeys = keys(table, id)?;
    let description = keys
        .description
        .ok_or_else(|| discovery(format!("File opener '{id}' has no description")))?;

    let mut opener = FileOpenerService::new(description);
    if let Some(priority) = keys.priority {
        opener.priority = u32::try_from(priority.clamp(0, 100)).unwrap_or_default();
    }
    opener.has_probe = keys.probe;
    opener.can_open = keys.open;
    opener.can_import = keys.import;
    opener.patterns = keys.file_patterns;
    opener.save_info = keys.save_info.map(|info| SaveInfo {
        saver_id: info.saver_id,
        format_level: FormatLevel::parse_or(info.format_level.as_deref(), FormatLevel::Manual),
    });
    Ok(opener)
}

fn parse_saver(id: &str, table: &toml::Table) -> PluginResult<FileSaverService> {
    let keys: SaverKeys = keys(table, id)?;
    let description = keys
        .description
        .ok_or_else(|| discovery(format!("File saver '{id}' has no description")))?;

    let mut saver = FileSaverService::new(description);
    saver.extension = keys.extension;
    saver.format_level = FormatLevel::parse_or(keys.format_level.as_deref(), FormatLevel::WriteOnly);
    saver.save_scope = SaveScope::parse(keys.save_scope.as_deref());
    saver.default_priority = keys.default_saver_priority;
    Ok(saver)
}

fn parse_function_group(id: &str, table: &toml::Table) -> PluginResult<FunctionGroupService> {
    let keys: FunctionGroupKeys = keys(table, id)?;
    let category = keys
        .category
        .filter(|c| !c.is_empty())
        .ok_or_else(|| discovery(format!("Function group '{id}' has no category")))?;
    if keys.functions.is_empty() {
        return Err(discovery(format!("Function group '{id}' declares no functions")));
    }

    let mut group = FunctionGroupService::new(category, keys.functions);
    group.translated_category = keys.translated_category;
    Ok(group)
}

fn service_table(service: &Service) -> PluginResult<toml::Table> {
    let mut table = toml::Table::new();
    table.insert("id".into(), service.id().into());
    table.insert("type".into(), service.service_type().display_name().into());

    match service.kind() {
        ServiceKind::General(_) => {}
        ServiceKind::FileOpener(opener) => {
            table.insert("priority".into(), i64::from(opener.priority).into());
            table.insert("probe".into(), opener.has_probe.into());
            table.insert("open".into(), opener.can_open.into());
            table.insert("import".into(), opener.can_import.into());
            table.insert("description".into(), opener.description.clone().into());
            if !opener.patterns.is_empty() {
                table.insert("file_patterns".into(), toml::Value::try_from(&opener.patterns)?);
            }
            if let Some(info) = &opener.save_info {
                let mut save_info = toml::Table::new();
                if let Some(saver_id) = &info.saver_id {
                    save_info.insert("saver_id".into(), saver_id.clone().into());
                }
                save_info.insert("format_level".into(), info.format_level.as_str().into());
                table.insert("save_info".into(), save_info.into());
            }
        }
        ServiceKind::FileSaver(saver) => {
            if let Some(extension) = &saver.extension {
                table.insert("extension".into(), extension.clone().into());
            }
            table.insert("description".into(), saver.description.clone().into());
            table.insert("format_level".into(), saver.format_level.as_str().into());
            table.insert("save_scope".into(), saver.save_scope.as_str().into());
            if let Some(priority) = saver.default_priority {
                table.insert("default_saver_priority".into(), i64::from(priority).into());
            }
        }
        ServiceKind::FunctionGroup(group) => {
            table.insert("category".into(), group.category.clone().into());
            if let Some(translated) = &group.translated_category {
                table.insert("translated_category".into(), translated.clone().into());
            }
            table.insert("functions".into(), toml::Value::try_from(&group.functions)?);
        }
        ServiceKind::LoaderProvider(provider) => {
            table.insert("loader_id".into(), provider.loader_id.clone().into());
        }
        ServiceKind::Ui(ui) => {
            table.insert("file".into(), ui.file.clone().into());
            if !ui.actions.is_empty() {
                table.insert("actions".into(), toml::Value::try_from(&ui.actions)?);
            }
        }
    }
    Ok(table)
}

impl PluginDescriptor {
    /// Serialize back to `plugin.toml` form.
    ///
    /// Stubs have nothing but an id to write; promote them first.
    pub fn to_toml(&self) -> PluginResult<String> {
        let (name, description) = self.raw_information();
        let information = (name.is_some() || description.is_some()).then(|| InformationSection {
            name: name.map(str::to_string),
            description: description.map(str::to_string),
        });
        let manifest = Manifest {
            plugin: Some(PluginSection { id: Some(self.id().to_string()) }),
            information,
            dependencies: self
                .dependencies()
                .iter()
                .map(|d| DependencySection {
                    id: d.target_id.clone(),
                    require_activate: d.requires(DependencyKind::RequiredForActivate),
                    require_load: d.requires(DependencyKind::RequiredForLoad),
                })
                .collect(),
            loader: self.loader().map(|l| LoaderSection {
                kind: Some(l.kind.clone()),
                attributes: l.attributes.clone(),
            }),
            services: self.services().iter().map(service_table).collect::<PluginResult<_>>()?,
        };
        Ok(toml::to_string_pretty(&manifest)?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::plugin::service::PatternType;

    const CSV_DESCRIPTOR: &str = r#"
[plugin]
id = "csv"

[information]
name = "CSV"
description = "Comma separated values"

[loader]
kind = "native"

[loader.attributes]
module_file = "libcsv.so"

[[services]]
id = "csv"
type = "file_opener"
priority = 250
description = "Comma separated values (CSV)"
file_patterns = [
    { value = "*.csv" },
    { value = "^data-.*\\.txt$", type = "regexp", case_sensitive = true },
]
save_info = { saver_id = "csv:csv_save" }

[[services]]
id = "csv_save"
type = "file_saver"
extension = "csv"
description = "CSV"
format_level = "auto"
"#;

    fn dir() -> PathBuf {
        PathBuf::from("/plugins/csv")
    }

    #[test]
    fn test_parse_full_descriptor() {
        let descriptor = parse_str(&dir(), CSV_DESCRIPTOR).unwrap();

        assert_eq!(descriptor.id(), "csv");
        assert_eq!(descriptor.name(), "CSV");
        assert!(descriptor.has_full_metadata());
        assert_eq!(descriptor.loader().unwrap().attributes["module_file"], "libcsv.so");
        assert_eq!(descriptor.services().len(), 2);

        let ServiceKind::FileOpener(opener) = descriptor.services()[0].kind() else {
            panic!("expected file opener");
        };
        assert_eq!(opener.priority, 100);
        assert!(opener.has_probe);
        assert!(opener.can_open);
        assert!(!opener.can_import);
        assert_eq!(opener.patterns[1].pattern_type, PatternType::Regexp);
        assert!(opener.patterns[1].case_sensitive);
        assert_eq!(opener.save_info.as_ref().unwrap().format_level, FormatLevel::Manual);

        let ServiceKind::FileSaver(saver) = descriptor.services()[1].kind() else {
            panic!("expected file saver");
        };
        assert_eq!(saver.format_level, FormatLevel::Auto);
        assert_eq!(saver.save_scope, SaveScope::Workbook);
    }

    #[test]
    fn test_missing_information_uses_placeholders() {
        let text = r#"
[plugin]
id = "bare"
[loader]
kind = "native"
[[services]]
id = "misc"
type = "general"
"#;
        let descriptor = parse_str(&dir(), text).unwrap();
        assert_eq!(descriptor.name(), "Unknown name");
        assert_eq!(descriptor.description(), "No description.");
    }

    #[test]
    fn test_dependency_kinds_default_to_both() {
        let text = r#"
[plugin]
id = "csv-ext"
[[dependencies]]
id = "csv"
[[dependencies]]
id = "core"
require_load = false
[loader]
kind = "native"
[[services]]
id = "funcs"
type = "function_group"
category = "CSV"
functions = ["CSVPARSE"]
"#;
        let descriptor = parse_str(&dir(), text).unwrap();
        let deps = descriptor.dependencies();

        assert_eq!(deps[0].kinds, DependencyKinds::both());
        assert!(deps[1].requires(DependencyKind::RequiredForActivate));
        assert!(!deps[1].requires(DependencyKind::RequiredForLoad));
    }

    #[test]
    fn test_structural_failures_are_all_reported() {
        let text = r#"
[information]
name = "Broken"
"#;
        let err = parse_str(&dir(), text).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Discovery);
        assert!(err.mentions("no id"));
        assert!(err.mentions("no loader"));
        assert!(err.mentions("no services"));
    }

    #[test]
    fn test_service_validation() {
        let text = r#"
[plugin]
id = "bad"
[loader]
kind = "native"
[[services]]
id = "open"
type = "file_opener"
[[services]]
id = "x"
type = "teleporter"
[[services]]
id = "funcs"
type = "function_group"
category = "MATH"
[[services]]
id = "x"
type = "general"
[[services]]
id = "x"
type = "general"
"#;
        let err = parse_str(&dir(), text).unwrap_err();

        assert!(err.mentions("File opener 'open' has no description"));
        assert!(err.mentions("unknown type 'teleporter'"));
        assert!(err.mentions("declares no functions"));
        assert!(err.mentions("Duplicate service id 'x'"));
    }

    #[test]
    fn test_empty_loader_kind() {
        let text = r#"
[plugin]
id = "x"
[loader]
kind = ""
[[services]]
id = "misc"
type = "general"
"#;
        let err = parse_str(&dir(), text).unwrap_err();
        assert!(err.mentions("Loader has no kind"));
    }

    #[test]
    fn test_round_trip() {
        let text = r#"
[plugin]
id = "x"
[loader]
kind = "native"
[loader.attributes]
module = "x.so"
[[services]]
id = "s"
type = "file_opener"
description = "X files"
probe = false
file_patterns = [{ value = "*.x" }]
"#;
        let original = parse_str(&dir(), text).unwrap();
        let reparsed = parse_str(&dir(), &original.to_toml().unwrap()).unwrap();

        assert_eq!(reparsed.id(), "x");
        assert!(reparsed.dependencies().is_empty());
        assert_eq!(reparsed.loader(), original.loader());
        assert_eq!(reparsed.services().len(), 1);
        assert_eq!(reparsed.services()[0].id(), "s");
        assert_eq!(reparsed.services()[0].service_type(), ServiceType::FileOpener);
        assert_eq!(reparsed.services()[0].describe(), "File opener - X files");
    }

    #[test]
    fn test_parse_reads_descriptor_file() {
        let temp = TempDir::new().unwrap();
        assert_eq!(parse(temp.path()).unwrap_err().kind(), ErrorKind::Discovery);

        std::fs::write(temp.path().join(DESCRIPTOR_FILE), CSV_DESCRIPTOR).unwrap();
        assert_eq!(parse(temp.path()).unwrap().id(), "csv");
    }
}
