//! Core plugin types.

use serde::{Deserialize, Serialize};

/// Plugin descriptor file name, one per plugin directory.
pub const DESCRIPTOR_FILE: &str = "plugin.toml";

/// Loader kind handled by [`NativeModuleLoader`](super::NativeModuleLoader).
pub const NATIVE_LOADER_KIND: &str = "native";

/// Environment variable holding extra plugin search directories.
pub const PLUGIN_PATH_ENV: &str = "PLUGBOARD_PLUGIN_PATH";

/// Placeholder shown when a descriptor has no name.
pub const UNKNOWN_NAME: &str = "Unknown name";

/// Placeholder shown when a descriptor has no description.
pub const NO_DESCRIPTION: &str = "No description.";

/// Why a plugin depends on another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyKind {
    /// The dependency must be active before the dependant is activated.
    RequiredForActivate,
    /// The dependency's code must be loaded before the dependant's loader runs.
    RequiredForLoad,
}

impl DependencyKind {
    pub const ALL: [Self; 2] = [Self::RequiredForActivate, Self::RequiredForLoad];

    const fn bit(self) -> u8 {
        match self {
            Self::RequiredForActivate => 0b01,
            Self::RequiredForLoad => 0b10,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::RequiredForActivate => "activate",
            Self::RequiredForLoad => "load",
        }
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Set of [`DependencyKind`]s a dependency belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DependencyKinds(u8);

impl DependencyKinds {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn both() -> Self {
        Self(0b11)
    }

    pub fn from_flags(require_activate: bool, require_load: bool) -> Self {
        let mut kinds = Self::empty();
        if require_activate {
            kinds.insert(DependencyKind::RequiredForActivate);
        }
        if require_load {
            kinds.insert(DependencyKind::RequiredForLoad);
        }
        kinds
    }

    pub fn contains(self, kind: DependencyKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: DependencyKind) {
        self.0 |= kind.bit();
    }

    pub fn remove(&mut self, kind: DependencyKind) {
        self.0 &= !kind.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = DependencyKind> {
        DependencyKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

/// Kind of a service, as written in the descriptor's `type` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    General,
    FileOpener,
    FileSaver,
    FunctionGroup,
    PluginLoader,
    Ui,
}

impl ServiceType {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::FileOpener => "file_opener",
            Self::FileSaver => "file_saver",
            Self::FunctionGroup => "function_group",
            Self::PluginLoader => "plugin_loader",
            Self::Ui => "ui",
        }
    }

    /// Parse a descriptor `type` value (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "general" => Some(Self::General),
            "file_opener" => Some(Self::FileOpener),
            "file_saver" => Some(Self::FileSaver),
            "function_group" => Some(Self::FunctionGroup),
            "plugin_loader" | "loader_provider" => Some(Self::PluginLoader),
            "ui" => Some(Self::Ui),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// How faithfully a file format preserves a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatLevel {
    None,
    WriteOnly,
    New,
    Manual,
    ManualRemember,
    Auto,
}

impl FormatLevel {
    /// Parse a descriptor value, falling back to `default` for unknown input.
    pub fn parse_or(value: Option<&str>, default: Self) -> Self {
        let Some(value) = value else { return default };
        match value.to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "write_only" => Self::WriteOnly,
            "new" => Self::New,
            "manual" => Self::Manual,
            "manual_remember" => Self::ManualRemember,
            "auto" => Self::Auto,
            _ => default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::WriteOnly => "write_only",
            Self::New => "new",
            Self::Manual => "manual",
            Self::ManualRemember => "manual_remember",
            Self::Auto => "auto",
        }
    }
}

/// What part of a document a saver writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveScope {
    #[default]
    Workbook,
    Sheet,
}

impl SaveScope {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("sheet") => Self::Sheet,
            _ => Self::Workbook,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workbook => "workbook",
            Self::Sheet => "sheet",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_kinds_set() {
        let mut kinds = DependencyKinds::both();
        assert!(kinds.contains(DependencyKind::RequiredForActivate));
        assert!(kinds.contains(DependencyKind::RequiredForLoad));

        kinds.remove(DependencyKind::RequiredForLoad);
        assert!(kinds.contains(DependencyKind::RequiredForActivate));
        assert!(!kinds.contains(DependencyKind::RequiredForLoad));
        assert_eq!(kinds.iter().collect::<Vec<_>>(), vec![DependencyKind::RequiredForActivate]);
    }

    #[test]
    fn test_dependency_kinds_from_flags() {
        assert_eq!(DependencyKinds::from_flags(true, true), DependencyKinds::both());
        assert!(DependencyKinds::from_flags(false, false).is_empty());

        let load_only = DependencyKinds::from_flags(false, true);
        assert!(!load_only.contains(DependencyKind::RequiredForActivate));
        assert!(load_only.contains(DependencyKind::RequiredForLoad));
    }

    #[test]
    fn test_service_type_parse() {
        assert_eq!(ServiceType::parse("File_Opener"), Some(ServiceType::FileOpener));
        assert_eq!(ServiceType::parse("plugin_loader"), Some(ServiceType::PluginLoader));
        assert_eq!(ServiceType::parse("ui"), Some(ServiceType::Ui));
        assert_eq!(ServiceType::parse("telepathy"), None);
    }

    #[test]
    fn test_format_level_fallback() {
        assert_eq!(FormatLevel::parse_or(Some("AUTO"), FormatLevel::Manual), FormatLevel::Auto);
        assert_eq!(FormatLevel::parse_or(Some("bogus"), FormatLevel::Manual), FormatLevel::Manual);
        assert_eq!(FormatLevel::parse_or(None, FormatLevel::WriteOnly), FormatLevel::WriteOnly);
    }
}
