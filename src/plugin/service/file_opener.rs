//! File opener service: recognizes files and reads them into documents.

use std::path::Path;
use std::rc::Rc;

use glob::MatchOptions;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use super::{not_bound, ServiceBehavior, ServiceContext};
use crate::plugin::host::{DocumentHandle, Host, OpenerRegistration};
use crate::plugin::types::{FormatLevel, ServiceType};
use crate::plugin::PluginResult;

/// Default opener priority when the descriptor gives none.
pub const DEFAULT_PRIORITY: u32 = 50;

/// Highest accepted opener priority; larger values are clamped.
pub const MAX_PRIORITY: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    #[default]
    Shell,
    Regexp,
}

/// File name pattern an opener claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePattern {
    pub value: String,
    #[serde(rename = "type", default)]
    pub pattern_type: PatternType,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl FilePattern {
    pub fn shell(value: impl Into<String>) -> Self {
        Self { value: value.into(), pattern_type: PatternType::Shell, case_sensitive: false }
    }

    pub fn regexp(value: impl Into<String>) -> Self {
        Self { value: value.into(), pattern_type: PatternType::Regexp, case_sensitive: false }
    }

    /// Match against the final path component.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        match self.pattern_type {
            PatternType::Shell => match glob::Pattern::new(&self.value) {
                Ok(pattern) => pattern.matches_with(
                    name,
                    MatchOptions {
                        case_sensitive: self.case_sensitive,
                        require_literal_separator: false,
                        require_literal_leading_dot: false,
                    },
                ),
                Err(e) => {
                    tracing::warn!(pattern = %self.value, error = %e, "Invalid shell pattern");
                    false
                }
            },
            PatternType::Regexp => {
                match RegexBuilder::new(&self.value).case_insensitive(!self.case_sensitive).build() {
                    Ok(re) => re.is_match(name),
                    Err(e) => {
                        tracing::warn!(pattern = %self.value, error = %e, "Invalid regexp pattern");
                        false
                    }
                }
            }
        }
    }
}

/// Default save format tied to an opener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveInfo {
    pub saver_id: Option<String>,
    pub format_level: FormatLevel,
}

/// Entry points bound by a loader for a file opener.
#[derive(Clone)]
pub struct OpenerHooks {
    pub probe: Option<Rc<dyn Fn(&Path) -> bool>>,
    pub open: Rc<dyn Fn(&Path, DocumentHandle) -> PluginResult<()>>,
}

impl OpenerHooks {
    pub fn new(open: impl Fn(&Path, DocumentHandle) -> PluginResult<()> + 'static) -> Self {
        Self { probe: None, open: Rc::new(open) }
    }

    pub fn with_probe(mut self, probe: impl Fn(&Path) -> bool + 'static) -> Self {
        self.probe = Some(Rc::new(probe));
        self
    }
}

impl std::fmt::Debug for OpenerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenerHooks").field("probe", &self.probe.is_some()).finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct FileOpenerService {
    pub description: String,
    pub priority: u32,
    pub has_probe: bool,
    pub can_open: bool,
    pub can_import: bool,
    pub patterns: Vec<FilePattern>,
    pub save_info: Option<SaveInfo>,
    hooks: Option<OpenerHooks>,
    registered_as: Option<String>,
}

impl FileOpenerService {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            priority: DEFAULT_PRIORITY,
            has_probe: true,
            can_open: true,
            can_import: false,
            patterns: Vec::new(),
            save_info: None,
            hooks: None,
            registered_as: None,
        }
    }

    pub fn bind(&mut self, hooks: OpenerHooks) {
        self.hooks = Some(hooks);
    }

    pub fn hooks(&self) -> Option<&OpenerHooks> {
        self.hooks.as_ref()
    }

    pub fn matches_patterns(&self, path: &Path) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    /// Whether probing `path` needs the plugin's own probe entry point.
    pub fn wants_probe_hook(&self, path: &Path) -> bool {
        self.has_probe && (self.patterns.is_empty() || self.matches_patterns(path))
    }

    /// Decide whether this opener handles `path`.
    ///
    /// Patterns filter first; a bound probe entry point has the final say.
    /// Without one, the pattern match alone decides.
    pub fn probe(&self, path: &Path) -> bool {
        let matched = self.matches_patterns(path);
        if !self.wants_probe_hook(path) {
            return matched;
        }
        match self.hooks.as_ref().and_then(|h| h.probe.as_ref()) {
            Some(probe) => probe(path),
            None => matched,
        }
    }

    pub fn open(&self, service_id: &str, path: &Path, document: DocumentHandle) -> PluginResult<()> {
        let hooks = self.hooks.as_ref().ok_or_else(|| not_bound(service_id))?;
        (hooks.open)(path, document)
    }
}

impl ServiceBehavior for FileOpenerService {
    fn service_type(&self) -> ServiceType {
        ServiceType::FileOpener
    }

    fn activate(&mut self, service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        let registration = OpenerRegistration {
            service: ctx.service_ref(service_id),
            description: self.description.clone(),
            priority: self.priority,
            can_open: self.can_open,
            can_import: self.can_import,
            has_probe: self.has_probe,
            patterns: self.patterns.clone(),
            save_info: self.save_info.clone(),
        };
        let id = registration.id();
        ctx.host.formats.register_opener(self.priority, registration)?;
        self.registered_as = Some(id);
        Ok(())
    }

    fn deactivate(&mut self, _service_id: &str, ctx: &mut ServiceContext<'_>) -> PluginResult<()> {
        if let Some(id) = self.registered_as.take() {
            ctx.host.formats.unregister_opener(&id);
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
        format!("File opener - {}", self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_pattern_case_insensitive_by_default() {
        let pattern = FilePattern::shell("*.csv");
        assert!(pattern.matches(Path::new("/tmp/DATA.CSV")));
        assert!(!pattern.matches(Path::new("/tmp/data.tsv")));

        let strict = FilePattern { case_sensitive: true, ..FilePattern::shell("*.csv") };
        assert!(!strict.matches(Path::new("DATA.CSV")));
    }

    #[test]
    fn test_regexp_pattern() {
        let pattern = FilePattern::regexp(r"^report-\d+\.txt$");
        assert!(pattern.matches(Path::new("report-42.txt")));
        assert!(!pattern.matches(Path::new("report-x.txt")));
    }

    #[test]
    fn test_probe_without_hook_uses_patterns() {
        let mut opener = FileOpenerService::new("CSV");
        opener.patterns.push(FilePattern::shell("*.csv"));

        assert!(opener.probe(Path::new("a.csv")));
        assert!(!opener.probe(Path::new("a.xls")));
    }

    #[test]
    fn test_probe_hook_has_final_say() {
        let mut opener = FileOpenerService::new("CSV");
        opener.patterns.push(FilePattern::shell("*.csv"));
        opener.bind(OpenerHooks::new(|_, _| Ok(())).with_probe(|p| p.ends_with("good.csv")));

        assert!(opener.probe(Path::new("good.csv")));
        assert!(!opener.probe(Path::new("bad.csv")));
        assert!(!opener.wants_probe_hook(Path::new("good.xls")));
    }

    #[test]
    fn test_open_requires_binding() {
        let opener = FileOpenerService::new("CSV");
        assert!(opener.open("csv_open", Path::new("a.csv"), DocumentHandle(1)).is_err());
        assert_eq!(opener.describe(), "File opener - CSV");
    }
}
