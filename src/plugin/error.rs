//! Plugin system error types.
//!
//! Every fallible plugin operation reports an [`ErrorChain`]: a message tagged
//! with an [`ErrorKind`], plus any number of nested causes. Batch operations
//! (discovery, startup activation, shutdown) collect one chain per failing
//! plugin and hand them back as a single aggregate.

use std::fmt::Write as _;
use std::path::Path;

use thiserror::Error;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, ErrorChain>;

/// Category of a plugin error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unreadable plugin directory or malformed descriptor.
    Discovery,
    /// A cached plugin id disagrees with the id found by re-parsing.
    CacheCorruption,
    /// A dependency names a plugin the registry does not know.
    DependencyMissing,
    /// A dependency failed to activate.
    DependencyActivationFailed,
    /// Activation walked back into a plugin that is still being activated.
    DependencyCycle,
    /// A service could not be bound to code (missing symbol, unknown loader kind).
    ServiceLoadFailed,
    /// An external registry rejected a service.
    ServiceActivationFailed,
    /// Deactivation refused because of dependants or services in use.
    DeactivationBlocked,
    /// No plugin with the requested id.
    UnknownPlugin,
    /// Invalid configuration or persisted state.
    Config,
    /// Filesystem error.
    Io,
    /// A loaded entry point reported failure when called.
    Invocation,
}

impl ErrorKind {
    /// Short label used when rendering error trees.
    pub fn label(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::CacheCorruption => "cache corruption",
            Self::DependencyMissing => "missing dependency",
            Self::DependencyActivationFailed => "dependency activation",
            Self::DependencyCycle => "dependency cycle",
            Self::ServiceLoadFailed => "service load",
            Self::ServiceActivationFailed => "service activation",
            Self::DeactivationBlocked => "deactivation blocked",
            Self::UnknownPlugin => "unknown plugin",
            Self::Config => "config",
            Self::Io => "io",
            Self::Invocation => "invocation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A plugin error together with the errors that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ErrorChain {
    kind: ErrorKind,
    message: String,
    details: Vec<ErrorChain>,
}

impl ErrorChain {
    /// Create a leaf error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), details: Vec::new() }
    }

    /// Create an error wrapping a single cause.
    pub fn with_detail(kind: ErrorKind, message: impl Into<String>, detail: ErrorChain) -> Self {
        Self { kind, message: message.into(), details: vec![detail] }
    }

    /// Aggregate a list of errors under one message.
    ///
    /// Returns `None` when `errors` is empty, so callers can write
    /// `if let Some(err) = ErrorChain::from_list(..)`.
    pub fn from_list(
        kind: ErrorKind,
        message: impl Into<String>,
        errors: Vec<ErrorChain>,
    ) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self { kind, message: message.into(), details: errors })
        }
    }

    /// Turn a list of errors into a result.
    pub fn check(kind: ErrorKind, message: impl Into<String>, errors: Vec<ErrorChain>) -> PluginResult<()> {
        match Self::from_list(kind, message, errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Attach another cause.
    pub fn push_detail(&mut self, detail: ErrorChain) {
        self.details.push(detail);
    }

    /// Builder form of [`push_detail`](Self::push_detail).
    pub fn and_detail(mut self, detail: ErrorChain) -> Self {
        self.details.push(detail);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[ErrorChain] {
        &self.details
    }

    /// True if this error or any nested cause has the given kind.
    pub fn contains_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind || self.details.iter().any(|d| d.contains_kind(kind))
    }

    /// True if this error or any nested cause mentions `needle` in its message.
    pub fn mentions(&self, needle: &str) -> bool {
        self.message.contains(needle) || self.details.iter().any(|d| d.mentions(needle))
    }

    /// Render the whole tree, one message per line, indented by depth.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let _ = writeln!(out, "{:indent$}{} [{}]", "", self.message, self.kind, indent = depth * 2);
        for detail in &self.details {
            detail.render_into(out, depth + 1);
        }
    }

    pub(crate) fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::new(ErrorKind::Io, format!("{}: {err}", path.display()))
    }
}

impl From<std::io::Error> for ErrorChain {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<toml::de::Error> for ErrorChain {
    fn from(err: toml::de::Error) -> Self {
        Self::new(ErrorKind::Discovery, err.to_string())
    }
}

impl From<toml::ser::Error> for ErrorChain {
    fn from(err: toml::ser::Error) -> Self {
        Self::new(ErrorKind::Config, err.to_string())
    }
}
