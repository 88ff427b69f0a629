//! # Plugboard
//!
//! Plugin registry for applications that extend themselves from directories of
//! plugins.
//!
//! Each plugin directory holds a `plugin.toml` descriptor. Plugboard discovers
//! them, restores unchanged ones from a fingerprint cache without parsing,
//! activates plugins in dependency order and binds their services through
//! pluggable loaders, including a loader for native shared libraries.
//!
//! ## Features
//!
//! - **Lazy descriptors**: unchanged plugins are known by id until first use
//! - **Dependency ordering**: activation pulls in dependencies, deactivation is
//!   refused while something still needs the plugin
//! - **Six service kinds**: general, file opener, file saver, function group,
//!   plugin loader and user interface
//! - **Native modules**: entry points resolved by naming convention
//!
//! ## Quick Start
//!
//! ```no_run
//! use plugboard::plugin::{Host, Registry, TomlStateStore};
//! use plugboard::Config;
//!
//! let config = Config::load()?;
//! let state = config.plugins.state_file().unwrap_or_else(|| "state.toml".into());
//! let mut registry = Registry::new(Host::in_memory(), TomlStateStore::new(state));
//! if let Err(e) = registry.startup(&config.plugins) {
//!     eprintln!("{}", e.render());
//! }
//! registry.shutdown()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]

pub mod core;
pub mod plugin;

pub use crate::core::{Config, PluginsConfig};
pub use plugin::{ErrorChain, ErrorKind, PluginDescriptor, PluginResult, Registry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "plugboard";
