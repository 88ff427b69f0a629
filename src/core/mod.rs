//! Application-level configuration.

mod config;

pub use config::{parse_path_list, Config, PluginsConfig};
