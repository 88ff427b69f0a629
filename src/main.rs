//! Plugboard - inspect plugin directories.
//!
//! Lists discovered plugins, shows what a plugin provides and validates
//! descriptors. The inspector never activates plugins and never writes the
//! persisted state.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plugboard::plugin::{
    parse_descriptor, DependencyKind, Host, MemoryStateStore, PersistedState, Registry,
    StateStore, TomlStateStore, DESCRIPTOR_FILE,
};
use plugboard::{Config, PluginDescriptor};

/// Inspect plugin directories
#[derive(Parser)]
#[command(name = "plugboard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this configuration file instead of the default lookup
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Additional plugin search directory (repeatable)
    #[arg(short = 'd', long = "dir", global = true)]
    dirs: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered plugins
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show a plugin's descriptor
    Info {
        /// Plugin id
        id: String,
    },

    /// Validate the descriptor in a plugin directory
    Check {
        /// Plugin directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Show search directories and the state file
    Paths,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") };

    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::List { format } => cmd_list(&config, &cli.dirs, &format),
        Commands::Info { id } => cmd_info(&config, &cli.dirs, &id),
        Commands::Check { path } => cmd_check(&path),
        Commands::Paths => cmd_paths(&config, &cli.dirs),
    }
}

/// Persisted state, read without ever being written back.
fn read_state(config: &Config) -> PersistedState {
    let Some(path) = config.plugins.state_file() else {
        return PersistedState::default();
    };
    TomlStateStore::new(path).load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Ignoring unreadable plugin state");
        PersistedState::default()
    })
}

fn search_dirs(config: &Config, state: &PersistedState, extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = config.plugins.search_dirs.clone();
    dirs.extend(state.extra_plugin_search_dirs.iter().cloned());
    dirs.extend(plugboard::PluginsConfig::env_search_dirs());
    dirs.extend(extra.iter().cloned());
    let mut seen = std::collections::HashSet::new();
    dirs.retain(|d| seen.insert(d.clone()));
    dirs
}

/// Registry over the configured roots with every descriptor fully read.
fn discover(config: &Config, extra: &[PathBuf]) -> (Registry, PersistedState) {
    let state = read_state(config);
    let mut registry = Registry::new(Host::in_memory(), MemoryStateStore::new(state.clone()));
    let report = registry.discover_all(&search_dirs(config, &state, extra));
    if let Some(error) = report.error {
        eprint!("{}", error.render());
    }
    for id in registry.plugin_ids() {
        if let Err(e) = registry.descriptor(&id) {
            eprint!("{}", e.render());
        }
    }
    (registry, state)
}

/// List discovered plugins.
fn cmd_list(config: &Config, extra: &[PathBuf], format: &str) -> Result<()> {
    let (registry, state) = discover(config, extra);
    let plugins: Vec<&PluginDescriptor> = registry.plugins().collect();

    match format {
        "json" => {
            let entries: Vec<_> = plugins
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "id": p.id(),
                        "name": p.name(),
                        "description": p.description(),
                        "directory": p.directory(),
                        "active_last_session": state.active_plugin_ids.iter().any(|id| id == p.id()),
                        "services": p.services().iter().map(|s| s.id()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            for plugin in &plugins {
                let marker =
                    if state.active_plugin_ids.iter().any(|id| id == plugin.id()) { "*" } else { " " };
                println!("{marker} {} - {}", plugin.id(), plugin.name());
            }
            println!("\nTotal: {} plugins", plugins.len());
        }
    }

    Ok(())
}

/// Show one plugin.
fn cmd_info(config: &Config, extra: &[PathBuf], id: &str) -> Result<()> {
    let (mut registry, _) = discover(config, extra);
    let plugin = registry.descriptor(id).map_err(|e| anyhow::anyhow!(e.render()))?;

    println!("{} ({})", plugin.name(), plugin.id());
    println!("  {}", plugin.description());
    println!("  Directory: {}", plugin.directory().display());
    if let Some(loader) = plugin.loader() {
        println!("  Loader: {}", loader.kind);
        for (key, value) in &loader.attributes {
            println!("    {key} = {value}");
        }
    }
    for kind in DependencyKind::ALL {
        let deps: Vec<&str> = plugin.dependency_ids(kind).collect();
        if !deps.is_empty() {
            println!("  Required for {kind}: {}", deps.join(", "));
        }
    }
    println!("  Services:");
    for service in plugin.services() {
        println!("    {} [{}] {}", service.id(), service.service_type(), service.describe());
    }

    Ok(())
}

/// Validate a descriptor.
fn cmd_check(path: &Path) -> Result<()> {
    if !path.join(DESCRIPTOR_FILE).is_file() {
        anyhow::bail!("No {DESCRIPTOR_FILE} in {}", path.display());
    }
    match parse_descriptor(path) {
        Ok(plugin) => {
            println!("{}: ok ({} services)", plugin.id(), plugin.services().len());
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(e.render())),
    }
}

fn cmd_paths(config: &Config, extra: &[PathBuf]) -> Result<()> {
    let state = read_state(config);
    println!("Search directories:");
    for dir in search_dirs(config, &state, extra) {
        let note = if dir.is_dir() { "" } else { " (missing)" };
        println!("  {}{note}", dir.display());
    }
    match config.plugins.state_file() {
        Some(path) => println!("State file: {}", path.display()),
        None => println!("State file: (none)"),
    }
    Ok(())
}
