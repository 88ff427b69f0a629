//! Registry state persisted across sessions.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{ErrorChain, ErrorKind, PluginResult};

/// Everything the registry remembers between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Every plugin id ever seen.
    pub known_plugin_ids: Vec<String>,

    /// Plugins to activate at startup.
    pub active_plugin_ids: Vec<String>,

    /// Fingerprint cache records, `"plugin_id|fingerprint|directory"`.
    pub plugin_file_states: Vec<String>,

    /// Discovery roots added by the user.
    pub extra_plugin_search_dirs: Vec<PathBuf>,
}

/// Where [`PersistedState`] is kept.
pub trait StateStore {
    fn load(&self) -> PluginResult<PersistedState>;
    fn save(&mut self, state: &PersistedState) -> PluginResult<()>;
}

/// State kept in a TOML file.
#[derive(Debug, Clone)]
pub struct TomlStateStore {
    path: PathBuf,
}

impl TomlStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for TomlStateStore {
    /// A missing file is an empty state.
    fn load(&self) -> PluginResult<PersistedState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PersistedState::default()),
            Err(e) => return Err(ErrorChain::io(&self.path, &e)),
        };
        toml::from_str(&content).map_err(|e| {
            ErrorChain::new(
                ErrorKind::Config,
                format!("Invalid plugin state file {}: {e}", self.path.display()),
            )
        })
    }

    fn save(&mut self, state: &PersistedState) -> PluginResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ErrorChain::io(parent, &e))?;
        }
        let content = toml::to_string_pretty(state)?;
        std::fs::write(&self.path, content).map_err(|e| ErrorChain::io(&self.path, &e))?;
        tracing::debug!(path = %self.path.display(), "Saved plugin state");
        Ok(())
    }
}

/// In-memory store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    state: Rc<RefCell<PersistedState>>,
    saves: Rc<RefCell<usize>>,
}

impl MemoryStateStore {
    pub fn new(state: PersistedState) -> Self {
        Self { state: Rc::new(RefCell::new(state)), saves: Rc::default() }
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state.borrow().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.borrow()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> PluginResult<PersistedState> {
        Ok(self.snapshot())
    }

    fn save(&mut self, state: &PersistedState) -> PluginResult<()> {
        *self.state.borrow_mut() = state.clone();
        *self.saves.borrow_mut() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_toml_store_round_trip() {
        let temp = TempDir::new().unwrap();
        let mut store = TomlStateStore::new(temp.path().join("nested").join("state.toml"));
        assert_eq!(store.load().unwrap(), PersistedState::default());

        let state = PersistedState {
            known_plugin_ids: vec!["csv".to_string(), "csv-ext".to_string()],
            active_plugin_ids: vec!["csv".to_string()],
            plugin_file_states: vec!["csv|1:2:3:4.5|/plugins/csv".to_string()],
            extra_plugin_search_dirs: vec![PathBuf::from("/opt/plugins")],
        };
        store.save(&state).unwrap();

        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn test_invalid_state_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.toml");
        std::fs::write(&path, "known_plugin_ids = 5").unwrap();

        let err = TomlStateStore::new(path).load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_memory_store_shares_state() {
        let store = MemoryStateStore::default();
        let mut writer = store.clone();
        writer
            .save(&PersistedState { known_plugin_ids: vec!["a".to_string()], ..Default::default() })
            .unwrap();

        assert_eq!(store.snapshot().known_plugin_ids, vec!["a".to_string()]);
        assert_eq!(store.save_count(), 1);
    }
}
