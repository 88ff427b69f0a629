//! Fingerprint cache for plugin descriptors.
//!
//! Maps a plugin directory to a cheap snapshot of its `plugin.toml` (device,
//! inode, size, modification time) and the id it yielded last time, so that
//! unchanged plugins are restored as stubs without parsing.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use super::types::DESCRIPTOR_FILE;

/// One cached directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub directory: PathBuf,
    pub fingerprint: String,
    pub plugin_id: String,
}

impl CacheEntry {
    /// Persisted form, `"plugin_id|fingerprint|directory"`. `None` for a
    /// directory that is not valid UTF-8, which could not be matched on reload.
    pub fn to_record(&self) -> Option<String> {
        let directory = self.directory.to_str()?;
        Some(format!("{}|{}|{directory}", self.plugin_id, self.fingerprint))
    }

    pub fn from_record(record: &str) -> Option<Self> {
        let mut parts = record.splitn(3, '|');
        let plugin_id = parts.next().filter(|s| !s.is_empty())?;
        let fingerprint = parts.next().filter(|s| !s.is_empty())?;
        let directory = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            directory: PathBuf::from(directory),
            fingerprint: fingerprint.to_string(),
            plugin_id: plugin_id.to_string(),
        })
    }
}

/// Directory → fingerprint/id table with a dirty flag.
#[derive(Debug, Clone, Default)]
pub struct FingerprintCache {
    entries: BTreeMap<PathBuf, CacheEntry>,
    dirty: bool,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records, skipping malformed ones.
    pub fn from_records<S: AsRef<str>>(records: &[S]) -> Self {
        let mut cache = Self::new();
        for record in records {
            match CacheEntry::from_record(record.as_ref()) {
                Some(entry) => {
                    cache.entries.insert(entry.directory.clone(), entry);
                }
                None => tracing::warn!(record = %record.as_ref(), "Ignoring malformed plugin cache record"),
            }
        }
        cache
    }

    pub fn to_records(&self) -> Vec<String> {
        self.entries
            .values()
            .filter_map(|entry| {
                let record = entry.to_record();
                if record.is_none() {
                    tracing::warn!(
                        dir = %entry.directory.display(),
                        "Not caching plugin directory with a non UTF-8 path"
                    );
                }
                record
            })
            .collect()
    }

    /// Fingerprint of `<directory>/plugin.toml`, or `None` if it cannot be read.
    pub fn current_fingerprint(directory: &Path) -> Option<String> {
        let metadata = std::fs::metadata(directory.join(DESCRIPTOR_FILE)).ok()?;
        if !metadata.is_file() {
            return None;
        }
        Some(fingerprint_of(&metadata))
    }

    pub fn lookup(&self, directory: &Path) -> Option<&CacheEntry> {
        self.entries.get(directory)
    }

    /// Store a record; marks the cache dirty only if something changed.
    pub fn record(&mut self, directory: &Path, fingerprint: &str, plugin_id: &str) {
        let entry = CacheEntry {
            directory: directory.to_path_buf(),
            fingerprint: fingerprint.to_string(),
            plugin_id: plugin_id.to_string(),
        };
        if self.entries.get(directory) != Some(&entry) {
            self.entries.insert(entry.directory.clone(), entry);
            self.dirty = true;
        }
    }

    /// True if the descriptor no longer matches `cached_fingerprint`.
    pub fn is_stale(directory: &Path, cached_fingerprint: &str) -> bool {
        Self::current_fingerprint(directory).as_deref() != Some(cached_fingerprint)
    }

    pub fn forget(&mut self, directory: &Path) {
        if self.entries.remove(directory).is_some() {
            self.dirty = true;
        }
    }

    /// Forget `directory` only while its record still names `plugin_id`.
    pub fn forget_plugin(&mut self, directory: &Path, plugin_id: &str) {
        if self.entries.get(directory).is_some_and(|e| e.plugin_id == plugin_id) {
            self.forget(directory);
        }
    }

    /// Drop entries for directories not in `keep`.
    pub fn retain_directories(&mut self, keep: &HashSet<PathBuf>) {
        let before = self.entries.len();
        self.entries.retain(|dir, _| keep.contains(dir));
        if self.entries.len() != before {
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(unix)]
fn fingerprint_of(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;

    format!(
        "{}:{}:{}:{}.{}",
        metadata.dev(),
        metadata.ino(),
        metadata.size(),
        metadata.mtime(),
        metadata.mtime_nsec()
    )
}

#[cfg(not(unix))]
fn fingerprint_of(metadata: &std::fs::Metadata) -> String {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .unwrap_or_default();
    format!("0:0:{}:{}.{}", metadata.len(), modified.as_secs(), modified.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_unreadable_descriptor_has_no_fingerprint() {
        let temp = TempDir::new().unwrap();
        assert!(FingerprintCache::current_fingerprint(temp.path()).is_none());
        assert!(FingerprintCache::is_stale(temp.path(), "anything"));
    }

    #[test]
    fn test_size_change_makes_entry_stale() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join(DESCRIPTOR_FILE);
        std::fs::write(&file, "[plugin]\nid = \"a\"\n").unwrap();
        let before = FingerprintCache::current_fingerprint(temp.path()).unwrap();
        assert!(!FingerprintCache::is_stale(temp.path(), &before));

        std::fs::write(&file, "[plugin]\nid = \"abc\"\n").unwrap();
        assert!(FingerprintCache::is_stale(temp.path(), &before));
    }

    #[test]
    fn test_record_dirty_only_on_change() {
        let mut cache = FingerprintCache::new();
        cache.record(Path::new("/p/a"), "1:2:3:4.5", "a");
        assert!(cache.is_dirty());

        cache.mark_clean();
        cache.record(Path::new("/p/a"), "1:2:3:4.5", "a");
        assert!(!cache.is_dirty());

        cache.record(Path::new("/p/a"), "1:2:3:4.6", "a");
        assert!(cache.is_dirty());
    }

    #[test]
    fn test_records_skip_malformed() {
        let cache = FingerprintCache::from_records(&["a|1:2:3:4.5|/p/a", "garbage", "b||/p/b"]);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(Path::new("/p/a")).unwrap().plugin_id, "a");
        assert_eq!(cache.to_records(), vec!["a|1:2:3:4.5|/p/a".to_string()]);
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_retain_directories() {
        let mut cache = FingerprintCache::from_records(&["a|f|/p/a", "b|f|/p/b"]);
        let keep = HashSet::from([PathBuf::from("/p/a")]);

        cache.retain_directories(&keep);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_dirty());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_directory_is_not_persisted() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut cache = FingerprintCache::new();
        cache.record(Path::new(OsStr::from_bytes(b"/p/\xff")), "1:2:3:4.5", "bad");
        cache.record(Path::new("/p/a"), "1:2:3:4.5", "a");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.to_records(), vec!["a|1:2:3:4.5|/p/a".to_string()]);
    }
}
