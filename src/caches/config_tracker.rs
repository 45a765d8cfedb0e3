//! Records every config key read during makefile generation, together with the value list
//! observed at that time, so a reload can detect a config change that should invalidate the
//! makefile even though no source file moved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::archive::{read_versioned, write_versioned, ArchiveError};
use crate::error::BuildError;
use tracing::warn;

const FORMAT_VERSION: i32 = 1;

/// Which config hierarchy a key was read from — engine-wide defaults vs. a project override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum HierarchyType {
    Engine,
    Project,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ConfigValueKey {
    pub hierarchy_type: HierarchyType,
    pub project_dir: PathBuf,
    pub platform: String,
    pub section: String,
    pub key: String,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct ConfigTrackerPayload {
    entries: HashMap<ConfigValueKey, Vec<String>>,
}

/// Populated during makefile generation as each config key is read; consulted on load to
/// revalidate that nothing the makefile depended on has changed.
#[derive(Default, serde::Serialize, serde::Deserialize)]
pub struct ConfigValueTracker {
    payload: ConfigTrackerPayload,
    #[serde(skip)]
    dirty: bool,
}

impl ConfigValueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Self {
        match read_versioned::<ConfigTrackerPayload>(path.as_ref(), FORMAT_VERSION) {
            Ok(payload) => Self { payload, dirty: false },
            Err(ArchiveError::Io(_)) => Self::new(),
            Err(err) => {
                warn!(path = %path.as_ref().display(), %err, "config value tracker unreadable, rebuilding");
                Self::new()
            }
        }
    }

    /// Records that `key` was read with `values` during generation. Repeated reads of the
    /// same key in one generation pass overwrite rather than append — the tracker records
    /// the value observed at the time the makefile was built, not a history.
    pub fn record(&mut self, key: ConfigValueKey, values: Vec<String>) {
        if self.payload.entries.get(&key) != Some(&values) {
            self.payload.entries.insert(key, values);
            self.dirty = true;
        }
    }

    pub fn recorded(&self, key: &ConfigValueKey) -> Option<&[String]> {
        self.payload.entries.get(key).map(Vec::as_slice)
    }

    /// Revalidates every recorded key against `current`, a closure able to re-read a key's
    /// present value list. Returns the first mismatch found, if any.
    pub fn revalidate(
        &self,
        mut current: impl FnMut(&ConfigValueKey) -> Vec<String>,
    ) -> Result<(), BuildError> {
        for (key, old) in &self.payload.entries {
            let new = current(key);
            if &new != old {
                return Err(BuildError::ConfigInvalid {
                    key: format!("{:?}/{}/{}/{}", key.hierarchy_type, key.platform, key.section, key.key),
                    old: old.clone(),
                    new,
                });
            }
        }
        Ok(())
    }

    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<(), BuildError> {
        if !self.dirty {
            return Ok(());
        }
        write_versioned(path, FORMAT_VERSION, &self.payload)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> ConfigValueKey {
        ConfigValueKey {
            hierarchy_type: HierarchyType::Project,
            project_dir: PathBuf::from("/proj"),
            platform: "Win64".into(),
            section: "BuildConfiguration".into(),
            key: k.into(),
        }
    }

    #[test]
    fn revalidate_passes_when_values_unchanged() {
        let mut tracker = ConfigValueTracker::new();
        tracker.record(key("bUseUnityBuild"), vec!["true".into()]);
        let result = tracker.revalidate(|_| vec!["true".into()]);
        assert!(result.is_ok());
    }

    #[test]
    fn revalidate_fails_when_value_changed() {
        let mut tracker = ConfigValueTracker::new();
        tracker.record(key("bUseUnityBuild"), vec!["true".into()]);
        let result = tracker.revalidate(|_| vec!["false".into()]);
        assert!(matches!(result, Err(BuildError::ConfigInvalid { .. })));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.cache");
        let mut tracker = ConfigValueTracker::new();
        tracker.record(key("k"), vec!["v".into()]);
        tracker.save(&path).unwrap();

        let reloaded = ConfigValueTracker::load(&path);
        assert_eq!(reloaded.recorded(&key("k")), Some(&["v".to_string()][..]));
    }
}
