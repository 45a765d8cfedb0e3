//! Maps produced-file identity to a stable hash of the command line that last produced it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::archive::{read_versioned, write_versioned, ArchiveError};
use crate::error::BuildError;
use tracing::warn;

const FORMAT_VERSION: i32 = 1;

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct HistoryPayload {
    entries: HashMap<PathBuf, String>,
}

/// Persistent, per-toolchain/per-platform action history, keyed by a hex digest of the
/// command line rather than a `Hash`-derived integer: the same `md5`+`hex` pairing the
/// teacher's own `Source::content_hash` uses for source content (`sources.rs`), applied here
/// to command-line strings instead of file bytes so the stored digest is portable across
/// compiler/std versions, not just stable within one process.
pub struct ActionHistory {
    payload: HistoryPayload,
    dirty: bool,
}

impl ActionHistory {
    pub fn new() -> Self {
        Self { payload: HistoryPayload::default(), dirty: false }
    }

    pub fn load(path: impl AsRef<Path>) -> Self {
        match read_versioned::<HistoryPayload>(path.as_ref(), FORMAT_VERSION) {
            Ok(payload) => Self { payload, dirty: false },
            Err(ArchiveError::Io(_)) => Self::new(),
            Err(err) => {
                warn!(path = %path.as_ref().display(), %err, "action history unreadable, rebuilding");
                Self::new()
            }
        }
    }

    pub fn lookup(&self, produced: &Path) -> Option<&str> {
        self.payload.entries.get(produced).map(String::as_str)
    }

    pub fn record(&mut self, produced: PathBuf, hash: String) {
        if self.payload.entries.get(&produced) != Some(&hash) {
            self.payload.entries.insert(produced, hash);
            self.dirty = true;
        }
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

impl Default for ActionHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable hash of a command line: same input string always yields the same hex digest,
/// across runs and across builds of this binary (unlike a `Hash`-derived integer, which
/// `std` only promises is stable within one process).
pub fn command_hash(command_arguments: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(command_arguments.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_hash_is_stable_for_identical_strings() {
        assert_eq!(command_hash("/usr/bin/cc -c a.cpp -o a.o"), command_hash("/usr/bin/cc -c a.cpp -o a.o"));
    }

    #[test]
    fn command_hash_differs_for_different_strings() {
        assert_ne!(command_hash("-DFOO=1"), command_hash("-DFOO=2"));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.cache");
        let hash = command_hash("cc -c a.cpp");
        let mut history = ActionHistory::new();
        history.record(PathBuf::from("a.o"), hash.clone());
        history.save(&path).unwrap();

        let reloaded = ActionHistory::load(&path);
        assert_eq!(reloaded.lookup(Path::new("a.o")), Some(hash.as_str()));
    }

    #[test]
    fn unchanged_record_does_not_mark_dirty() {
        let mut history = ActionHistory::new();
        history.record(PathBuf::from("a.o"), "42".to_string());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.cache");
        history.save(&path).unwrap();
        assert!(path.exists());

        std::fs::remove_file(&path).unwrap();
        history.record(PathBuf::from("a.o"), "42".to_string());
        history.save(&path).unwrap();
        assert!(!path.exists(), "save should be a no-op when nothing changed since last flush");
    }
}
