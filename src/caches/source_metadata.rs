//! Per-file scan results: reflection-marker presence and `#include` extraction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::archive::{read_versioned, write_versioned, ArchiveError};
use crate::error::BuildError;
use tracing::warn;

const FORMAT_VERSION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceMetadataRecord {
    pub contains_reflection_markup: bool,
    pub included_files: Vec<String>,
    pub mtime: i64,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct SourceMetadataPayload {
    entries: HashMap<PathBuf, SourceMetadataRecord>,
}

/// Hierarchical singleton (per engine/project layer) mapping source file path to its last
/// scan result, keyed and revalidated by file mtime.
pub struct SourceMetadataCache {
    payload: SourceMetadataPayload,
    dirty: bool,
}

impl SourceMetadataCache {
    pub fn new() -> Self {
        Self { payload: SourceMetadataPayload::default(), dirty: false }
    }

    /// Loads the cache from disk; version mismatch or corruption is tolerated and yields an
    /// empty, freshly-dirty cache rather than a fatal error.
    pub fn load(path: impl AsRef<Path>) -> Self {
        match read_versioned::<SourceMetadataPayload>(path.as_ref(), FORMAT_VERSION) {
            Ok(payload) => Self { payload, dirty: false },
            Err(ArchiveError::Io(_)) => Self::new(),
            Err(err) => {
                warn!(path = %path.as_ref().display(), %err, "source metadata cache unreadable, rebuilding");
                Self::new()
            }
        }
    }

    /// Returns the cached record if `mtime` matches what was recorded; otherwise invokes
    /// `scan` to reparse the file and updates the cache.
    pub fn lookup_or_scan(
        &mut self,
        file: &Path,
        mtime: i64,
        scan: impl FnOnce(&Path) -> SourceMetadataRecord,
    ) -> &SourceMetadataRecord {
        let needs_scan = match self.payload.entries.get(file) {
            Some(record) => record.mtime != mtime,
            None => true,
        };
        if needs_scan {
            let record = scan(file);
            self.payload.entries.insert(file.to_path_buf(), record);
            self.dirty = true;
        }
        self.payload.entries.get(file).expect("just inserted or already present")
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

impl Default for SourceMetadataCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts reflection-marker presence and `#include` targets from source text. The actual
/// marker/include lexical rules belong to the external rules collaborator; this is a
/// conservative default sufficient for tests and for sources with no custom markup scheme.
pub fn scan_source(path: &Path, contents: &str, mtime: i64) -> SourceMetadataRecord {
    let contains_reflection_markup = contents.contains("GENERATED_BODY")
        || contents.contains("UCLASS")
        || contents.contains("USTRUCT");
    let included_files = contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("#include")?;
            let rest = rest.trim();
            let rest = rest.strip_prefix('"').or_else(|| rest.strip_prefix('<'))?;
            let end = rest.find(['"', '>'])?;
            Some(rest[..end].to_string())
        })
        .collect();
    let _ = path;
    SourceMetadataRecord { contains_reflection_markup, included_files, mtime }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_finds_includes_and_markup() {
        let record = scan_source(
            Path::new("a.h"),
            "#include \"b.h\"\n#include <vector>\nUCLASS()\nclass A {};\n",
            10,
        );
        assert!(record.contains_reflection_markup);
        assert_eq!(record.included_files, vec!["b.h".to_string(), "vector".to_string()]);
    }

    #[test]
    fn lookup_or_scan_reuses_cached_entry_on_matching_mtime() {
        let mut cache = SourceMetadataCache::new();
        let mut scans = 0;
        let file = Path::new("a.h");
        cache.lookup_or_scan(file, 10, |p| {
            scans += 1;
            scan_source(p, "UCLASS()", 10)
        });
        cache.lookup_or_scan(file, 10, |p| {
            scans += 1;
            scan_source(p, "UCLASS()", 10)
        });
        assert_eq!(scans, 1);

        cache.lookup_or_scan(file, 11, |p| {
            scans += 1;
            scan_source(p, "UCLASS()", 11)
        });
        assert_eq!(scans, 2);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.cache");
        let mut cache = SourceMetadataCache::new();
        cache.lookup_or_scan(Path::new("a.h"), 1, |p| scan_source(p, "", 1));
        cache.save(&path).unwrap();

        let reloaded = SourceMetadataCache::load(&path);
        assert_eq!(reloaded.payload.entries.len(), 1);
        let _ = fs::metadata(&path).unwrap();
    }
}
