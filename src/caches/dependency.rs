//! Parses compiler-emitted dependency lists; maps object file -> set of header files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::archive::{read_versioned, write_versioned, ArchiveError};
use crate::error::BuildError;
use tracing::warn;

const FORMAT_VERSION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DependencyRecord {
    pub header_files: Vec<PathBuf>,
    pub mtime: i64,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct DependencyPayload {
    entries: HashMap<PathBuf, DependencyRecord>,
}

/// Hierarchical singleton (layered engine -> project, each layer independently reusable)
/// mapping an object file to the header set it last depended on.
pub struct CppDependencyCache {
    payload: DependencyPayload,
    dirty: bool,
}

impl CppDependencyCache {
    pub fn new() -> Self {
        Self { payload: DependencyPayload::default(), dirty: false }
    }

    pub fn load(path: impl AsRef<Path>) -> Self {
        match read_versioned::<DependencyPayload>(path.as_ref(), FORMAT_VERSION) {
            Ok(payload) => Self { payload, dirty: false },
            Err(ArchiveError::Io(_)) => Self::new(),
            Err(err) => {
                warn!(path = %path.as_ref().display(), %err, "dependency cache unreadable, rebuilding");
                Self::new()
            }
        }
    }

    /// Returns the cached header set for `object_file` if its recorded mtime still matches,
    /// otherwise re-parses `dependency_list_file` and updates the cache.
    pub fn lookup_or_parse(
        &mut self,
        object_file: &Path,
        mtime: i64,
        dependency_list_file: &Path,
    ) -> Result<&DependencyRecord, BuildError> {
        let needs_parse = match self.payload.entries.get(object_file) {
            Some(record) => record.mtime != mtime,
            None => true,
        };
        if needs_parse {
            let header_files = parse_dependency_list(dependency_list_file)?;
            self.payload
                .entries
                .insert(object_file.to_path_buf(), DependencyRecord { header_files, mtime });
            self.dirty = true;
        }
        Ok(self.payload.entries.get(object_file).expect("just inserted or already present"))
    }

    pub fn headers_for(&self, object_file: &Path) -> Option<&[PathBuf]> {
        self.payload.entries.get(object_file).map(|r| r.header_files.as_slice())
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

impl Default for CppDependencyCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a compiler-emitted dependency file: one header path per non-empty, non-comment
/// line, matching the common `-MMD`/`-showIncludes`-derived plain-list format.
fn parse_dependency_list(path: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(BuildError::io(err, path)),
    };
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_plain_header_list() {
        let dir = tempfile::tempdir().unwrap();
        let dep_file = dir.path().join("a.d");
        fs::write(&dep_file, "b.h\nc.h\n# comment\n\n").unwrap();

        let headers = parse_dependency_list(&dep_file).unwrap();
        assert_eq!(headers, vec![PathBuf::from("b.h"), PathBuf::from("c.h")]);
    }

    #[test]
    fn missing_dependency_file_yields_empty_set() {
        let headers = parse_dependency_list(Path::new("/does/not/exist.d")).unwrap();
        assert!(headers.is_empty());
    }

    #[test]
    fn lookup_or_parse_reuses_on_matching_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let dep_file = dir.path().join("a.d");
        fs::write(&dep_file, "b.h\n").unwrap();

        let mut cache = CppDependencyCache::new();
        let obj = Path::new("a.o");
        cache.lookup_or_parse(obj, 5, &dep_file).unwrap();

        fs::write(&dep_file, "b.h\nc.h\n").unwrap();
        let record = cache.lookup_or_parse(obj, 5, &dep_file).unwrap();
        assert_eq!(record.header_files.len(), 1, "stale mtime should skip reparse");

        let record = cache.lookup_or_parse(obj, 6, &dep_file).unwrap();
        assert_eq!(record.header_files.len(), 2);
    }
}
