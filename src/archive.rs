//! Versioned, endian-stable binary archive format shared by every persisted cache and the
//! makefile bundle.
//!
//! Every persistent type is read and written through [`write_versioned`]/[`read_versioned`]:
//! a leading `i32` format version gates a hard regenerate on mismatch, followed by a
//! `bincode`-encoded payload. `bincode` already gives us the tagged-primitive, length-prefixed
//! encoding the original format describes (fixed-width integers, length-prefixed strings,
//! length + element list for vecs/sets, length + (key, value) pairs for maps), so this module
//! only adds the version gate and the interned path table used to make `FileId`/`DirId`
//! portable across process runs.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::paths::{DirId, FileId, Paths};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] bincode::Error),
    #[error("archive format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: i32, found: i32 },
}

/// Writes `value` to `path` as `[i32 version][bincode payload]`, atomically (write to a
/// sibling temp file, then rename).
pub fn write_versioned<T: Serialize>(
    path: impl AsRef<Path>,
    version: i32,
    value: &T,
) -> Result<(), ArchiveError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&version.to_le_bytes())?;
        let payload = bincode::serialize(value)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Reads and validates the leading version, returning `VersionMismatch` if it doesn't equal
/// `expected_version` rather than attempting to decode a payload in an unknown shape.
pub fn read_versioned<T: DeserializeOwned>(
    path: impl AsRef<Path>,
    expected_version: i32,
) -> Result<T, ArchiveError> {
    let mut file = fs::File::open(path)?;
    let mut version_bytes = [0u8; 4];
    file.read_exact(&mut version_bytes)?;
    let found = i32::from_le_bytes(version_bytes);
    if found != expected_version {
        return Err(ArchiveError::VersionMismatch { expected: expected_version, found });
    }
    let mut rest = Vec::new();
    file.read_to_end(&mut rest)?;
    Ok(bincode::deserialize(&rest)?)
}

/// An interned-by-index table of paths, written once per archive so that every
/// `FileId`/`DirId` reference elsewhere in the same archive can be stored as a compact `u32`
/// index instead of repeating a path string.
///
/// `FileId`/`DirId` values are only valid within the `Paths` arena of the process that
/// produced them, so they are never serialized directly; call [`PathTable::intern`] with the
/// live arena to build a table, then [`PathTable::resolve_file`]/[`PathTable::resolve_dir`]
/// on load to re-intern each path into the new process's arena.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PathTable {
    entries: Vec<PathBuf>,
    #[serde(skip)]
    index: HashMap<PathBuf, u32>,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_path(&mut self, path: &Path) -> u32 {
        if let Some(idx) = self.index.get(path) {
            return *idx;
        }
        let idx = self.entries.len() as u32;
        self.entries.push(path.to_path_buf());
        self.index.insert(path.to_path_buf(), idx);
        idx
    }

    pub fn intern_file(&mut self, paths: &Paths, id: FileId) -> u32 {
        self.intern_path(paths.file_path(id))
    }

    pub fn intern_dir(&mut self, paths: &Paths, id: DirId) -> u32 {
        self.intern_path(paths.dir_path(id))
    }

    pub fn resolve_file(&self, paths: &mut Paths, idx: u32) -> FileId {
        paths.intern_file(&self.entries[idx as usize])
    }

    pub fn resolve_dir(&self, paths: &mut Paths, idx: u32) -> DirId {
        paths.intern_dir(&self.entries[idx as usize])
    }

    /// Rebuilds the lookup index after deserialization; `entries` survives the wire format,
    /// `index` is a derived cache and is skipped by serde.
    pub fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, path) in self.entries.iter().enumerate() {
            self.index.insert(path.clone(), i as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        a: i64,
        b: String,
        c: Vec<u32>,
    }

    #[test]
    fn round_trips_matching_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let payload = Payload { a: 42, b: "hello".into(), c: vec![1, 2, 3] };

        write_versioned(&path, 19, &payload).unwrap();
        let loaded: Payload = read_versioned(&path, 19).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn rejects_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        write_versioned(&path, 19, &Payload { a: 1, b: String::new(), c: vec![] }).unwrap();

        let err = read_versioned::<Payload>(&path, 20).unwrap_err();
        assert!(matches!(err, ArchiveError::VersionMismatch { expected: 20, found: 19 }));
    }

    #[test]
    fn path_table_roundtrip_through_two_arenas() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cpp");
        fs::write(&file, "").unwrap();

        let mut writer_paths = Paths::new();
        let id = writer_paths.intern_file(&file);
        let mut table = PathTable::new();
        let idx = table.intern_file(&writer_paths, id);

        let mut reader_paths = Paths::new();
        let resolved = table.resolve_file(&mut reader_paths, idx);
        assert_eq!(reader_paths.file_path(resolved), writer_paths.file_path(id));
    }
}
