//! Process-wide interning of filesystem paths into small `Copy` handles.
//!
//! The original design relies on reference equality of shared `FileItem`/`DirectoryItem`
//! objects; here that becomes integer equality of `FileId`/`DirId` handles returned by a
//! single [`Paths`] arena. Metadata lives in the arena, not on the handle itself, and the
//! arena is never torn down mid-process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

/// Handle for an interned file path. Two lookups of the same normalized path return the
/// same handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct FileId(pub(crate) u32);

/// Handle for an interned directory path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct DirId(pub(crate) u32);

struct FileRecord {
    path: PathBuf,
    exists: bool,
    last_write_time: Option<SystemTime>,
}

struct DirRecord {
    path: PathBuf,
    /// Snapshotted at first access; `None` until enumerated once.
    children_files: Option<Vec<FileId>>,
    children_dirs: Option<Vec<DirId>>,
}

/// The process-wide path arena.
///
/// Not `Sync` by itself — callers needing shared access across worker threads wrap it in
/// a `Mutex` or confine mutation to single-threaded phases, matching the "interning tables
/// mutated only during reset-cached-info windows" rule of the concurrency model.
#[derive(Default)]
pub struct Paths {
    file_by_path: HashMap<PathBuf, FileId>,
    files: Vec<FileRecord>,
    dir_by_path: HashMap<PathBuf, DirId>,
    dirs: Vec<DirRecord>,
}

fn normalize(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl Paths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a file path, stat'ing it if this is the first time it is seen.
    pub fn intern_file(&mut self, path: impl AsRef<Path>) -> FileId {
        let normalized = normalize(&path);
        if let Some(id) = self.file_by_path.get(&normalized) {
            return *id;
        }
        let (exists, last_write_time) = stat(&normalized);
        let id = FileId(self.files.len() as u32);
        self.files.push(FileRecord { path: normalized.clone(), exists, last_write_time });
        self.file_by_path.insert(normalized, id);
        id
    }

    /// Interns a directory path.
    pub fn intern_dir(&mut self, path: impl AsRef<Path>) -> DirId {
        let normalized = normalize(&path);
        if let Some(id) = self.dir_by_path.get(&normalized) {
            return *id;
        }
        let id = DirId(self.dirs.len() as u32);
        self.dirs.push(DirRecord { path: normalized.clone(), children_files: None, children_dirs: None });
        self.dir_by_path.insert(normalized, id);
        id
    }

    pub fn file_path(&self, id: FileId) -> &Path {
        &self.files[id.0 as usize].path
    }

    pub fn dir_path(&self, id: DirId) -> &Path {
        &self.dirs[id.0 as usize].path
    }

    pub fn exists(&self, id: FileId) -> bool {
        self.files[id.0 as usize].exists
    }

    pub fn mtime(&self, id: FileId) -> Option<SystemTime> {
        self.files[id.0 as usize].last_write_time
    }

    /// Re-stats a file, refreshing its cached `exists`/`last_write_time`. The only way
    /// file metadata is ever mutated.
    pub fn reset_cached_info(&mut self, id: FileId) {
        let path = self.files[id.0 as usize].path.clone();
        let (exists, last_write_time) = stat(&path);
        let record = &mut self.files[id.0 as usize];
        record.exists = exists;
        record.last_write_time = last_write_time;
    }

    /// Returns this directory's immediate child files, enumerating and caching on first
    /// access. Call [`Self::invalidate_dir`] to force a rescan (e.g. after pre-build scripts).
    pub fn child_files(&mut self, id: DirId) -> &[FileId] {
        if self.dirs[id.0 as usize].children_files.is_none() {
            self.enumerate(id);
        }
        self.dirs[id.0 as usize].children_files.as_deref().unwrap_or(&[])
    }

    pub fn child_dirs(&mut self, id: DirId) -> &[DirId] {
        if self.dirs[id.0 as usize].children_dirs.is_none() {
            self.enumerate(id);
        }
        self.dirs[id.0 as usize].children_dirs.as_deref().unwrap_or(&[])
    }

    /// Invalidates the cached enumeration for a single directory; next access re-scans.
    pub fn invalidate_dir(&mut self, id: DirId) {
        let record = &mut self.dirs[id.0 as usize];
        record.children_files = None;
        record.children_dirs = None;
    }

    /// Invalidates every directory's cached enumeration en masse. Used after pre-build
    /// scripts run, since they may have written new generated source files.
    pub fn invalidate_all_dirs(&mut self) {
        for record in &mut self.dirs {
            record.children_files = None;
            record.children_dirs = None;
        }
    }

    fn enumerate(&mut self, id: DirId) {
        let dir_path = self.dirs[id.0 as usize].path.clone();
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        if let Ok(entries) = fs::read_dir(&dir_path) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    dirs.push(self.intern_dir(path));
                } else {
                    files.push(self.intern_file(path));
                }
            }
        }
        let record = &mut self.dirs[id.0 as usize];
        record.children_files = Some(files);
        record.children_dirs = Some(dirs);
    }

    /// Recursively collects every file under `dir` matching one of `extensions`, interning
    /// each as it is discovered. Does not use the cached single-level enumeration above —
    /// this is a one-shot deep scan used by the makefile generator to snapshot source trees.
    pub fn scan_source_files(
        &mut self,
        dir: impl AsRef<Path>,
        extensions: &[&str],
    ) -> Vec<FileId> {
        let mut out = Vec::new();
        for entry in WalkDir::new(dir.as_ref()).follow_links(true).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
                .unwrap_or(false);
            if matches {
                out.push(self.intern_file(entry.path()));
            }
        }
        out
    }
}

fn stat(path: &Path) -> (bool, Option<SystemTime>) {
    match fs::metadata(path) {
        Ok(meta) => (true, meta.modified().ok()),
        Err(_) => (false, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cpp");
        fs::write(&file, "// a").unwrap();

        let mut paths = Paths::new();
        let a = paths.intern_file(&file);
        let b = paths.intern_file(&file);
        assert_eq!(a, b);
        assert!(paths.exists(a));
    }

    #[test]
    fn reset_cached_info_picks_up_new_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.cpp");
        fs::write(&file, "// a").unwrap();

        let mut paths = Paths::new();
        let id = paths.intern_file(&file);
        assert!(paths.exists(id));

        fs::remove_file(&file).unwrap();
        // Stale cache still reports existence until reset.
        assert!(paths.exists(id));
        paths.reset_cached_info(id);
        assert!(!paths.exists(id));
    }

    #[test]
    fn child_files_enumerates_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.cpp"), "").unwrap();
        fs::write(dir.path().join("b.cpp"), "").unwrap();

        let mut paths = Paths::new();
        let d = paths.intern_dir(dir.path());
        assert_eq!(paths.child_files(d).len(), 2);

        fs::write(dir.path().join("c.cpp"), "").unwrap();
        // Still cached at 2 until invalidated.
        assert_eq!(paths.child_files(d).len(), 2);
        paths.invalidate_dir(d);
        assert_eq!(paths.child_files(d).len(), 3);
    }

    #[test]
    fn scan_source_files_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.cpp"), "").unwrap();
        fs::write(dir.path().join("a.h"), "").unwrap();
        fs::write(dir.path().join("readme.md"), "").unwrap();

        let mut paths = Paths::new();
        let found = paths.scan_source_files(dir.path(), &["cpp", "h"]);
        assert_eq!(found.len(), 2);
    }
}
