//! Throwaway source-tree and action-graph builders for tests, gated the same way the
//! teacher's `project_util` crate gates its `TempProject` helper behind a `project-util`
//! feature: available under `#[cfg(test)]` for this crate's own suite, and additionally
//! under the `test-util` feature for downstream embedders that want to exercise this crate's
//! pipeline without hand-assembling a `Paths` arena themselves.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::action::{Action, ActionType};
use crate::makefile::{AssembledTarget, TargetRules, TargetType};
use crate::paths::{DirId, FileId, Paths};

/// A toy compile-and-link module: two-or-more `.cpp` sources compiled to `.o`, archived into
/// one executable, mirroring the three-action graph in spec.md §8 scenario 1.
pub struct ToyModule {
    pub dir: TempDir,
    pub paths: Paths,
    pub source_dir: DirId,
    pub sources: Vec<(String, FileId)>,
    pub executable: FileId,
}

impl ToyModule {
    /// Writes `names` (e.g. `["a.cpp", "b.cpp"]`) as trivial C++ source files under a fresh
    /// temp directory and interns the whole tree into a new `Paths` arena.
    pub fn new(names: &[&str]) -> Self {
        let dir = TempDir::new().expect("create temp dir for toy module");
        let mut paths = Paths::new();
        let source_dir = paths.intern_dir(dir.path());

        let mut sources = Vec::new();
        for name in names {
            let path = dir.path().join(name);
            std::fs::write(&path, "int unused() { return 0; }\n").expect("write toy source");
            sources.push((name.to_string(), paths.intern_file(&path)));
        }

        let executable = paths.intern_file(dir.path().join("module.exe"));

        Self { dir, paths, source_dir, sources, executable }
    }

    /// Builds the compile-per-source + single-link action list a real descriptor collaborator
    /// would hand this crate, using `/bin/true` as the "compiler" so the actions are real,
    /// runnable subprocesses in tests without depending on an actual C++ toolchain.
    pub fn actions(&mut self) -> Vec<Action> {
        let tool = self.paths.intern_file("/bin/true");
        let mut actions = Vec::new();
        let mut objects = Vec::new();

        for (name, source) in self.sources.clone() {
            let object_path = self.dir.path().join(name.replace(".cpp", ".o"));
            let object = self.paths.intern_file(&object_path);
            let mut action = Action::new(ActionType::Compile, self.source_dir, tool, format!("-c {name}"));
            action.prerequisite_items.push(source);
            action.produced_items.push(object);
            action.status_description = format!("Compile {name}");
            objects.push(object);
            actions.push(action);
        }

        let mut link = Action::new(ActionType::Link, self.source_dir, tool, "-o module.exe".to_string());
        link.prerequisite_items = objects;
        link.produced_items.push(self.executable);
        link.status_description = "Link module.exe".to_string();
        actions.push(link);

        actions
    }

    /// Appends a new source file to the module's directory without re-interning it into any
    /// action yet — used to exercise the "added source file" invalidation scenario.
    pub fn add_source_file(&mut self, name: &str) -> FileId {
        let path = self.dir.path().join(name);
        std::fs::write(&path, "int unused2() { return 1; }\n").expect("write added source");
        self.paths.invalidate_dir(self.source_dir);
        self.paths.intern_file(&path)
    }

    /// Moves `name`'s mtime forward by `secs`, simulating an edit without changing content
    /// (content is irrelevant to this crate's outdatedness checks, which are mtime/hash
    /// based, not content-hash based).
    pub fn touch_forward(&self, name: &str, secs: u64) {
        let path = self.dir.path().join(name);
        let now = std::time::SystemTime::now() + std::time::Duration::from_secs(secs);
        let file = std::fs::File::open(&path).expect("open source to touch");
        file.set_modified(now).expect("advance mtime");
    }
}

/// Minimal [`TargetRules`] implementation wrapping a [`ToyModule`]'s prebuilt action list, for
/// exercising [`crate::makefile::Makefile::generate`] end to end without a real descriptor
/// parser.
pub struct ToyRules {
    pub descriptor_path: PathBuf,
    pub actions: Vec<Action>,
    pub source_dir: DirId,
    pub executable: FileId,
}

impl TargetRules for ToyRules {
    fn project_descriptor_path(&self) -> PathBuf {
        self.descriptor_path.clone()
    }

    fn pre_build_scripts(&self) -> &[String] {
        &[]
    }

    fn additional_arguments(&self) -> &[String] {
        &[]
    }

    fn assemble(&self, _paths: &mut Paths, _working_set: &HashSet<FileId>) -> crate::error::Result<AssembledTarget> {
        Ok(AssembledTarget {
            target_type: TargetType::Executable,
            executable_file: self.executable,
            receipt_file: self.executable,
            project_intermediate_directory: self.source_dir,
            actions: self.actions.clone(),
            output_items: vec![self.executable],
            module_name_to_output_items: HashMap::new(),
            hot_reload_module_names: HashSet::new(),
            source_directories: [self.source_dir].into_iter().collect(),
            external_dependencies: Vec::new(),
            internal_dependencies: Vec::new(),
            plugin_files: Vec::new(),
            uobject_modules: Vec::new(),
            uobject_module_headers: HashSet::new(),
            config_reads: Vec::new(),
            candidates_for_working_set: HashSet::new(),
            environment_variables: HashMap::new(),
            external_metadata: String::new(),
            b_deploy_after_compile: false,
            b_has_project_script_plugin: false,
        })
    }
}

/// Recursively copies `from` into `to`. Uses `fs_extra` (matching the teacher's
/// `project_util` dependency) when the `test-util` feature is enabled for downstream
/// embedders; falls back to a plain `std::fs` walk for this crate's own `#[cfg(test)]`
/// builds, which do not enable optional features.
pub fn copy_tree(from: impl AsRef<Path>, to: impl AsRef<Path>) -> std::io::Result<()> {
    #[cfg(feature = "test-util")]
    {
        let options = fs_extra::dir::CopyOptions::new().content_only(true);
        fs_extra::dir::copy(from.as_ref(), to.as_ref(), &options)
            .map(|_| ())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
    }
    #[cfg(not(feature = "test-util"))]
    {
        copy_tree_std(from.as_ref(), to.as_ref())
    }
}

#[cfg(not(feature = "test-util"))]
fn copy_tree_std(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree_std(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toy_module_builds_compile_and_link_actions() {
        let mut module = ToyModule::new(&["a.cpp", "b.cpp"]);
        let actions = module.actions();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[2].action_type, ActionType::Link);
        assert_eq!(actions[2].prerequisite_items.len(), 2);
    }

    #[test]
    fn add_source_file_writes_and_invalidates() {
        let mut module = ToyModule::new(&["a.cpp"]);
        let before = module.paths.child_files(module.source_dir).len();
        module.add_source_file("c.cpp");
        let after = module.paths.child_files(module.source_dir).len();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn copy_tree_std_reproduces_directory() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("x.txt"), "hi").unwrap();
        let dst = TempDir::new().unwrap();
        copy_tree(src.path(), dst.path()).unwrap();
        assert_eq!(std::fs::read_to_string(dst.path().join("x.txt")).unwrap(), "hi");
    }
}
