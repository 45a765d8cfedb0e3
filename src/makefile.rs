//! The persistent bundle of an action graph and its invalidation inputs — not related to
//! any external build tool of the same name.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::action::Action;
use crate::archive::{read_versioned, write_versioned, ArchiveError, PathTable};
use crate::caches::ConfigValueTracker;
use crate::error::BuildError;
use crate::paths::{DirId, FileId, Paths};
use tracing::warn;

/// Format version gating a hard regenerate on mismatch. Bump whenever a persisted field's
/// shape changes.
pub const FORMAT_VERSION: i32 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TargetType {
    Executable,
    DynamicLibrary,
    StaticLibrary,
}

/// Reason a makefile was not reused, surfaced for diagnostics and for the `-WriteOutdatedActions`
/// flag's companion logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasonNotLoaded {
    DoesNotExist,
    VersionMismatch,
    NewerThanBuildTool,
    NewerThanDescriptor,
    NewerThanGeneratedProjectFilesStamp,
    NewerThanBuildVersionFile,
    NewerThanXmlConfigInput(PathBuf),
    AdditionalArgumentsChanged,
    ConfigValueChanged(String),
    ExternalMetadataChanged,
    SourceFileAdded(PathBuf),
    SourceFileRemoved(PathBuf),
    NewSourceSubdirectory(PathBuf),
    ExternalDependencyChanged(PathBuf),
    InternalDependencyChanged(PathBuf),
    PluginFileAdded(PathBuf),
    ReflectionHeaderSetChanged(PathBuf),
    WorkingSetMembershipChanged(PathBuf),
}

impl std::fmt::Display for ReasonNotLoaded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DoesNotExist => write!(f, "makefile does not exist"),
            Self::VersionMismatch => write!(f, "makefile format version mismatch"),
            Self::NewerThanBuildTool => write!(f, "build tool binary is newer than makefile"),
            Self::NewerThanDescriptor => write!(f, "target descriptor is newer than makefile"),
            Self::NewerThanGeneratedProjectFilesStamp => {
                write!(f, "generated project files stamp is newer than makefile")
            }
            Self::NewerThanBuildVersionFile => write!(f, "default build-version file is newer than makefile"),
            Self::NewerThanXmlConfigInput(p) => {
                write!(f, "XML config input file is newer than makefile: {}", p.display())
            }
            Self::AdditionalArgumentsChanged => write!(f, "additional arguments changed"),
            Self::ConfigValueChanged(key) => write!(f, "config value changed: {key}"),
            Self::ExternalMetadataChanged => write!(f, "platform external metadata changed"),
            Self::SourceFileAdded(p) => write!(f, "source file added: {}", p.display()),
            Self::SourceFileRemoved(p) => write!(f, "source file removed: {}", p.display()),
            Self::NewSourceSubdirectory(p) => write!(f, "new source sub-directory: {}", p.display()),
            Self::ExternalDependencyChanged(p) => write!(f, "external dependency changed: {}", p.display()),
            Self::InternalDependencyChanged(p) => write!(f, "internal dependency changed: {}", p.display()),
            Self::PluginFileAdded(p) => write!(f, "plugin file added: {}", p.display()),
            Self::ReflectionHeaderSetChanged(p) => write!(f, "reflection header set changed: {}", p.display()),
            Self::WorkingSetMembershipChanged(p) => write!(f, "working set membership changed: {}", p.display()),
        }
    }
}

/// External inputs used to revalidate a loaded makefile, supplied fresh by the caller on
/// every invocation (never persisted as part of the makefile itself).
pub struct LoadContext<'a> {
    pub project_descriptor_path: &'a Path,
    pub generated_project_files_stamp: Option<&'a Path>,
    pub build_tool_binary: &'a Path,
    /// The default build-version file (e.g. the engine's `Build.version`): a makefile newer
    /// than this reflects a build-version bump that happened since the makefile was written,
    /// per spec.md §4.2's five-way staleness check.
    pub build_version_file: &'a Path,
    /// Every XML config input file that fed makefile generation (e.g.
    /// `BuildConfiguration.xml` layers). Checked independently of `config_value_tracker`:
    /// the tracker only revalidates keys actually *read*, so an edit to an unread key in one
    /// of these files would otherwise go unnoticed.
    pub xml_config_inputs: &'a [&'a Path],
    pub additional_arguments: &'a [String],
    pub external_metadata: String,
}

/// The finalized output of the external rule-assembly collaborator (spec §1's "Parsing of
/// module/target descriptor files" — explicitly out of scope for this crate). Everything
/// this crate needs to build a [`Makefile`] from one target, already resolved against a live
/// [`Paths`] arena: actions, terminal outputs, and the invalidation inputs to snapshot.
pub struct AssembledTarget {
    pub target_type: TargetType,
    pub executable_file: FileId,
    pub receipt_file: FileId,
    pub project_intermediate_directory: DirId,
    pub actions: Vec<Action>,
    pub output_items: Vec<FileId>,
    pub module_name_to_output_items: HashMap<String, Vec<FileId>>,
    pub hot_reload_module_names: HashSet<String>,
    pub source_directories: HashSet<DirId>,
    pub external_dependencies: Vec<FileId>,
    pub internal_dependencies: Vec<FileId>,
    pub plugin_files: Vec<FileId>,
    pub uobject_modules: Vec<String>,
    pub uobject_module_headers: HashSet<FileId>,
    pub config_reads: Vec<(crate::caches::config_tracker::ConfigValueKey, Vec<String>)>,
    pub candidates_for_working_set: HashSet<FileId>,
    pub environment_variables: HashMap<String, String>,
    pub external_metadata: String,
    pub b_deploy_after_compile: bool,
    pub b_has_project_script_plugin: bool,
}

/// External collaborator interface this crate consumes to regenerate a makefile: target
/// descriptor parsing, toolchain discovery, and platform flag assembly all live on the other
/// side of this trait (spec §1 Non-goals). `Makefile::generate` drives pre-build scripts and
/// source-directory snapshotting around a single call to [`TargetRules::assemble`].
pub trait TargetRules {
    fn project_descriptor_path(&self) -> PathBuf;
    fn pre_build_scripts(&self) -> &[String];
    fn additional_arguments(&self) -> &[String];

    /// Produces the finalized action list and invalidation inputs for one target. Called
    /// with the live `Paths` arena so every `FileId`/`DirId` it returns is already interned.
    fn assemble(
        &self,
        paths: &mut Paths,
        working_set: &HashSet<FileId>,
    ) -> Result<AssembledTarget, BuildError>;
}

/// The serialized bundle: actions plus every input that can invalidate them.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Makefile {
    pub create_time_utc: i64,
    pub modified_time_utc: i64,
    pub format_version: i32,

    pub target_type: TargetType,
    pub executable_file: FileId,
    pub receipt_file: FileId,
    pub project_intermediate_directory: DirId,

    pub actions: Vec<Action>,
    pub output_items: Vec<FileId>,
    pub module_name_to_output_items: HashMap<String, Vec<FileId>>,
    pub hot_reload_module_names: HashSet<String>,

    pub source_directories: HashSet<DirId>,
    pub directory_to_source_files: HashMap<DirId, Vec<FileId>>,

    pub working_set: HashSet<FileId>,
    pub candidates_for_working_set: HashSet<FileId>,

    pub external_dependencies: Vec<FileId>,
    pub internal_dependencies: Vec<FileId>,

    pub plugin_files: Vec<FileId>,
    pub uobject_modules: Vec<String>,
    pub uobject_module_headers: HashSet<FileId>,

    pub config_value_tracker: ConfigValueTracker,

    pub pre_build_scripts: Vec<String>,
    pub additional_arguments: Vec<String>,
    pub environment_variables: HashMap<String, String>,

    pub diagnostics: Vec<String>,
    pub external_metadata: String,

    pub b_deploy_after_compile: bool,
    pub b_has_project_script_plugin: bool,
}

/// On-disk shape of [`Makefile`]: `FileId`/`DirId` are only valid within the arena of the
/// process that produced them, so the archive stores a `PathTable` plus index-based
/// references instead of the handles directly (mirrors the interned-path-table design note).
#[derive(serde::Serialize, serde::Deserialize)]
struct MakefileWire {
    path_table: PathTable,
    makefile: MakefileIndexed,
}

/// `Makefile` with every `FileId`/`DirId` replaced by its `PathTable` index. Field-for-field
/// identical otherwise; kept as a thin mirror rather than a macro to keep the archive
/// boundary obvious at a glance.
#[derive(serde::Serialize, serde::Deserialize)]
struct MakefileIndexed {
    create_time_utc: i64,
    modified_time_utc: i64,
    format_version: i32,
    target_type: TargetType,
    executable_file: u32,
    receipt_file: u32,
    project_intermediate_directory: u32,
    actions: Vec<ActionIndexed>,
    output_items: Vec<u32>,
    module_name_to_output_items: HashMap<String, Vec<u32>>,
    hot_reload_module_names: HashSet<String>,
    source_directories: HashSet<u32>,
    directory_to_source_files: HashMap<u32, Vec<u32>>,
    working_set: HashSet<u32>,
    candidates_for_working_set: HashSet<u32>,
    external_dependencies: Vec<u32>,
    internal_dependencies: Vec<u32>,
    plugin_files: Vec<u32>,
    uobject_modules: Vec<String>,
    uobject_module_headers: HashSet<u32>,
    config_value_tracker_bytes: Vec<u8>,
    pre_build_scripts: Vec<String>,
    additional_arguments: Vec<String>,
    environment_variables: HashMap<String, String>,
    diagnostics: Vec<String>,
    external_metadata: String,
    b_deploy_after_compile: bool,
    b_has_project_script_plugin: bool,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ActionIndexed {
    action: Action,
    working_directory_idx: u32,
    command_path_idx: u32,
    prerequisite_idx: Vec<u32>,
    produced_idx: Vec<u32>,
    delete_idx: Vec<u32>,
    dependency_list_file_idx: Option<u32>,
}

impl Makefile {
    pub fn now_utc() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    /// Runs `rules.assemble` to produce a fresh action graph plus invalidation inputs,
    /// snapshotting every source directory touched and running pre-build scripts exactly
    /// once before doing so.
    ///
    /// Pre-build scripts run before the directory snapshot (not after): they may write new
    /// generated source files, and the whole point of the snapshot is to capture the set
    /// `is_valid_for_source_files` will later compare against, which must include anything
    /// a pre-build script creates. The arena's directory enumeration cache is invalidated en
    /// masse afterwards per the `DirectoryItem` invariant in spec §3.
    pub fn generate(
        paths: &mut Paths,
        rules: &dyn TargetRules,
        working_set: &HashSet<FileId>,
    ) -> Result<Self, BuildError> {
        for script in rules.pre_build_scripts() {
            run_pre_build_script(script)?;
        }
        paths.invalidate_all_dirs();

        let assembled = rules.assemble(paths, working_set)?;

        let directory_to_source_files: HashMap<DirId, Vec<FileId>> = assembled
            .source_directories
            .iter()
            .map(|&dir| (dir, paths.child_files(dir).to_vec()))
            .collect();

        let mut config_value_tracker = ConfigValueTracker::new();
        for (key, values) in assembled.config_reads {
            config_value_tracker.record(key, values);
        }

        let now = Self::now_utc();
        Ok(Self {
            create_time_utc: now,
            modified_time_utc: now,
            format_version: FORMAT_VERSION,
            target_type: assembled.target_type,
            executable_file: assembled.executable_file,
            receipt_file: assembled.receipt_file,
            project_intermediate_directory: assembled.project_intermediate_directory,
            actions: assembled.actions,
            output_items: assembled.output_items,
            module_name_to_output_items: assembled.module_name_to_output_items,
            hot_reload_module_names: assembled.hot_reload_module_names,
            source_directories: assembled.source_directories,
            directory_to_source_files,
            working_set: working_set.clone(),
            candidates_for_working_set: assembled.candidates_for_working_set,
            external_dependencies: assembled.external_dependencies,
            internal_dependencies: assembled.internal_dependencies,
            plugin_files: assembled.plugin_files,
            uobject_modules: assembled.uobject_modules,
            uobject_module_headers: assembled.uobject_module_headers,
            config_value_tracker,
            pre_build_scripts: rules.pre_build_scripts().to_vec(),
            additional_arguments: rules.additional_arguments().to_vec(),
            environment_variables: assembled.environment_variables,
            diagnostics: Vec::new(),
            external_metadata: assembled.external_metadata,
            b_deploy_after_compile: assembled.b_deploy_after_compile,
            b_has_project_script_plugin: assembled.b_has_project_script_plugin,
        })
    }

    /// Persists the makefile atomically, re-interning every `FileId`/`DirId` it references
    /// (directly or inside its actions) into a `PathTable` so the archive is portable across
    /// process runs.
    pub fn save(&self, paths: &Paths, path: impl AsRef<Path>) -> Result<(), BuildError> {
        let mut table = PathTable::new();
        let indexed = MakefileIndexed {
            create_time_utc: self.create_time_utc,
            modified_time_utc: self.modified_time_utc,
            format_version: self.format_version,
            target_type: self.target_type,
            executable_file: table.intern_file(paths, self.executable_file),
            receipt_file: table.intern_file(paths, self.receipt_file),
            project_intermediate_directory: table.intern_dir(paths, self.project_intermediate_directory),
            actions: self.actions.iter().map(|a| index_action(a, paths, &mut table)).collect(),
            output_items: self.output_items.iter().map(|&f| table.intern_file(paths, f)).collect(),
            module_name_to_output_items: self
                .module_name_to_output_items
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().map(|&f| table.intern_file(paths, f)).collect()))
                .collect(),
            hot_reload_module_names: self.hot_reload_module_names.clone(),
            source_directories: self.source_directories.iter().map(|&d| table.intern_dir(paths, d)).collect(),
            directory_to_source_files: self
                .directory_to_source_files
                .iter()
                .map(|(d, files)| {
                    (table.intern_dir(paths, *d), files.iter().map(|&f| table.intern_file(paths, f)).collect())
                })
                .collect(),
            working_set: self.working_set.iter().map(|&f| table.intern_file(paths, f)).collect(),
            candidates_for_working_set: self
                .candidates_for_working_set
                .iter()
                .map(|&f| table.intern_file(paths, f))
                .collect(),
            external_dependencies: self.external_dependencies.iter().map(|&f| table.intern_file(paths, f)).collect(),
            internal_dependencies: self.internal_dependencies.iter().map(|&f| table.intern_file(paths, f)).collect(),
            plugin_files: self.plugin_files.iter().map(|&f| table.intern_file(paths, f)).collect(),
            uobject_modules: self.uobject_modules.clone(),
            uobject_module_headers: self.uobject_module_headers.iter().map(|&f| table.intern_file(paths, f)).collect(),
            config_value_tracker_bytes: bincode::serialize(&self.config_value_tracker).map_err(ArchiveError::from)?,
            pre_build_scripts: self.pre_build_scripts.clone(),
            additional_arguments: self.additional_arguments.clone(),
            environment_variables: self.environment_variables.clone(),
            diagnostics: self.diagnostics.clone(),
            external_metadata: self.external_metadata.clone(),
            b_deploy_after_compile: self.b_deploy_after_compile,
            b_has_project_script_plugin: self.b_has_project_script_plugin,
        };
        let wire = MakefileWire { path_table: table, makefile: indexed };
        write_versioned(path, FORMAT_VERSION, &wire)?;
        Ok(())
    }

    /// Loads and revalidates a makefile. Refuses (returning `Ok(Err(reason))`, not an `Err`
    /// — a refusal is the expected "regenerate" path, not a fatal error) for any of the
    /// reasons in §4.2: missing file, version mismatch, staleness against the listed
    /// timestamps, changed CLI arguments, or config tracker mismatch.
    pub fn load(
        paths: &mut Paths,
        path: impl AsRef<Path>,
        ctx: &LoadContext,
        current_config: impl FnMut(&crate::caches::config_tracker::ConfigValueKey) -> Vec<String>,
    ) -> Result<std::result::Result<Self, ReasonNotLoaded>, BuildError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Err(ReasonNotLoaded::DoesNotExist));
        }
        let wire = match read_versioned::<MakefileWire>(path, FORMAT_VERSION) {
            Ok(w) => w,
            Err(ArchiveError::VersionMismatch { .. }) => return Ok(Err(ReasonNotLoaded::VersionMismatch)),
            Err(err) => {
                warn!(path = %path.display(), %err, "makefile unreadable, regenerating");
                return Ok(Err(ReasonNotLoaded::VersionMismatch));
            }
        };
        let makefile_mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());

        if let Some(makefile_mtime) = makefile_mtime {
            if is_newer(ctx.build_tool_binary, makefile_mtime) {
                return Ok(Err(ReasonNotLoaded::NewerThanBuildTool));
            }
            if is_newer(ctx.project_descriptor_path, makefile_mtime) {
                return Ok(Err(ReasonNotLoaded::NewerThanDescriptor));
            }
            if let Some(stamp) = ctx.generated_project_files_stamp {
                if is_newer(stamp, makefile_mtime) {
                    return Ok(Err(ReasonNotLoaded::NewerThanGeneratedProjectFilesStamp));
                }
            }
            if is_newer(ctx.build_version_file, makefile_mtime) {
                return Ok(Err(ReasonNotLoaded::NewerThanBuildVersionFile));
            }
            for &xml_input in ctx.xml_config_inputs {
                if is_newer(xml_input, makefile_mtime) {
                    return Ok(Err(ReasonNotLoaded::NewerThanXmlConfigInput(xml_input.to_path_buf())));
                }
            }
        }

        let makefile = unindex_makefile(wire, paths)?;

        if makefile.additional_arguments != ctx.additional_arguments {
            return Ok(Err(ReasonNotLoaded::AdditionalArgumentsChanged));
        }
        if makefile.external_metadata != ctx.external_metadata {
            return Ok(Err(ReasonNotLoaded::ExternalMetadataChanged));
        }
        let mut current_config = current_config;
        if let Err(BuildError::ConfigInvalid { key, .. }) =
            makefile.config_value_tracker.revalidate(&mut current_config)
        {
            return Ok(Err(ReasonNotLoaded::ConfigValueChanged(key)));
        }

        Ok(Ok(makefile))
    }

    /// Revalidates a loaded makefile against the live source tree: directory mtimes,
    /// external/internal dependency timestamps, plugin files, reflection header set, and
    /// working-set membership. Returns the first violated invariant, if any.
    ///
    /// `current_plugin_files` and `current_working_set` are supplied fresh by the caller
    /// (the external descriptor collaborator owns plugin discovery; the working set is the
    /// set of files the developer is actively editing right now) rather than recomputed
    /// here, mirroring how `reflection_headers_now` is already a callback rather than a
    /// field this module knows how to derive on its own.
    ///
    /// `ignore_junk` corresponds to the `-IgnoreJunk` CLI flag: when set, a source directory
    /// gaining or losing files does not by itself invalidate the makefile. Used when the
    /// source tree is known to contain files the descriptor collaborator doesn't recognize
    /// (editor swap files, generated scratch output) that would otherwise look like a
    /// perpetual "source file added" regeneration trigger.
    pub fn is_valid_for_source_files(
        &self,
        paths: &mut Paths,
        reflection_headers_now: impl Fn(&mut Paths, DirId) -> HashSet<FileId>,
        current_plugin_files: &HashSet<FileId>,
        current_working_set: &HashSet<FileId>,
        ignore_junk: bool,
    ) -> std::result::Result<(), ReasonNotLoaded> {
        for &dir in &self.source_directories {
            let dir_mtime = std::fs::metadata(paths.dir_path(dir)).ok().and_then(|m| m.modified().ok());
            let dir_is_newer = dir_mtime
                .map(|m| m.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0) > self.create_time_utc)
                .unwrap_or(false);
            if !dir_is_newer {
                continue;
            }
            paths.invalidate_dir(dir);
            if ignore_junk {
                continue;
            }
            let current: HashSet<FileId> = paths.child_files(dir).iter().copied().collect();
            let recorded: HashSet<FileId> =
                self.directory_to_source_files.get(&dir).map(|v| v.iter().copied().collect()).unwrap_or_default();
            if let Some(&added) = current.difference(&recorded).next() {
                return Err(ReasonNotLoaded::SourceFileAdded(paths.file_path(added).to_path_buf()));
            }
            if let Some(&removed) = recorded.difference(&current).next() {
                return Err(ReasonNotLoaded::SourceFileRemoved(paths.file_path(removed).to_path_buf()));
            }
            for &child_dir in paths.child_dirs(dir).to_vec().iter() {
                if !self.source_directories.contains(&child_dir) && !paths.child_files(child_dir).is_empty() {
                    return Err(ReasonNotLoaded::NewSourceSubdirectory(paths.dir_path(child_dir).to_path_buf()));
                }
            }
        }

        for &dep in &self.external_dependencies {
            paths.reset_cached_info(dep);
            let newer = paths
                .mtime(dep)
                .map(|m| m.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0) > self.create_time_utc)
                .unwrap_or(false);
            if newer {
                return Err(ReasonNotLoaded::ExternalDependencyChanged(paths.file_path(dep).to_path_buf()));
            }
        }
        for &dep in &self.internal_dependencies {
            paths.reset_cached_info(dep);
            let newer = paths
                .mtime(dep)
                .map(|m| {
                    m.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0) > self.modified_time_utc
                })
                .unwrap_or(false);
            if newer {
                return Err(ReasonNotLoaded::InternalDependencyChanged(paths.file_path(dep).to_path_buf()));
            }
        }

        let recorded_plugins: HashSet<FileId> = self.plugin_files.iter().copied().collect();
        if let Some(&added) = current_plugin_files.difference(&recorded_plugins).next() {
            return Err(ReasonNotLoaded::PluginFileAdded(paths.file_path(added).to_path_buf()));
        }

        // Any file that crossed the working-set boundary in either direction invalidates:
        // a file newly in the active working set was previously unity-batched and is no
        // longer (or vice versa), which changes which actions produce it.
        for &file in &self.working_set {
            if !current_working_set.contains(&file) {
                return Err(ReasonNotLoaded::WorkingSetMembershipChanged(paths.file_path(file).to_path_buf()));
            }
        }
        for &file in &self.candidates_for_working_set {
            if current_working_set.contains(&file) {
                return Err(ReasonNotLoaded::WorkingSetMembershipChanged(paths.file_path(file).to_path_buf()));
            }
        }

        for &dir in &self.source_directories {
            let current_headers = reflection_headers_now(paths, dir);
            let recorded: HashSet<FileId> = self
                .uobject_module_headers
                .iter()
                .copied()
                .filter(|f| paths.file_path(*f).starts_with(paths.dir_path(dir)))
                .collect();
            let current_in_dir: HashSet<FileId> = current_headers
                .into_iter()
                .filter(|f| paths.file_path(*f).starts_with(paths.dir_path(dir)))
                .collect();
            if current_in_dir != recorded {
                if let Some(&changed) = current_in_dir.symmetric_difference(&recorded).next() {
                    return Err(ReasonNotLoaded::ReflectionHeaderSetChanged(paths.file_path(changed).to_path_buf()));
                }
            }
        }

        Ok(())
    }
}

fn is_newer(path: &Path, than: SystemTime) -> bool {
    std::fs::metadata(path).and_then(|m| m.modified()).map(|m| m > than).unwrap_or(false)
}

/// Runs one pre-build script to completion via the system shell, failing the generate step
/// on a non-zero exit. Scripts are opaque command-line strings, same as an action's own
/// `command_arguments` (spec §1: platform flag/script assembly is an external concern).
fn run_pre_build_script(script: &str) -> Result<(), BuildError> {
    cfg_if::cfg_if! {
        if #[cfg(windows)] {
            let status = std::process::Command::new("cmd").arg("/C").arg(script).status();
        } else {
            let status = std::process::Command::new("sh").arg("-c").arg(script).status();
        }
    }

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => {
            Err(BuildError::msg(format!("pre-build script failed ({status}): {script}")))
        }
        Err(err) => Err(BuildError::io(err, script)),
    }
}

fn index_action(action: &Action, paths: &Paths, table: &mut PathTable) -> ActionIndexed {
    ActionIndexed {
        working_directory_idx: table.intern_dir(paths, action.working_directory),
        command_path_idx: table.intern_file(paths, action.command_path),
        prerequisite_idx: action.prerequisite_items.iter().map(|&f| table.intern_file(paths, f)).collect(),
        produced_idx: action.produced_items.iter().map(|&f| table.intern_file(paths, f)).collect(),
        delete_idx: action.delete_items.iter().map(|&f| table.intern_file(paths, f)).collect(),
        dependency_list_file_idx: action.dependency_list_file.map(|f| table.intern_file(paths, f)),
        action: action.clone(),
    }
}

fn unindex_makefile(wire: MakefileWire, paths: &mut Paths) -> Result<Makefile, BuildError> {
    let table = wire.path_table;
    let m = wire.makefile;
    let actions = m
        .actions
        .into_iter()
        .map(|indexed| {
            let mut action = indexed.action;
            action.working_directory = table.resolve_dir(paths, indexed.working_directory_idx);
            action.command_path = table.resolve_file(paths, indexed.command_path_idx);
            action.prerequisite_items = indexed.prerequisite_idx.iter().map(|&i| table.resolve_file(paths, i)).collect();
            action.produced_items = indexed.produced_idx.iter().map(|&i| table.resolve_file(paths, i)).collect();
            action.delete_items = indexed.delete_idx.iter().map(|&i| table.resolve_file(paths, i)).collect();
            action.dependency_list_file = indexed.dependency_list_file_idx.map(|i| table.resolve_file(paths, i));
            action
        })
        .collect();

    Ok(Makefile {
        create_time_utc: m.create_time_utc,
        modified_time_utc: m.modified_time_utc,
        format_version: m.format_version,
        target_type: m.target_type,
        executable_file: table.resolve_file(paths, m.executable_file),
        receipt_file: table.resolve_file(paths, m.receipt_file),
        project_intermediate_directory: table.resolve_dir(paths, m.project_intermediate_directory),
        actions,
        output_items: m.output_items.iter().map(|&i| table.resolve_file(paths, i)).collect(),
        module_name_to_output_items: m
            .module_name_to_output_items
            .into_iter()
            .map(|(k, v)| (k, v.iter().map(|&i| table.resolve_file(paths, i)).collect()))
            .collect(),
        hot_reload_module_names: m.hot_reload_module_names,
        source_directories: m.source_directories.iter().map(|&i| table.resolve_dir(paths, i)).collect(),
        directory_to_source_files: m
            .directory_to_source_files
            .into_iter()
            .map(|(d, files)| {
                (table.resolve_dir(paths, d), files.iter().map(|&i| table.resolve_file(paths, i)).collect())
            })
            .collect(),
        working_set: m.working_set.iter().map(|&i| table.resolve_file(paths, i)).collect(),
        candidates_for_working_set: m.candidates_for_working_set.iter().map(|&i| table.resolve_file(paths, i)).collect(),
        external_dependencies: m.external_dependencies.iter().map(|&i| table.resolve_file(paths, i)).collect(),
        internal_dependencies: m.internal_dependencies.iter().map(|&i| table.resolve_file(paths, i)).collect(),
        plugin_files: m.plugin_files.iter().map(|&i| table.resolve_file(paths, i)).collect(),
        uobject_modules: m.uobject_modules,
        uobject_module_headers: m.uobject_module_headers.iter().map(|&i| table.resolve_file(paths, i)).collect(),
        config_value_tracker: bincode::deserialize(&m.config_value_tracker_bytes).map_err(ArchiveError::from)?,
        pre_build_scripts: m.pre_build_scripts,
        additional_arguments: m.additional_arguments,
        environment_variables: m.environment_variables,
        diagnostics: m.diagnostics,
        external_metadata: m.external_metadata,
        b_deploy_after_compile: m.b_deploy_after_compile,
        b_has_project_script_plugin: m.b_has_project_script_plugin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;

    fn minimal_makefile(paths: &mut Paths, dir: &Path) -> Makefile {
        let exe = paths.intern_file(dir.join("app.exe"));
        let receipt = paths.intern_file(dir.join("app.target"));
        let intdir = paths.intern_dir(dir);
        Makefile {
            create_time_utc: 100,
            modified_time_utc: 100,
            format_version: FORMAT_VERSION,
            target_type: TargetType::Executable,
            executable_file: exe,
            receipt_file: receipt,
            project_intermediate_directory: intdir,
            actions: vec![{
                let cmd = paths.intern_file(dir.join("cc"));
                Action::new(ActionType::Compile, intdir, cmd, "cc a.cpp -o a.o")
            }],
            output_items: vec![exe],
            module_name_to_output_items: HashMap::new(),
            hot_reload_module_names: HashSet::new(),
            source_directories: HashSet::new(),
            directory_to_source_files: HashMap::new(),
            working_set: HashSet::new(),
            candidates_for_working_set: HashSet::new(),
            external_dependencies: Vec::new(),
            internal_dependencies: Vec::new(),
            plugin_files: Vec::new(),
            uobject_modules: Vec::new(),
            uobject_module_headers: HashSet::new(),
            config_value_tracker: ConfigValueTracker::new(),
            pre_build_scripts: Vec::new(),
            additional_arguments: Vec::new(),
            environment_variables: HashMap::new(),
            diagnostics: Vec::new(),
            external_metadata: "meta-v1".into(),
            b_deploy_after_compile: false,
            b_has_project_script_plugin: false,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let makefile = minimal_makefile(&mut paths, dir.path());
        let path = dir.path().join("Makefile.bin");
        makefile.save(&paths, &path).unwrap();

        let tool = dir.path().join("buildctl");
        std::fs::write(&tool, "").unwrap();
        let descriptor = dir.path().join("Target.target.cs");
        std::fs::write(&descriptor, "").unwrap();
        let build_version = dir.path().join("Build.version");
        std::fs::write(&build_version, "").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        // Makefile must be newer than the tool/descriptor/build-version file for the round
        // trip to succeed — simulate that by writing the makefile after them, which the
        // sequence above already does.
        let ctx = LoadContext {
            project_descriptor_path: &descriptor,
            generated_project_files_stamp: None,
            build_tool_binary: &tool,
            build_version_file: &build_version,
            xml_config_inputs: &[],
            additional_arguments: &[],
            external_metadata: "meta-v1".into(),
        };
        let mut reload_paths = Paths::new();
        let loaded = Makefile::load(&mut reload_paths, &path, &ctx, |_| vec![]).unwrap().unwrap();
        assert_eq!(loaded.create_time_utc, makefile.create_time_utc);
        assert_eq!(loaded.external_metadata, makefile.external_metadata);
        assert_eq!(loaded.actions.len(), 1);
    }

    #[test]
    fn load_refuses_on_additional_arguments_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let makefile = minimal_makefile(&mut paths, dir.path());
        let path = dir.path().join("Makefile.bin");
        makefile.save(&paths, &path).unwrap();

        let tool = dir.path().join("buildctl");
        std::fs::write(&tool, "").unwrap();
        let descriptor = dir.path().join("Target.target.cs");
        std::fs::write(&descriptor, "").unwrap();

        let ctx = LoadContext {
            project_descriptor_path: &descriptor,
            generated_project_files_stamp: None,
            build_tool_binary: &tool,
            build_version_file: Path::new("/does/not/exist-build-version"),
            xml_config_inputs: &[],
            additional_arguments: &["-Foo".to_string()],
            external_metadata: "meta-v1".into(),
        };
        let mut reload_paths = Paths::new();
        let result = Makefile::load(&mut reload_paths, &path, &ctx, |_| vec![]).unwrap();
        assert_eq!(result.unwrap_err(), ReasonNotLoaded::AdditionalArgumentsChanged);
    }

    #[test]
    fn load_missing_file_is_do_not_load_not_a_fatal_error() {
        let mut paths = Paths::new();
        let ctx = LoadContext {
            project_descriptor_path: Path::new("Target.target.cs"),
            generated_project_files_stamp: None,
            build_tool_binary: Path::new("buildctl"),
            build_version_file: Path::new("/does/not/exist-build-version"),
            xml_config_inputs: &[],
            additional_arguments: &[],
            external_metadata: String::new(),
        };
        let result = Makefile::load(&mut paths, "/does/not/exist.bin", &ctx, |_| vec![]).unwrap();
        assert_eq!(result.unwrap_err(), ReasonNotLoaded::DoesNotExist);
    }

    #[test]
    fn is_valid_for_source_files_detects_added_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), "").unwrap();
        let mut paths = Paths::new();
        let mut makefile = minimal_makefile(&mut paths, dir.path());
        let source_dir = paths.intern_dir(dir.path());
        let a = paths.intern_file(dir.path().join("a.cpp"));
        makefile.source_directories.insert(source_dir);
        makefile.directory_to_source_files.insert(source_dir, vec![a]);
        makefile.create_time_utc = 0;

        let result =
            makefile.is_valid_for_source_files(
                &mut paths,
                |_, _| HashSet::new(),
                &HashSet::new(),
                &HashSet::new(),
                false,
            );
        assert!(result.is_ok());

        std::fs::write(dir.path().join("b.cpp"), "").unwrap();
        let result =
            makefile.is_valid_for_source_files(
                &mut paths,
                |_, _| HashSet::new(),
                &HashSet::new(),
                &HashSet::new(),
                false,
            );
        assert!(matches!(result, Err(ReasonNotLoaded::SourceFileAdded(_))));
    }

    #[test]
    fn is_valid_for_source_files_detects_new_plugin_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let makefile = minimal_makefile(&mut paths, dir.path());
        let plugin = paths.intern_file(dir.path().join("Foo.plugin"));

        let result = makefile.is_valid_for_source_files(
            &mut paths,
            |_, _| HashSet::new(),
            &[plugin].into_iter().collect(),
            &HashSet::new(),
            false,
        );
        assert!(matches!(result, Err(ReasonNotLoaded::PluginFileAdded(_))));
    }

    #[test]
    fn is_valid_for_source_files_detects_working_set_boundary_crossing() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let mut makefile = minimal_makefile(&mut paths, dir.path());
        let a = paths.intern_file(dir.path().join("a.cpp"));
        makefile.working_set.insert(a);

        // `a` dropped out of the live working set since the makefile was built.
        let result =
            makefile.is_valid_for_source_files(
                &mut paths,
                |_, _| HashSet::new(),
                &HashSet::new(),
                &HashSet::new(),
                false,
            );
        assert!(matches!(result, Err(ReasonNotLoaded::WorkingSetMembershipChanged(_))));

        // Still a member: valid.
        let result = makefile.is_valid_for_source_files(
            &mut paths,
            |_, _| HashSet::new(),
            &HashSet::new(),
            &[a].into_iter().collect(),
            false,
        );
        assert!(result.is_ok());
    }

    struct FakeRules {
        dir: PathBuf,
    }

    impl TargetRules for FakeRules {
        fn project_descriptor_path(&self) -> PathBuf {
            self.dir.join("Target.target.cs")
        }
        fn pre_build_scripts(&self) -> &[String] {
            &[]
        }
        fn additional_arguments(&self) -> &[String] {
            &[]
        }
        fn assemble(
            &self,
            paths: &mut Paths,
            _working_set: &HashSet<FileId>,
        ) -> Result<AssembledTarget, BuildError> {
            let source_dir = paths.intern_dir(&self.dir);
            let a = paths.intern_file(self.dir.join("a.cpp"));
            let exe = paths.intern_file(self.dir.join("app.exe"));
            let cc = paths.intern_file(self.dir.join("cc"));
            let mut compile = Action::new(crate::action::ActionType::Compile, source_dir, cc, "-c a.cpp -o a.o");
            compile.prerequisite_items.push(a);
            let object = paths.intern_file(self.dir.join("a.o"));
            compile.produced_items.push(object);

            Ok(AssembledTarget {
                target_type: TargetType::Executable,
                executable_file: exe,
                receipt_file: paths.intern_file(self.dir.join("app.target")),
                project_intermediate_directory: source_dir,
                actions: vec![compile],
                output_items: vec![object],
                module_name_to_output_items: HashMap::new(),
                hot_reload_module_names: HashSet::new(),
                source_directories: [source_dir].into_iter().collect(),
                external_dependencies: Vec::new(),
                internal_dependencies: Vec::new(),
                plugin_files: Vec::new(),
                uobject_modules: Vec::new(),
                uobject_module_headers: HashSet::new(),
                config_reads: Vec::new(),
                candidates_for_working_set: HashSet::new(),
                environment_variables: HashMap::new(),
                external_metadata: "meta-v1".into(),
                b_deploy_after_compile: false,
                b_has_project_script_plugin: false,
            })
        }
    }

    #[test]
    fn generate_snapshots_source_directory_and_builds_actions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), "").unwrap();
        let mut paths = Paths::new();
        let rules = FakeRules { dir: dir.path().to_path_buf() };

        let makefile = Makefile::generate(&mut paths, &rules, &HashSet::new()).unwrap();
        assert_eq!(makefile.actions.len(), 1);
        assert_eq!(makefile.output_items.len(), 1);
        let source_dir = *makefile.source_directories.iter().next().unwrap();
        assert_eq!(makefile.directory_to_source_files.get(&source_dir).unwrap().len(), 1);
        assert_eq!(makefile.create_time_utc, makefile.modified_time_utc);
    }
}
