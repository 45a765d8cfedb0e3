//! Top-level build-mode driver: ties the makefile lifecycle, action graph, caches and
//! executors together into the single entry point the CLI (and any other embedder) calls.
//!
//! Everything this module touches is a public contract of some other module already;
//! `Orchestrator` owns no algorithm of its own beyond sequencing calls into `makefile`,
//! `graph`, `executor` and `caches` in the order spec.md §4 describes, plus the CLI-surface
//! checks (`-NoEngineChanges`, `-WriteOutdatedActions`, `-SkipBuild`) that don't belong in
//! any one of those modules individually.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::action::Action;
use crate::caches::config_tracker::ConfigValueKey;
use crate::caches::{CachePaths, Caches};
use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::executor::{DistributedConfig, ExecutionResult, Executor, LocalConfig};
use crate::graph::{self, ActionGraph};
use crate::hotreload;
use crate::makefile::{LoadContext, Makefile, ReasonNotLoaded, TargetRules};
use crate::paths::{DirId, FileId, Paths};
use tracing::debug;

/// Everything needed to load-or-regenerate and validate one target's makefile. Borrowed for
/// the duration of a single [`Orchestrator::plan_target`] call.
pub struct TargetRequest<'a> {
    pub rules: &'a dyn TargetRules,
    pub makefile_path: PathBuf,
    pub working_set: HashSet<FileId>,
    pub current_plugin_files: HashSet<FileId>,
    pub reflection_headers_now: &'a dyn Fn(&mut Paths, DirId) -> HashSet<FileId>,
    pub current_config: &'a mut dyn FnMut(&ConfigValueKey) -> Vec<String>,
    pub generated_project_files_stamp: Option<PathBuf>,
    pub build_tool_binary: PathBuf,
    /// The default build-version file (e.g. the engine's `Build.version`); see
    /// [`crate::makefile::LoadContext::build_version_file`].
    pub build_version_file: PathBuf,
    /// Every XML config input file that fed makefile generation; see
    /// [`crate::makefile::LoadContext::xml_config_inputs`].
    pub xml_config_inputs: Vec<PathBuf>,
    pub external_metadata: String,
    /// `-IgnoreJunk`: tolerate source directories gaining or losing files the descriptor
    /// collaborator doesn't recognize, without treating it as a reason to regenerate.
    pub ignore_junk: bool,
}

/// Result of loading or regenerating one target's makefile, before linking.
pub struct PlannedTarget {
    pub makefile: Makefile,
    /// `Some` if the on-disk makefile was rejected and regenerated; carried through for
    /// `-WriteOutdatedActions`-style diagnostics.
    pub reason_regenerated: Option<ReasonNotLoaded>,
}

/// Outcome of running one or more targets through the full pipeline.
pub struct BuildOutcome {
    pub to_execute: HashSet<usize>,
    pub execution: Option<ExecutionResult>,
}

/// Owns the process-wide path arena and the four persistent caches; everything else (the
/// action graph, the makefile, the executor choice) is constructed fresh per call rather
/// than held as orchestrator state, so nothing here prevents building several targets with
/// independent lifetimes in the same process.
pub struct Orchestrator {
    pub paths: Paths,
    pub caches: Caches,
    cache_paths: CachePaths,
}

impl Orchestrator {
    pub fn new(intermediate_dir: impl AsRef<Path>) -> Self {
        let cache_paths = CachePaths::under(intermediate_dir);
        let caches = Caches::load_all(&cache_paths);
        Self { paths: Paths::new(), caches, cache_paths }
    }

    /// Loads the target's on-disk makefile and revalidates it against the live source tree;
    /// regenerates from scratch if it was never written, is stale by any of the checks in
    /// spec.md §4.2, or the source tree has moved out from under it since.
    pub fn plan_target(&mut self, req: &mut TargetRequest<'_>) -> Result<PlannedTarget> {
        let project_descriptor_path = req.rules.project_descriptor_path();
        let xml_config_inputs: Vec<&Path> = req.xml_config_inputs.iter().map(|p| p.as_path()).collect();
        let load_ctx = LoadContext {
            project_descriptor_path: &project_descriptor_path,
            generated_project_files_stamp: req.generated_project_files_stamp.as_deref(),
            build_tool_binary: &req.build_tool_binary,
            build_version_file: &req.build_version_file,
            xml_config_inputs: &xml_config_inputs,
            additional_arguments: req.rules.additional_arguments(),
            external_metadata: req.external_metadata.clone(),
        };

        let loaded = Makefile::load(&mut self.paths, &req.makefile_path, &load_ctx, &mut *req.current_config)?;

        let (makefile, reason) = match loaded {
            Ok(makefile) => {
                match makefile.is_valid_for_source_files(
                    &mut self.paths,
                    req.reflection_headers_now,
                    &req.current_plugin_files,
                    &req.working_set,
                    req.ignore_junk,
                ) {
                    Ok(()) => (makefile, None),
                    Err(reason) => {
                        debug!(?reason, path = %req.makefile_path.display(), "makefile stale against source tree, regenerating");
                        let fresh = Makefile::generate(&mut self.paths, req.rules, &req.working_set)?;
                        (fresh, Some(reason))
                    }
                }
            }
            Err(reason) => {
                debug!(?reason, path = %req.makefile_path.display(), "makefile not reused, regenerating");
                let fresh = Makefile::generate(&mut self.paths, req.rules, &req.working_set)?;
                (fresh, Some(reason))
            }
        };

        Ok(PlannedTarget { makefile, reason_regenerated: reason })
    }

    /// Links one or more planned targets into a single action graph, computes the subset
    /// that is out of date, and (unless `config.skip_build` is set) runs it through the
    /// chosen executor. Saves every target's makefile and the shared caches before
    /// returning, win or lose, so a failed build still records whatever actions completed.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &mut self,
        targets: Vec<(Makefile, PathBuf)>,
        config: &BuildConfig,
        distributed: Option<DistributedConfig>,
    ) -> Result<BuildOutcome> {
        let mut roots: Vec<FileId> = Vec::new();
        let mut graphs = Vec::new();
        for (makefile, _) in &targets {
            roots.extend(makefile.output_items.iter().copied());
        }

        for (makefile, _) in &targets {
            let actions: Vec<Action> = makefile.actions.clone();
            graphs.push(ActionGraph::link(actions, &self.paths)?);
        }
        let merged = if graphs.len() == 1 {
            graphs.into_iter().next().unwrap()
        } else {
            graph::merge_graphs(graphs, &self.paths)?
        };

        let to_execute = merged.get_actions_to_execute(
            &self.paths,
            &roots,
            &self.caches.dependency,
            &self.caches.history,
            config.ignore_outdated_import_libs,
        )?;

        if config.no_engine_changes {
            if let Some(engine_dir) = &config.engine_directory {
                for &index in &to_execute {
                    for &produced in &merged.actions[index].produced_items {
                        if self.paths.file_path(produced).starts_with(engine_dir) {
                            return Err(BuildError::EngineReadOnlyViolation(
                                self.paths.file_path(produced).to_path_buf(),
                            ));
                        }
                    }
                }
            }
        }

        if let Some(dump_path) = &config.write_outdated_actions {
            graph::export_json_subset(&merged, &self.paths, &to_execute, dump_path)?;
        }

        for (makefile, path) in &targets {
            makefile.save(&self.paths, path)?;
        }

        if config.skip_build {
            self.caches.save_all(&self.cache_paths)?;
            return Ok(BuildOutcome { to_execute, execution: None });
        }

        merged.delete_outdated_produced_items(&self.paths, &to_execute)?;
        merged.create_directories_for_produced_items(&self.paths, &to_execute)?;

        let executor = match (config.xge_export, distributed) {
            (true, Some(cfg)) => Executor::Distributed(cfg),
            _ => {
                let parallelism = crate::executor::local::resolve_parallelism(None, config.jobs);
                Executor::Local(LocalConfig { parallelism, stop_on_error: config.stop_on_error })
            }
        };

        let result = executor.execute(&merged, &self.paths, &to_execute)?;

        for &index in &result.executed {
            let action = &merged.actions[index];
            let hash = crate::caches::history::command_hash(&action.command_arguments);
            for &produced in &action.produced_items {
                self.caches.history.record(self.paths.file_path(produced).to_path_buf(), hash.clone());
            }
        }

        self.caches.save_all(&self.cache_paths)?;

        if !result.success() {
            let first = result.failed[0];
            return Err(BuildError::ActionFailed { count: result.failed.len(), first, status: 1 });
        }

        Ok(BuildOutcome { to_execute, execution: Some(result) })
    }

    /// Applies suffix-mode hot reload to an already-linked graph before execution, per
    /// spec.md §4.5. Callers that want live-coding instead use [`hotreload::apply_live_coding`]
    /// directly against the graph they build from a `Makefile`'s actions; the two modes are
    /// mutually exclusive and this crate does not arbitrate which one a caller picks.
    pub fn apply_hot_reload(
        &mut self,
        graph: &mut ActionGraph,
        state: &mut hotreload::HotReloadState,
        module_name_to_output_items: &std::collections::HashMap<String, Vec<FileId>>,
        modules_to_reload: &HashSet<String>,
    ) -> Result<std::collections::HashMap<FileId, FileId>> {
        hotreload::apply_suffix_reload(&mut self.paths, graph, state, module_name_to_output_items, modules_to_reload)
    }
}
