//! Process-wide orchestrator settings, assembled from CLI flags and environment fallbacks
//! and threaded explicitly through the pipeline (no global mutable state).
//!
//! Distinct from [`crate::caches::ConfigValueTracker`]: that tracker is a *persisted* cache
//! the core itself writes into the makefile to detect config-value drift across reloads.
//! `BuildConfig` is supplied fresh on every invocation and is only ever compared against a
//! loaded makefile's `additional_arguments` — it is never written to disk itself.

use std::path::PathBuf;

/// Settings for one orchestrator invocation, covering the CLI surface of spec §6.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// `-MaxParallelActions`-style override; `None` falls back to CPU-count detection.
    pub jobs: Option<usize>,
    pub stop_on_error: bool,
    pub ignore_outdated_import_libs: bool,

    /// `-SkipBuild`: compute the makefile and the to-execute set, but do not run the
    /// executor. Useful for CI steps that only want to know whether a build is needed.
    pub skip_build: bool,
    /// `-XGEExport`: force the distributed executor even if a local run would suffice,
    /// exporting the task XML without waiting on a coordinator result.
    pub xge_export: bool,
    /// `-NoEngineChanges`: fail fast if any to-execute action would write under
    /// `engine_directory`.
    pub no_engine_changes: bool,
    /// `-WriteOutdatedActions=<path>`: dump the computed to-execute subset as JSON for
    /// diagnostics, independent of whether the build actually runs.
    pub write_outdated_actions: Option<PathBuf>,
    /// `-IgnoreJunk`: tolerate source directories containing files the descriptor
    /// collaborator doesn't recognize, rather than treating every enumerated file as a
    /// potential "source file added" invalidation.
    pub ignore_junk: bool,
    /// `-LogSuffix=<s>`: appended to the log file name the CLI's tracing subscriber writes.
    pub log_suffix: Option<String>,
    /// `-NoLog`: suppress file logging; console output through `tracing` continues.
    pub no_log: bool,

    /// Root directory under which `-NoEngineChanges` forbids produced-item writes.
    pub engine_directory: Option<PathBuf>,

    /// Additional arguments that become part of a makefile's persisted
    /// `additional_arguments`, compared verbatim on reload.
    pub additional_arguments: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            stop_on_error: false,
            ignore_outdated_import_libs: false,
            skip_build: false,
            xge_export: false,
            no_engine_changes: false,
            write_outdated_actions: None,
            ignore_junk: false,
            log_suffix: None,
            no_log: false,
            engine_directory: None,
            additional_arguments: Vec::new(),
        }
    }
}
