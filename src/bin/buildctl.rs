//! CLI entry point. Reads an already-assembled build plan (the output of the external
//! descriptor/toolchain collaborator this crate doesn't own) as JSON, and drives one
//! `Orchestrator` invocation over it.
//!
//! The teacher crate ships no binary of its own; this CLI's flag surface is grounded on
//! `cdecompilador-amargo`'s `clap`-based command-line tool, adapted to the derive API.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{error, info, warn};

use buildctl::caches::config_tracker::ConfigValueKey;
use buildctl::executor::DistributedConfig;
use buildctl::makefile::{AssembledTarget, TargetRules, TargetType};
use buildctl::orchestrator::{Orchestrator, TargetRequest};
use buildctl::paths::{DirId, FileId, Paths};
use buildctl::{BuildConfig, BuildError};

/// Incremental build orchestrator for a single finalized target plan.
#[derive(Parser, Debug)]
#[command(name = "buildctl", version, about)]
struct Cli {
    /// Path to a JSON file describing the finalized action plan for one target.
    plan: PathBuf,

    /// Where to read/write the persisted makefile. Defaults to `<plan-dir>/Makefile.cache`.
    #[arg(long)]
    makefile: Option<PathBuf>,

    /// `-MaxParallelActions`: cap local executor parallelism.
    #[arg(long = "jobs", short = 'j')]
    jobs: Option<usize>,

    /// Compute the to-execute set but do not run the executor.
    #[arg(long = "skip-build")]
    skip_build: bool,

    /// Force the distributed executor and export the task XML.
    #[arg(long = "xge-export")]
    xge_export: bool,

    /// Name or path of the distributed build coordinator binary, used with `--xge-export`.
    #[arg(long = "coordinator", requires = "xge_export")]
    coordinator: Option<String>,

    /// Fail if any to-execute action would write under `--engine-directory`.
    #[arg(long = "no-engine-changes")]
    no_engine_changes: bool,

    /// Root directory `--no-engine-changes` forbids produced-item writes under.
    #[arg(long = "engine-directory")]
    engine_directory: Option<PathBuf>,

    /// Dump the computed to-execute subset as JSON to this path.
    #[arg(long = "write-outdated-actions")]
    write_outdated_actions: Option<PathBuf>,

    /// Tolerate source directories gaining/losing files the plan doesn't list.
    #[arg(long = "ignore-junk")]
    ignore_junk: bool,

    /// Stop launching new actions after the first failure.
    #[arg(long = "stop-on-error")]
    stop_on_error: bool,

    /// Tolerate import-library mtime churn when deciding link-step outdatedness.
    #[arg(long = "ignore-outdated-import-libs")]
    ignore_outdated_import_libs: bool,

    /// Appended to the log file name. Implies file logging unless `--no-log` is also set.
    #[arg(long = "log-suffix")]
    log_suffix: Option<String>,

    /// Suppress file logging; console output through `tracing` continues regardless.
    #[arg(long = "no-log")]
    no_log: bool,

    /// The default build-version file (e.g. the engine's `Build.version`); a makefile newer
    /// than this is refused and regenerated. Defaults to `<plan-dir>/Build.version`.
    #[arg(long = "build-version-file")]
    build_version_file: Option<PathBuf>,

    /// An XML config input file that fed plan generation (repeatable); a makefile newer than
    /// any of these is refused and regenerated.
    #[arg(long = "xml-config")]
    xml_config: Vec<PathBuf>,
}

/// On-disk shape of one action in a plan file: same fields as [`buildctl::action::Action`]
/// but with plain paths instead of interned handles, since a plan file is authored (or
/// generated) outside any live `Paths` arena.
#[derive(serde::Deserialize)]
struct PlanAction {
    action_type: buildctl::action::ActionType,
    working_directory: PathBuf,
    command_path: PathBuf,
    command_arguments: String,
    #[serde(default)]
    prerequisite_items: Vec<PathBuf>,
    #[serde(default)]
    produced_items: Vec<PathBuf>,
    #[serde(default)]
    delete_items: Vec<PathBuf>,
    #[serde(default)]
    status_description: String,
    #[serde(default)]
    command_description: String,
    #[serde(default)]
    can_execute_remotely: bool,
    #[serde(default)]
    produces_import_library: bool,
}

#[derive(serde::Deserialize)]
struct Plan {
    target_type: TargetType,
    executable_file: PathBuf,
    source_directories: Vec<PathBuf>,
    actions: Vec<PlanAction>,
    output_items: Vec<PathBuf>,
    #[serde(default)]
    working_set: Vec<PathBuf>,
    #[serde(default)]
    additional_arguments: Vec<String>,
    #[serde(default)]
    pre_build_scripts: Vec<String>,
    #[serde(default)]
    environment_variables: HashMap<String, String>,
}

/// Adapts a parsed [`Plan`] to [`TargetRules`] by interning every path it names into the
/// orchestrator's live arena on first use.
struct PlanRules {
    descriptor_path: PathBuf,
    plan: Plan,
}

impl TargetRules for PlanRules {
    fn project_descriptor_path(&self) -> PathBuf {
        self.descriptor_path.clone()
    }

    fn pre_build_scripts(&self) -> &[String] {
        &self.plan.pre_build_scripts
    }

    fn additional_arguments(&self) -> &[String] {
        &self.plan.additional_arguments
    }

    fn assemble(
        &self,
        paths: &mut Paths,
        _working_set: &HashSet<FileId>,
    ) -> buildctl::Result<AssembledTarget> {
        let source_directories: HashSet<DirId> =
            self.plan.source_directories.iter().map(|p| paths.intern_dir(p)).collect();

        let actions = self
            .plan
            .actions
            .iter()
            .map(|a| {
                let mut action = buildctl::action::Action::new(
                    a.action_type,
                    paths.intern_dir(&a.working_directory),
                    paths.intern_file(&a.command_path),
                    a.command_arguments.clone(),
                );
                action.prerequisite_items = a.prerequisite_items.iter().map(|p| paths.intern_file(p)).collect();
                action.produced_items = a.produced_items.iter().map(|p| paths.intern_file(p)).collect();
                action.delete_items = a.delete_items.iter().map(|p| paths.intern_file(p)).collect();
                action.status_description = a.status_description.clone();
                action.command_description = a.command_description.clone();
                action.can_execute_remotely = a.can_execute_remotely;
                action.produces_import_library = a.produces_import_library;
                action
            })
            .collect();

        let output_items = self.plan.output_items.iter().map(|p| paths.intern_file(p)).collect();
        let executable_file = paths.intern_file(&self.plan.executable_file);
        let project_intermediate_directory = source_directories
            .iter()
            .next()
            .copied()
            .unwrap_or_else(|| paths.intern_dir(self.descriptor_path.parent().unwrap_or(Path::new("."))));

        Ok(AssembledTarget {
            target_type: self.plan.target_type,
            executable_file,
            receipt_file: executable_file,
            project_intermediate_directory,
            actions,
            output_items,
            module_name_to_output_items: HashMap::new(),
            hot_reload_module_names: HashSet::new(),
            source_directories,
            external_dependencies: Vec::new(),
            internal_dependencies: Vec::new(),
            plugin_files: Vec::new(),
            uobject_modules: Vec::new(),
            uobject_module_headers: HashSet::new(),
            config_reads: Vec::new(),
            candidates_for_working_set: HashSet::new(),
            environment_variables: self.plan.environment_variables.clone(),
            external_metadata: String::new(),
            b_deploy_after_compile: false,
            b_has_project_script_plugin: false,
        })
    }
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if cli.no_log {
        subscriber.with_writer(std::io::stderr).init();
        return;
    }

    let log_name = match &cli.log_suffix {
        Some(suffix) => format!("buildctl-{suffix}.log"),
        None => "buildctl.log".to_string(),
    };
    match std::fs::File::create(&log_name) {
        Ok(file) => subscriber.with_writer(std::sync::Mutex::new(file)).init(),
        Err(err) => {
            subscriber.with_writer(std::io::stderr).init();
            warn!(%err, path = %log_name, "could not open log file, logging to stderr only");
        }
    }
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(&cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "build failed");
            eprintln!("error: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> buildctl::Result<()> {
    let plan_text = std::fs::read_to_string(&cli.plan).map_err(|err| BuildError::io(err, &cli.plan))?;
    let plan: Plan = serde_json::from_str(&plan_text)?;

    let descriptor_path = cli.plan.clone();
    let makefile_path =
        cli.makefile.clone().unwrap_or_else(|| descriptor_path.with_file_name("Makefile.cache"));
    let intermediate_dir = makefile_path.parent().unwrap_or(Path::new(".")).to_path_buf();

    let mut orchestrator = Orchestrator::new(&intermediate_dir);
    let working_set: HashSet<FileId> = plan.working_set.iter().map(|p| orchestrator.paths.intern_file(p)).collect();

    let rules = PlanRules { descriptor_path: descriptor_path.clone(), plan };

    let mut current_config = |_: &ConfigValueKey| Vec::new();
    let reflection_headers_now = |_: &mut Paths, _: DirId| HashSet::new();
    let mut request = TargetRequest {
        rules: &rules,
        makefile_path: makefile_path.clone(),
        working_set,
        current_plugin_files: HashSet::new(),
        reflection_headers_now: &reflection_headers_now,
        current_config: &mut current_config,
        generated_project_files_stamp: None,
        build_tool_binary: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("buildctl")),
        build_version_file: cli
            .build_version_file
            .clone()
            .unwrap_or_else(|| descriptor_path.with_file_name("Build.version")),
        xml_config_inputs: cli.xml_config.clone(),
        external_metadata: String::new(),
        ignore_junk: cli.ignore_junk,
    };

    let planned = orchestrator.plan_target(&mut request)?;
    if let Some(reason) = &planned.reason_regenerated {
        info!(%reason, "makefile regenerated");
    }

    let config = BuildConfig {
        jobs: cli.jobs,
        stop_on_error: cli.stop_on_error,
        ignore_outdated_import_libs: cli.ignore_outdated_import_libs,
        skip_build: cli.skip_build,
        xge_export: cli.xge_export,
        no_engine_changes: cli.no_engine_changes,
        write_outdated_actions: cli.write_outdated_actions.clone(),
        ignore_junk: cli.ignore_junk,
        log_suffix: cli.log_suffix.clone(),
        no_log: cli.no_log,
        engine_directory: cli.engine_directory.clone(),
        additional_arguments: Vec::new(),
    };

    let distributed = cli.coordinator.as_ref().map(|binary| {
        DistributedConfig::new(binary.clone(), intermediate_dir.join("BuildSet.xml"), HashMap::new())
    });

    let outcome = orchestrator.build(vec![(planned.makefile, makefile_path)], &config, distributed)?;

    info!(to_execute = outcome.to_execute.len(), "build finished");
    Ok(())
}
