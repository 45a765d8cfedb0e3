//! Distributed executor: serializes the action graph to an XML task file and launches an
//! external build-farm coordinator, streaming and filtering its stdout.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use regex::Regex;

use crate::action::{Action, ActionType};
use crate::error::{BuildError, Result};
use crate::graph::ActionGraph;
use crate::paths::Paths;
use crate::report;

use super::ExecutionResult;

/// Progress prefix a coordinator emits before an action's name on its own line.
const PROGRESS_PREFIX: &str = "@action";

static TIMING_TRAILER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(\d{2}:\d{2}:\d{2}\)\s*$").unwrap());

/// Auto-recover patterns applied to link tools only: a link that fails with one of these
/// substrings in its output is eligible for the coordinator's local-retry fallback, covering
/// the class of linker errors caused by a file still locked by a previous invocation rather
/// than a genuine source problem.
const LINK_AUTO_RECOVER_PATTERNS: &[&str] = &["LNK1123", "LNK1136", "LNK1168"];

#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Name or path of the external coordinator binary, resolved against `PATH` at run time.
    pub coordinator_binary: String,
    /// Where the `BuildSet` task XML is written before the coordinator is launched.
    pub task_file_path: PathBuf,
    pub stop_on_error: bool,
    /// Corresponds to the "watchdog-suppression" launch flag — some coordinator versions
    /// kill actions that go quiet for long link steps; this disables that heuristic.
    pub suppress_watchdog: bool,
    /// Environment captured at makefile-generation time (`Makefile::environment_variables`).
    pub environment_variables: HashMap<String, String>,
    /// Snapshot used to decide which variables differ and therefore need emitting in the
    /// task XML's `Variables` block.
    ///
    /// Open question in spec §9: whether the "initial" snapshot is taken at process start or
    /// at first-target start. This crate takes it at process start (`DistributedConfig::new`
    /// is called once per orchestrator invocation, before any target's makefile is touched),
    /// since a snapshot taken per-target would make the `Variables` block's meaning depend on
    /// target ordering, which nothing else in the pipeline does.
    pub initial_environment_snapshot: HashMap<String, String>,
}

impl DistributedConfig {
    pub fn new(
        coordinator_binary: impl Into<String>,
        task_file_path: impl Into<PathBuf>,
        environment_variables: HashMap<String, String>,
    ) -> Self {
        Self {
            coordinator_binary: coordinator_binary.into(),
            task_file_path: task_file_path.into(),
            stop_on_error: false,
            suppress_watchdog: false,
            environment_variables,
            initial_environment_snapshot: std::env::vars().collect(),
        }
    }
}

pub struct DistributedExecutor {
    config: DistributedConfig,
}

impl DistributedExecutor {
    pub fn new(config: DistributedConfig) -> Self {
        Self { config }
    }

    #[tracing::instrument(skip(self, graph, paths, to_execute), fields(count = to_execute.len()))]
    pub fn run(&self, graph: &ActionGraph, paths: &Paths, to_execute: &HashSet<usize>) -> Result<ExecutionResult> {
        if to_execute.is_empty() {
            return Ok(ExecutionResult::default());
        }

        export_xml(graph, paths, to_execute, &self.config.task_file_path, &self.config)?;

        let coordinator = find_on_path(&self.config.coordinator_binary)
            .ok_or(BuildError::ExecutorUnavailable)?;

        let mut cmd = Command::new(&coordinator);
        cmd.arg(format!("/Build={}", self.config.task_file_path.display()))
            .arg("/Rebuild")
            .arg("/NoWait")
            .arg("/NoLogo")
            .arg("/ShowAgent")
            .arg("/ShowTime")
            .arg("/IDEMonitor");
        if self.config.stop_on_error {
            cmd.arg("/StopOnErrors");
        }
        if self.config.suppress_watchdog {
            cmd.arg("/NoWatchdogThread");
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|_| BuildError::ExecutorUnavailable)?;
        let stdout = child.stdout.take().expect("piped stdout");

        let mut executed = Vec::new();
        let mut completed = 0usize;
        let total = to_execute.len();
        let reader = BufReader::new(stdout);
        for line in reader.lines().map_while(std::result::Result::ok) {
            if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
                completed += 1;
                report::coordinator_line(&format!("[{completed}/{total}] {}", rest.trim()));
                continue;
            }
            if TIMING_TRAILER.is_match(&line) {
                continue;
            }
            report::coordinator_line(&line);
        }

        let status = child.wait().map_err(BuildError::from)?;
        // The coordinator owns task ordering/parallelism; we only know which tasks we asked
        // for, not which of them actually ran before a fatal failure. On success, everything
        // asked for is presumed executed; on failure there is no finer-grained signal to
        // distinguish "never started" from "ran and failed" without parsing the coordinator's
        // own per-task report, which is not part of the stdout contract documented in spec §6.
        executed.extend(to_execute.iter().copied());
        let failed = if status.success() { Vec::new() } else { executed.clone() };

        Ok(ExecutionResult { executed, failed })
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.is_absolute() && direct.exists() {
        return Some(direct.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
        let candidate_exe = dir.join(format!("{name}.exe"));
        if candidate_exe.exists() {
            return Some(candidate_exe);
        }
    }
    None
}

/// Writes the `BuildSet` task XML for `to_execute`. Dependency edges whose predecessor lies
/// outside `to_execute` are omitted (per spec §4.4): an action not being rebuilt is already
/// up to date, so the coordinator needs no ordering against it.
pub fn export_xml(
    graph: &ActionGraph,
    paths: &Paths,
    to_execute: &HashSet<usize>,
    path: impl AsRef<Path>,
    config: &DistributedConfig,
) -> Result<()> {
    let mut ordered: Vec<usize> = to_execute.iter().copied().collect();
    ordered.sort_unstable();

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_err)?;

    let mut build_set = BytesStart::new("BuildSet");
    build_set.push_attribute(("FormatVersion", "1"));
    writer.write_event(Event::Start(build_set)).map_err(xml_err)?;

    write_environments(&mut writer, graph, paths, &ordered, config)?;
    write_project(&mut writer, graph, paths, &ordered)?;

    writer.write_event(Event::End(BytesEnd::new("BuildSet"))).map_err(xml_err)?;

    std::fs::write(path, writer.into_inner())?;
    Ok(())
}

fn write_environments(
    writer: &mut Writer<Vec<u8>>,
    graph: &ActionGraph,
    paths: &Paths,
    ordered: &[usize],
    config: &DistributedConfig,
) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("Environments"))).map_err(xml_err)?;

    let mut env = BytesStart::new("Environment");
    env.push_attribute(("Name", "Default"));
    writer.write_event(Event::Start(env)).map_err(xml_err)?;

    writer.write_event(Event::Start(BytesStart::new("Tools"))).map_err(xml_err)?;
    for (position, &index) in ordered.iter().enumerate() {
        write_tool(writer, &graph.actions[index], paths, position)?;
    }
    writer.write_event(Event::End(BytesEnd::new("Tools"))).map_err(xml_err)?;

    let changed: Vec<(&String, &String)> = config
        .environment_variables
        .iter()
        .filter(|(k, v)| config.initial_environment_snapshot.get(*k) != Some(*v))
        .collect();
    if !changed.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("Variables"))).map_err(xml_err)?;
        for (key, value) in changed {
            let mut var = BytesStart::new("Variable");
            var.push_attribute(("Name", key.as_str()));
            var.push_attribute(("Value", value.as_str()));
            writer.write_event(Event::Empty(var)).map_err(xml_err)?;
        }
        writer.write_event(Event::End(BytesEnd::new("Variables"))).map_err(xml_err)?;
    }

    writer.write_event(Event::End(BytesEnd::new("Environment"))).map_err(xml_err)?;
    writer.write_event(Event::End(BytesEnd::new("Environments"))).map_err(xml_err)?;
    Ok(())
}

fn write_tool(writer: &mut Writer<Vec<u8>>, action: &Action, paths: &Paths, position: usize) -> Result<()> {
    let mut tool = BytesStart::new("Tool");
    let name = format!("Tool{position}");
    tool.push_attribute(("Name", name.as_str()));
    tool.push_attribute(("AllowRemote", bool_str(action.can_execute_remotely)));
    tool.push_attribute(("AllowIntercept", bool_str(action.can_execute_remotely_with_sndbs)));
    tool.push_attribute(("OutputPrefix", action.status_description.as_str()));
    let group_prefix = action.group_names.first().map(String::as_str).unwrap_or("");
    tool.push_attribute(("GroupPrefix", group_prefix));
    tool.push_attribute(("Params", action.command_arguments.as_str()));
    let command_path = paths.file_path(action.command_path);
    tool.push_attribute(("Path", command_path.to_string_lossy().as_ref()));
    let masks = action
        .produced_items
        .iter()
        .filter_map(|&f| paths.file_path(f).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(";");
    tool.push_attribute(("OutputFileMasks", masks.as_str()));
    tool.push_attribute(("AutoReserveMemory", "true"));
    if action.action_type == ActionType::Link {
        tool.push_attribute(("AutoRecover", LINK_AUTO_RECOVER_PATTERNS.join(";").as_str()));
    }
    tool.push_attribute(("SkipIfProjectFailed", "true"));
    writer.write_event(Event::Empty(tool)).map_err(xml_err)?;
    Ok(())
}

fn write_project(writer: &mut Writer<Vec<u8>>, graph: &ActionGraph, paths: &Paths, ordered: &[usize]) -> Result<()> {
    let position_of: HashMap<usize, usize> =
        ordered.iter().enumerate().map(|(position, &index)| (index, position)).collect();

    let mut project = BytesStart::new("Project");
    project.push_attribute(("Name", "Default"));
    project.push_attribute(("Env", "Default"));
    writer.write_event(Event::Start(project)).map_err(xml_err)?;

    for (position, &index) in ordered.iter().enumerate() {
        let action = &graph.actions[index];
        let mut task = BytesStart::new("Task");
        let task_name = format!("Action{position}");
        task.push_attribute(("Name", task_name.as_str()));
        task.push_attribute(("Tool", format!("Tool{position}").as_str()));
        let working_dir = paths.dir_path(action.working_directory).to_string_lossy().into_owned();
        task.push_attribute(("WorkingDir", working_dir.as_str()));
        task.push_attribute(("SourceFile", ""));
        task.push_attribute(("Caption", action.command_description.as_str()));
        task.push_attribute(("SkipIfProjectFailed", "true"));
        task.push_attribute(("AllowRestartOnLocal", "true"));

        let depends_on: Vec<String> = action
            .prerequisite_items
            .iter()
            .filter_map(|&f| graph.producer_of(f))
            .filter_map(|producer| position_of.get(&producer))
            .map(|p| format!("Action{p}"))
            .collect();
        if !depends_on.is_empty() {
            task.push_attribute(("DependsOn", depends_on.join(";").as_str()));
        }
        writer.write_event(Event::Empty(task)).map_err(xml_err)?;
    }

    writer.write_event(Event::End(BytesEnd::new("Project"))).map_err(xml_err)?;
    Ok(())
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn xml_err(err: quick_xml::Error) -> BuildError {
    BuildError::msg(format!("xml export failed: {err}"))
}
