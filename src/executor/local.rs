//! Local parallel executor: a dependency-gated ready queue drained by a bounded pool of
//! worker threads, each blocking on one child process at a time.
//!
//! Modeled on the cargo `JobQueue`/`DependencyQueue` pattern (mpsc channel back to one
//! coordinating thread, a `Message` enum for run/stdout/stderr/finish) rather than the
//! teacher crate's flat `rayon::ThreadPoolBuilder::install` usage: that shape fits
//! embarrassingly-parallel work with no cross-item dependency (compiling independent
//! version-sets), which is not what a dependency-gated action graph is.

use std::collections::HashSet;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::action::Action;
use crate::error::{BuildError, Result};
use crate::graph::ActionGraph;
use crate::paths::Paths;
use crate::report;

use super::ExecutionResult;

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// `min(cpu_count * multiplier, max_processor_count, user_override)`, already resolved
    /// by the caller (see [`resolve_parallelism`]).
    pub parallelism: usize,
    pub stop_on_error: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self { parallelism: resolve_parallelism(None, None), stop_on_error: false }
    }
}

/// `P = min(cpu_count * multiplier, max_processor_count, user_override)`, in that priority
/// order: an explicit `-MaxParallelActions`-style override always wins if set; otherwise a
/// process-count cap; otherwise the raw detected CPU count.
pub fn resolve_parallelism(max_processor_count: Option<usize>, user_override: Option<usize>) -> usize {
    if let Some(over) = user_override {
        return over.max(1);
    }
    let cpus = num_cpus::get();
    match max_processor_count {
        Some(cap) => cpus.min(cap).max(1),
        None => cpus.max(1),
    }
}

enum Message {
    Finished { action_index: usize, success: bool, exit_status: i32, log: String },
}

pub struct LocalExecutor {
    config: LocalConfig,
}

impl LocalExecutor {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    /// Runs every action in `to_execute`, respecting dependency order, up to
    /// `config.parallelism` concurrently. Actions outside `to_execute` are assumed already
    /// up to date and are not touched.
    #[tracing::instrument(skip(self, graph, paths, to_execute), fields(count = to_execute.len()))]
    pub fn run(&self, graph: &ActionGraph, paths: &Paths, to_execute: &HashSet<usize>) -> Result<ExecutionResult> {
        let total = to_execute.len();
        if total == 0 {
            return Ok(ExecutionResult::default());
        }

        // missing_dependency_count, restricted to the subset we actually intend to run —
        // a prerequisite action that is *not* in `to_execute` is already up to date, so it
        // must not block readiness.
        let mut missing: Vec<usize> = vec![0; graph.actions.len()];
        for &index in to_execute {
            missing[index] =
                graph.actions[index].prerequisite_items.iter().filter_map(|&f| graph.producer_of(f)).filter(|p| to_execute.contains(p)).count();
        }

        let mut ready: Vec<usize> = to_execute.iter().copied().filter(|&i| missing[i] == 0).collect();
        sort_ready_queue(&mut ready, graph);

        let (tx, rx): (Sender<Message>, Receiver<Message>) = unbounded();
        let in_flight = Arc::new(Mutex::new(0usize));

        let mut executed = Vec::new();
        let mut failed = Vec::new();
        let mut completed_count = 0usize;
        let mut stopped = false;

        loop {
            while !stopped && !ready.is_empty() && *in_flight.lock().unwrap() < self.config.parallelism {
                let index = ready.remove(0);
                *in_flight.lock().unwrap() += 1;
                spawn_worker(index, &graph.actions[index], paths, tx.clone());
            }

            if *in_flight.lock().unwrap() == 0 {
                break;
            }

            match rx.recv() {
                Ok(Message::Finished { action_index, success, exit_status, log }) => {
                    *in_flight.lock().unwrap() -= 1;
                    completed_count += 1;
                    report::action_output(completed_count, total, &log);

                    executed.push(action_index);
                    if success {
                        for &dependant in &graph.actions[action_index].dependants {
                            if !to_execute.contains(&dependant) {
                                continue;
                            }
                            missing[dependant] -= 1;
                            if missing[dependant] == 0 {
                                ready.push(dependant);
                            }
                        }
                        sort_ready_queue(&mut ready, graph);
                    } else {
                        failed.push(action_index);
                        report::action_failed(action_index, exit_status);
                        if self.config.stop_on_error {
                            stopped = true;
                            ready.clear();
                        }
                    }
                }
                Err(_) => break,
            }
        }

        Ok(ExecutionResult { executed, failed })
    }
}

/// Descending by `total_dependant_count`, tie-broken by original index — actions that
/// unblock the most downstream work run first.
fn sort_ready_queue(ready: &mut [usize], graph: &ActionGraph) {
    ready.sort_by(|&a, &b| {
        graph.actions[b]
            .total_dependant_count
            .cmp(&graph.actions[a].total_dependant_count)
            .then(a.cmp(&b))
    });
}

/// Spawns the action's child process on a worker thread and blocks that thread until the
/// child exits, reporting the result back over `tx`.
///
/// Job-object-equivalent lifetime tying (killing descendants if the orchestrator process is
/// itself killed) is not implemented here: it needs a raw handle to the OS job/process-group
/// primitive, which this crate's dependency stack has no crate for (adding one solely for
/// this would mean inventing a dependency the rest of the stack doesn't use). Noted as an
/// open gap in DESIGN.md rather than worked around with a fake abstraction.
fn spawn_worker(index: usize, action: &Action, paths: &Paths, tx: Sender<Message>) {
    let command_path = paths.file_path(action.command_path).to_path_buf();
    let working_directory = paths.dir_path(action.working_directory).to_path_buf();
    let command_arguments = action.command_arguments.clone();
    let status_description = action.status_description.clone();

    thread::Builder::new()
        .name(format!("build-worker-{index}"))
        .spawn(move || {
            report::action_spawn(index, &status_description);
            let mut cmd = Command::new(&command_path);
            cmd.current_dir(&working_directory)
                .args(shell_split(&command_arguments))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            lower_priority(&mut cmd);

            let (success, exit_status, log) = match cmd.spawn().and_then(|child| child.wait_with_output()) {
                Ok(output) => {
                    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
                    log.push_str(&String::from_utf8_lossy(&output.stderr));
                    (output.status.success(), output.status.code().unwrap_or(-1), log)
                }
                Err(err) => (false, -1, format!("failed to run {}: {err}", command_path.display())),
            };

            let _ = tx.send(Message::Finished { action_index: index, success, exit_status, log });
        })
        .expect("spawning a build worker thread");
}

/// Splits a pre-assembled command-line string into argv entries. Actions own a single
/// opaque `command_arguments` string (assembled upstream by the platform-specific flag
/// collaborator out of this crate's scope); this performs only simple whitespace/quote
/// splitting, not full shell parsing, since actions never embed shell operators.
fn shell_split(arguments: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in arguments.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Best-effort below-normal scheduling priority for the spawned child, via the `nice`
/// binary's OS-level equivalent. Left a no-op: lowering priority directly needs a raw
/// syscall crate (`libc`) this stack doesn't otherwise carry, and adding one only for this
/// would mean inventing a dependency rather than learning one from the corpus. Tracked as
/// an open gap in DESIGN.md.
fn lower_priority(_cmd: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::paths::Paths;

    fn echo_action(paths: &mut Paths, dir: &std::path::Path, marker: &str) -> Action {
        let working_directory = paths.intern_dir(dir);
        let command_path = paths.intern_file(which_echo());
        let mut action = Action::new(ActionType::Compile, working_directory, command_path, marker);
        action.produced_items.push(paths.intern_file(dir.join(format!("{marker}.out"))));
        action
    }

    fn which_echo() -> std::path::PathBuf {
        std::path::PathBuf::from(if cfg!(windows) { "cmd" } else { "/bin/echo" })
    }

    #[test]
    fn resolve_parallelism_prefers_user_override() {
        assert_eq!(resolve_parallelism(Some(2), Some(16)), 16);
    }

    #[test]
    fn resolve_parallelism_caps_at_max_processor_count() {
        let cpus = num_cpus::get();
        assert_eq!(resolve_parallelism(Some(1), None), cpus.min(1));
    }

    #[test]
    fn shell_split_handles_quoted_segments() {
        assert_eq!(shell_split(r#"-DFOO="a b" -c"#), vec!["-DFOO=a b", "-c"]);
    }

    #[cfg(unix)]
    #[test]
    fn run_executes_independent_actions_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let a = echo_action(&mut paths, dir.path(), "a");
        let b = echo_action(&mut paths, dir.path(), "b");
        let graph = ActionGraph::link(vec![a, b], &paths).unwrap();

        let executor = LocalExecutor::new(LocalConfig { parallelism: 2, stop_on_error: false });
        let to_execute: HashSet<usize> = [0, 1].into_iter().collect();
        let result = executor.run(&graph, &paths, &to_execute).unwrap();
        assert!(result.success());
        assert_eq!(result.executed.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn stop_on_error_clears_the_ready_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let working_directory = paths.intern_dir(dir.path());
        let command_path = paths.intern_file("/bin/false");
        let mut failing = Action::new(ActionType::Compile, working_directory, command_path, "");
        failing.produced_items.push(paths.intern_file(dir.path().join("fail.out")));
        let graph = ActionGraph::link(vec![failing], &paths).unwrap();

        let executor = LocalExecutor::new(LocalConfig { parallelism: 1, stop_on_error: true });
        let to_execute: HashSet<usize> = [0].into_iter().collect();
        let result = executor.run(&graph, &paths, &to_execute).unwrap();
        assert!(!result.success());
        assert_eq!(result.failed, vec![0]);
    }
}
