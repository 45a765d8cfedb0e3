//! The action graph: linking, conflict/cycle detection, outdatedness propagation,
//! prerequisite gathering, and JSON/XML export.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::action::Action;
use crate::caches::{ActionHistory, CppDependencyCache};
use crate::error::BuildError;
use crate::paths::{FileId, Paths};

/// A linked collection of [`Action`]s. `link` populates the transient `dependants` /
/// `total_dependant_count` / `missing_dependency_count` fields on every action in place.
pub struct ActionGraph {
    pub actions: Vec<Action>,
    /// Maps a produced `FileId` to the index of the action that produces it.
    producer_of: HashMap<FileId, usize>,
}

impl ActionGraph {
    /// Links `actions`, validating there are no duplicate producers and no cycles, and
    /// computing reverse edges (`dependants`) and `total_dependant_count` for every action.
    ///
    /// Idempotent: safe to call again on an already-linked graph — derived fields are reset
    /// before recomputation.
    pub fn link(mut actions: Vec<Action>, paths: &Paths) -> Result<Self, BuildError> {
        let mut producer_of: HashMap<FileId, usize> = HashMap::new();
        for (index, action) in actions.iter().enumerate() {
            for &produced in &action.produced_items {
                if let Some(&other) = producer_of.get(&produced) {
                    return Err(BuildError::DuplicateProducer {
                        path: paths.file_path(produced).to_path_buf(),
                        producer: other,
                        other: index,
                    });
                }
                producer_of.insert(produced, index);
            }
        }

        for action in &mut actions {
            action.dependants.clear();
            action.total_dependant_count = 0;
            action.missing_dependency_count = 0;
        }

        // Forward dependency counts and reverse edges are independent passes: build the
        // reverse-edge table first (a parallel array, never stored back into `Action` per
        // the "no back-references stored inside Action" design note), then derive
        // `missing_dependency_count` from it.
        let mut dependants: Vec<Vec<usize>> = vec![Vec::new(); actions.len()];
        for (index, action) in actions.iter().enumerate() {
            for &prereq in &action.prerequisite_items {
                if let Some(&producer) = producer_of.get(&prereq) {
                    dependants[producer].push(index);
                }
            }
        }

        for (index, deps) in dependants.into_iter().enumerate() {
            actions[index].missing_dependency_count =
                actions[index].prerequisite_items.iter().filter(|f| producer_of.contains_key(f)).count();
            actions[index].dependants = deps;
        }

        let mut graph = Self { actions, producer_of };
        graph.detect_cycles()?;
        graph.compute_total_dependant_counts();
        Ok(graph)
    }

    fn detect_cycles(&self) -> Result<(), BuildError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks = vec![Mark::Unvisited; self.actions.len()];

        fn visit(
            graph: &ActionGraph,
            index: usize,
            marks: &mut [Mark],
        ) -> Result<(), BuildError> {
            match marks[index] {
                Mark::Done => return Ok(()),
                Mark::InProgress => return Err(BuildError::CycleDetected(index)),
                Mark::Unvisited => {}
            }
            marks[index] = Mark::InProgress;
            for &dependant in &graph.actions[index].dependants {
                visit(graph, dependant, marks)?;
            }
            marks[index] = Mark::Done;
            Ok(())
        }

        for index in 0..self.actions.len() {
            visit(self, index, &mut marks)?;
        }
        Ok(())
    }

    /// Post-order traversal with a visited set, computing the transitive dependant count of
    /// every action (used by the local executor to prioritize the ready queue).
    fn compute_total_dependant_counts(&mut self) {
        let mut counts = vec![None; self.actions.len()];

        fn compute(graph: &[Action], index: usize, counts: &mut [Option<usize>]) -> usize {
            if let Some(c) = counts[index] {
                return c;
            }
            let mut total = 0usize;
            let mut seen = HashSet::new();
            let mut stack: Vec<usize> = graph[index].dependants.clone();
            while let Some(d) = stack.pop() {
                if !seen.insert(d) {
                    continue;
                }
                total += 1;
                stack.extend(graph[d].dependants.iter().copied());
            }
            counts[index] = Some(total);
            total
        }

        for index in 0..self.actions.len() {
            let total = compute(&self.actions, index, &mut counts);
            self.actions[index].total_dependant_count = total;
        }
    }

    /// Reports, for each produced `FileId`, any pair of actions in `actions` whose command
    /// line differs for it — a signal of an accidentally merged graph where two unrelated
    /// targets both think they produce the same file with different commands.
    pub fn check_for_conflicts(actions: &[Action]) -> Vec<(FileId, usize, usize)> {
        let mut by_produced: HashMap<FileId, usize> = HashMap::new();
        let mut conflicts = Vec::new();
        for (index, action) in actions.iter().enumerate() {
            for &produced in &action.produced_items {
                match by_produced.get(&produced) {
                    Some(&other) if actions[other].command_arguments != action.command_arguments => {
                        conflicts.push((produced, other, index));
                    }
                    Some(_) => {}
                    None => {
                        by_produced.insert(produced, index);
                    }
                }
            }
        }
        conflicts
    }

    /// Transitive closure from a root set of produced `FileId`s back to the set of actions
    /// whose outputs reach them, returned in original graph order.
    pub fn gather_prerequisite_actions(&self, roots: &[FileId]) -> Vec<usize> {
        let mut wanted = HashSet::new();
        let mut stack: Vec<usize> = roots.iter().filter_map(|f| self.producer_of.get(f).copied()).collect();
        while let Some(index) = stack.pop() {
            if !wanted.insert(index) {
                continue;
            }
            for &prereq in &self.actions[index].prerequisite_items {
                if let Some(&producer) = self.producer_of.get(&prereq) {
                    stack.push(producer);
                }
            }
        }
        let mut result: Vec<usize> = wanted.into_iter().collect();
        result.sort_unstable();
        result
    }

    /// The minimal subset of actions needing execution, computed by propagating
    /// outdatedness transitively from the leaves.
    #[allow(clippy::too_many_arguments)]
    pub fn get_actions_to_execute(
        &self,
        paths: &Paths,
        roots: &[FileId],
        dep_cache: &CppDependencyCache,
        history: &ActionHistory,
        ignore_outdated_import_libs: bool,
    ) -> Result<HashSet<usize>, BuildError> {
        let candidates = self.gather_prerequisite_actions(roots);

        // Validate prerequisites up front: every prerequisite must either have a producer in
        // this graph or already exist on disk.
        for &index in &candidates {
            for &prereq in &self.actions[index].prerequisite_items {
                if !self.producer_of.contains_key(&prereq) && !paths.exists(prereq) {
                    return Err(BuildError::MissingPrerequisite {
                        path: paths.file_path(prereq).to_path_buf(),
                        action: index,
                    });
                }
            }
        }

        let mut outdated: HashMap<usize, bool> = HashMap::new();
        for &index in &candidates {
            self.is_outdated(index, paths, dep_cache, history, ignore_outdated_import_libs, &mut outdated);
        }

        Ok(candidates.into_iter().filter(|i| outdated.get(i).copied().unwrap_or(false)).collect())
    }

    fn is_outdated(
        &self,
        index: usize,
        paths: &Paths,
        dep_cache: &CppDependencyCache,
        history: &ActionHistory,
        ignore_outdated_import_libs: bool,
        memo: &mut HashMap<usize, bool>,
    ) -> bool {
        if let Some(&cached) = memo.get(&index) {
            return cached;
        }
        // Break potential cycles defensively (link() already rejects true cycles, but the
        // memoized recursive evaluation needs a placeholder to avoid infinite recursion on
        // a graph `link` failed to validate, e.g. constructed directly in tests).
        memo.insert(index, false);

        let action = &self.actions[index];

        let any_missing = action.produced_items.iter().any(|&f| !paths.exists(f));
        let oldest_produced_mtime = action
            .produced_items
            .iter()
            .filter_map(|&f| paths.mtime(f))
            .min();

        let hash_changed = {
            let current_hash = crate::caches::history::command_hash(&action.command_arguments);
            action
                .produced_items
                .iter()
                .any(|&f| history.lookup(paths.file_path(f)).map(|h| h != current_hash).unwrap_or(true))
        };

        let prereq_newer = action.prerequisite_items.iter().any(|&prereq| {
            if ignore_outdated_import_libs {
                if let Some(&producer) = self.producer_of.get(&prereq) {
                    if self.actions[producer].produces_import_library {
                        return false;
                    }
                }
            }
            match (paths.mtime(prereq), oldest_produced_mtime) {
                (Some(p), Some(o)) => p > o,
                (Some(_), None) => true,
                _ => false,
            }
        });

        let header_newer = action
            .dependency_list_file
            .and_then(|_| action.produced_items.first())
            .and_then(|&primary| dep_cache.headers_for(paths.file_path(primary)))
            .map(|headers| {
                headers.iter().any(|h| {
                    let mtime = fs::metadata(h).ok().and_then(|m| m.modified().ok());
                    match (mtime, oldest_produced_mtime) {
                        (Some(h), Some(o)) => h > o,
                        (Some(_), None) => true,
                        _ => false,
                    }
                })
            })
            .unwrap_or(false);

        let prereq_action_outdated = action.prerequisite_items.iter().any(|&prereq| {
            self.producer_of
                .get(&prereq)
                .map(|&producer| {
                    self.is_outdated(producer, paths, dep_cache, history, ignore_outdated_import_libs, memo)
                })
                .unwrap_or(false)
        });

        let result =
            any_missing || hash_changed || prereq_newer || header_newer || prereq_action_outdated;
        memo.insert(index, result);
        result
    }

    /// Deletes each outdated action's `delete_items`, plus any produced file strictly older
    /// than one of its own prerequisites, so link steps never observe stale inputs.
    pub fn delete_outdated_produced_items(&self, paths: &Paths, to_execute: &HashSet<usize>) -> std::io::Result<()> {
        for &index in to_execute {
            let action = &self.actions[index];
            for &item in &action.delete_items {
                let path = paths.file_path(item);
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
            let newest_prereq = action.prerequisite_items.iter().filter_map(|&f| paths.mtime(f)).max();
            if let Some(newest_prereq) = newest_prereq {
                for &produced in &action.produced_items {
                    if paths.mtime(produced).map(|m| m < newest_prereq).unwrap_or(false) {
                        let path = paths.file_path(produced);
                        if path.exists() {
                            fs::remove_file(path)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn create_directories_for_produced_items(&self, paths: &Paths, to_execute: &HashSet<usize>) -> std::io::Result<()> {
        for &index in to_execute {
            for &item in &self.actions[index].produced_items {
                if let Some(parent) = paths.file_path(item).parent() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(())
    }

    pub fn producer_of(&self, file: FileId) -> Option<usize> {
        self.producer_of.get(&file).copied()
    }
}

/// One entry of the stable JSON action-export format (§6).
#[derive(serde::Serialize)]
struct JsonAction<'a> {
    #[serde(rename = "type")]
    action_type: crate::action::ActionType,
    command_path: &'a Path,
    command_arguments: &'a str,
    working_directory: &'a Path,
    prerequisite_items: Vec<&'a Path>,
    produced_items: Vec<&'a Path>,
    depends_on: Vec<usize>,
    can_execute_remotely: bool,
    status_description: &'a str,
}

pub fn export_json(graph: &ActionGraph, paths: &Paths, path: impl AsRef<Path>) -> Result<(), BuildError> {
    export_json_subset(graph, paths, &(0..graph.actions.len()).collect(), path)
}

/// Same as [`export_json`], restricted to `subset` — used by `-WriteOutdatedActions` to dump
/// only the actions a build actually decided to run, not the whole linked graph.
pub fn export_json_subset(
    graph: &ActionGraph,
    paths: &Paths,
    subset: &HashSet<usize>,
    path: impl AsRef<Path>,
) -> Result<(), BuildError> {
    let mut indices: Vec<usize> = subset.iter().copied().collect();
    indices.sort_unstable();
    let entries: Vec<JsonAction> = indices
        .into_iter()
        .map(|index| &graph.actions[index])
        .map(|action| JsonAction {
            action_type: action.action_type,
            command_path: paths.file_path(action.command_path),
            command_arguments: &action.command_arguments,
            working_directory: paths.dir_path(action.working_directory),
            prerequisite_items: action.prerequisite_items.iter().map(|&f| paths.file_path(f)).collect(),
            produced_items: action.produced_items.iter().map(|&f| paths.file_path(f)).collect(),
            depends_on: action
                .prerequisite_items
                .iter()
                .filter_map(|&f| graph.producer_of(f))
                .collect(),
            can_execute_remotely: action.can_execute_remotely,
            status_description: &action.status_description,
        })
        .collect();
    let json = serde_json::to_string_pretty(&entries)?;
    fs::write(path, json)?;
    Ok(())
}

/// Merges independently-linked graphs into one, preserving `group_names` uniqueness per
/// action and re-linking the combined action list. Fails with `DuplicateProducer` if any
/// two input graphs share a produced item (which would indicate the same target was
/// generated twice, not a legitimate multi-target merge).
pub fn merge_graphs(graphs: Vec<ActionGraph>, paths: &Paths) -> Result<ActionGraph, BuildError> {
    let mut merged = Vec::new();
    for graph in graphs {
        merged.extend(graph.actions);
    }
    ActionGraph::link(merged, paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionType};

    fn sample_action(paths: &mut Paths, dir: &std::path::Path, cmd: &str, prereqs: &[&str], produced: &[&str]) -> Action {
        let working_directory = paths.intern_dir(dir);
        let command_path = paths.intern_file(dir.join("cc"));
        let mut action = Action::new(ActionType::Compile, working_directory, command_path, cmd);
        for p in prereqs {
            action.prerequisite_items.push(paths.intern_file(dir.join(p)));
        }
        for p in produced {
            action.produced_items.push(paths.intern_file(dir.join(p)));
        }
        action
    }

    #[test]
    fn link_detects_duplicate_producer() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let a = sample_action(&mut paths, dir.path(), "cc a.cpp -o x.o", &[], &["x.o"]);
        let b = sample_action(&mut paths, dir.path(), "cc b.cpp -o x.o", &[], &["x.o"]);
        let err = ActionGraph::link(vec![a, b], &paths).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateProducer { .. }));
    }

    #[test]
    fn link_computes_dependant_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        std::fs::write(dir.path().join("a.cpp"), "").unwrap();
        let compile = sample_action(&mut paths, dir.path(), "cc a.cpp -o a.o", &["a.cpp"], &["a.o"]);
        let link = sample_action(&mut paths, dir.path(), "ld a.o -o app", &["a.o"], &["app"]);
        let graph = ActionGraph::link(vec![compile, link], &paths).unwrap();
        assert_eq!(graph.actions[0].total_dependant_count, 1);
        assert_eq!(graph.actions[0].dependants, vec![1]);
        assert_eq!(graph.actions[1].missing_dependency_count, 1);
    }

    #[test]
    fn check_for_conflicts_flags_differing_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let a = sample_action(&mut paths, dir.path(), "cc a.cpp -o x.o -DFOO", &[], &["x.o"]);
        let b = sample_action(&mut paths, dir.path(), "cc a.cpp -o x.o -DBAR", &[], &["x.o"]);
        let conflicts = ActionGraph::check_for_conflicts(&[a, b]);
        assert_eq!(conflicts.len(), 1);
    }

    #[test]
    fn gather_prerequisite_actions_is_transitive() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let compile = sample_action(&mut paths, dir.path(), "cc a.cpp -o a.o", &["a.cpp"], &["a.o"]);
        let link = sample_action(&mut paths, dir.path(), "ld a.o -o app", &["a.o"], &["app"]);
        let app = paths.intern_file(dir.path().join("app"));
        let graph = ActionGraph::link(vec![compile, link], &paths).unwrap();
        let roots = graph.gather_prerequisite_actions(&[app]);
        assert_eq!(roots, vec![0, 1]);
    }

    #[test]
    fn get_actions_to_execute_is_empty_when_all_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), "").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(dir.path().join("a.o"), "").unwrap();

        let mut paths = Paths::new();
        paths.intern_file(dir.path().join("a.cpp"));
        let compile = sample_action(&mut paths, dir.path(), "cc a.cpp -o a.o", &["a.cpp"], &["a.o"]);
        let o = paths.intern_file(dir.path().join("a.o"));

        let mut history = ActionHistory::new();
        history.record(
            paths.file_path(o).to_path_buf(),
            crate::caches::history::command_hash("cc a.cpp -o a.o"),
        );

        let graph = ActionGraph::link(vec![compile], &paths).unwrap();
        let dep_cache = CppDependencyCache::new();
        let to_execute = graph.get_actions_to_execute(&paths, &[o], &dep_cache, &history, false).unwrap();
        assert!(to_execute.is_empty());
    }

    #[test]
    fn get_actions_to_execute_is_monotone_under_new_newer_prerequisite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), "").unwrap();
        std::fs::write(dir.path().join("a.o"), "").unwrap();

        let mut paths = Paths::new();
        let compile = sample_action(&mut paths, dir.path(), "cc a.cpp -o a.o", &["a.cpp"], &["a.o"]);
        let o = paths.intern_file(dir.path().join("a.o"));

        let mut history = ActionHistory::new();
        history.record(
            paths.file_path(o).to_path_buf(),
            crate::caches::history::command_hash("cc a.cpp -o a.o"),
        );

        let graph = ActionGraph::link(vec![compile], &paths).unwrap();
        let dep_cache = CppDependencyCache::new();
        let before = graph.get_actions_to_execute(&paths, &[o], &dep_cache, &history, false).unwrap();
        assert!(before.is_empty());

        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(dir.path().join("a.cpp"), "touched").unwrap();
        paths.reset_cached_info(paths.intern_file(dir.path().join("a.cpp")));

        let after = graph.get_actions_to_execute(&paths, &[o], &dep_cache, &history, false).unwrap();
        assert!(after.len() >= before.len());
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn merge_graphs_rejects_shared_produced_items() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Paths::new();
        let a = ActionGraph::link(vec![sample_action(&mut paths, dir.path(), "cc a.cpp -o x.o", &[], &["x.o"])], &paths).unwrap();
        let b = ActionGraph::link(vec![sample_action(&mut paths, dir.path(), "cc b.cpp -o x.o", &[], &["x.o"])], &paths).unwrap();
        let err = merge_graphs(vec![a, b], &paths).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateProducer { .. }));
    }
}
