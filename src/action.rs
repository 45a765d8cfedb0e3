//! The [`Action`] node type: one external tool invocation in the build graph.

use crate::paths::{DirId, FileId};

/// What kind of tool invocation an [`Action`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ActionType {
    Compile,
    Link,
    Archive,
    BuildProject,
    WriteMetadata,
    PostBuild,
}

/// One node in the action graph: an external process invocation with its inputs, outputs,
/// and display metadata.
///
/// `dependants`, `total_dependant_count` and `missing_dependency_count` are transient —
/// they are recomputed by [`crate::graph::ActionGraph::link`] and must not be hand-populated.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    pub working_directory: DirId,
    pub command_path: FileId,
    pub command_arguments: String,

    /// Inputs that must exist and be up to date before this action runs.
    pub prerequisite_items: Vec<FileId>,
    /// Outputs; the first element is canonical for naming/diagnostics.
    pub produced_items: Vec<FileId>,
    /// Subset of `produced_items` deleted before the action runs.
    pub delete_items: Vec<FileId>,

    pub status_description: String,
    pub command_description: String,

    /// Tags used when merging multiple target graphs into one.
    pub group_names: Vec<String>,

    pub can_execute_remotely: bool,
    pub can_execute_remotely_with_sndbs: bool,
    pub is_gcc_compiler: bool,
    pub should_output_status_description: bool,
    pub produces_import_library: bool,

    /// Compiler-emitted include list for finer-grained invalidation, if any.
    pub dependency_list_file: Option<FileId>,

    #[serde(skip)]
    pub dependants: Vec<usize>,
    #[serde(skip)]
    pub total_dependant_count: usize,
    #[serde(skip)]
    pub missing_dependency_count: usize,
}

impl Action {
    pub fn new(
        action_type: ActionType,
        working_directory: DirId,
        command_path: FileId,
        command_arguments: impl Into<String>,
    ) -> Self {
        Self {
            action_type,
            working_directory,
            command_path,
            command_arguments: command_arguments.into(),
            prerequisite_items: Vec::new(),
            produced_items: Vec::new(),
            delete_items: Vec::new(),
            status_description: String::new(),
            command_description: String::new(),
            group_names: Vec::new(),
            can_execute_remotely: false,
            can_execute_remotely_with_sndbs: false,
            is_gcc_compiler: false,
            should_output_status_description: true,
            produces_import_library: false,
            dependency_list_file: None,
            dependants: Vec::new(),
            total_dependant_count: 0,
            missing_dependency_count: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.missing_dependency_count == 0
    }
}

/// Current execution state of an action, tracked by the executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
}
