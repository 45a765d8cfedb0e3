//! The action-executor abstraction: a tagged variant over the two concrete execution
//! strategies, rather than dynamic dispatch over a trait object (per the "dynamic dispatch
//! over executors -> tagged variant" design note).

pub mod distributed;
pub mod local;

pub use distributed::{DistributedConfig, DistributedExecutor};
pub use local::{LocalConfig, LocalExecutor};

use std::collections::HashSet;

use crate::error::Result;
use crate::graph::ActionGraph;
use crate::paths::Paths;

/// Aggregate result of running a set of actions: which indices (into `ActionGraph::actions`)
/// ran, and whether every one of them succeeded.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub executed: Vec<usize>,
    pub failed: Vec<usize>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Selects which concrete strategy runs a build: a bounded local thread pool, or an
/// external distributed-build coordinator.
pub enum Executor {
    Local(LocalConfig),
    Distributed(DistributedConfig),
}

impl Executor {
    pub fn execute(
        &self,
        graph: &ActionGraph,
        paths: &Paths,
        to_execute: &HashSet<usize>,
    ) -> Result<ExecutionResult> {
        match self {
            Executor::Local(cfg) => LocalExecutor::new(cfg.clone()).run(graph, paths, to_execute),
            Executor::Distributed(cfg) => DistributedExecutor::new(cfg.clone()).run(graph, paths, to_execute),
        }
    }
}
