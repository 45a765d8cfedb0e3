#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod error;
pub use error::{BuildError, Result};

pub mod paths;
pub use paths::{DirId, FileId, Paths};

pub mod archive;

pub mod action;
pub use action::{Action, ActionState, ActionType};

pub mod caches;
pub use caches::{CachePaths, Caches};

pub mod graph;
pub use graph::ActionGraph;

pub mod makefile;
pub use makefile::{LoadContext, Makefile, ReasonNotLoaded, TargetRules, TargetType};

pub mod executor;
pub use executor::{DistributedConfig, Executor, ExecutionResult, LocalConfig};

pub mod hotreload;

pub mod report;

pub mod config;
pub use config::BuildConfig;

pub mod orchestrator;
pub use orchestrator::Orchestrator;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
