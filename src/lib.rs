#![forbid(unsafe_code)]
//! Grid search over two-stage experiment pipelines.
//!
//! A [`GridSpec`] lists five groups of parameters (general, data,
//! preprocessing, output and solve) and the keys among them that hold lists
//! of candidates. A [`Blueprint`] explodes the grid into every combination of
//! candidates and builds a [`TaskGraph`] in which each combination becomes an
//! evaluation task that depends on a processing task. Tasks are identified by
//! a hash of their essential parameters, so two combinations that need the
//! same processing share it, and a task whose completion is already recorded
//! in the [`DocumentStore`] is skipped.
//!
//! ```rust,no_run
//! use gridflow::{Blueprint, FsStore, GridSpec, LauncherBackend, Settings};
//!
//! let spec = GridSpec::load("grid.json")?;
//! let graph = Blueprint::from_spec(&spec, Settings::default()).build(&spec)?;
//!
//! let store = FsStore::new("/nrs/funke/store");
//! let report = graph.run(&store, &LauncherBackend::default())?;
//! println!("{}", report.summary());
//! # Ok::<(), gridflow::GridError>(())
//! ```

mod blueprint;
mod core;
mod dispatch;
mod engine;
mod error;
mod grid;
mod params;
mod store;
mod target;
pub mod utils;

pub use petgraph::graph::NodeIndex;

pub use crate::blueprint::{Blueprint, TaskGraph};
pub use crate::core::{ParamMap, Settings, TaskIdentity, canonical_json, identity_of};
pub use crate::dispatch::{Backend, JobSpec, LauncherBackend, LocalBackend};
pub use crate::engine::{
    CONFIG_FILE, PROCESSING_COLLECTION, RESULTS_COLLECTION, RunReport, Summary, Task,
    TaskExecution, TaskState, Upstream,
};
pub use crate::error::*;
pub use crate::grid::{Combination, Commands, ExplodedGrid, GridSpec, Group, explode};
pub use crate::params::{GeneralParams, PREDICT_DIR, Stage, StageParams};
pub use crate::store::{DocumentStore, FsStore, MemoryStore, matches};
pub use crate::target::Target;
