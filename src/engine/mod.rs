//! Tasks of the graph and the steps taken to run a single one.

mod runner;

use std::fs;

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::core::{Settings, TaskIdentity};
use crate::dispatch::{Backend, JobSpec};
use crate::error::{DispatchError, GridError};
use crate::grid::Commands;
use crate::params::{Stage, StageParams};
use crate::store::DocumentStore;
use crate::target::Target;

pub(crate) use runner::{plan_tasks, run_tasks_parallel};
pub use runner::{RunReport, Summary, TaskExecution};

/// Store collection recording finished processing tasks.
pub const PROCESSING_COLLECTION: &str = "processing";
/// Store collection the evaluation program writes its scores to.
pub const RESULTS_COLLECTION: &str = "results";
/// File written into every work directory before a job is submitted.
pub const CONFIG_FILE: &str = "config.json";

/// Lifecycle of a task within one run.
///
/// ```text
/// Pending ──> Skipped
///    └──────> Running ──> Done
///                  └────> Failed
/// ```
///
/// A task only leaves `Pending` once its prerequisite is `Done` or `Skipped`,
/// so the dependents of a failed task stay `Pending` for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Skipped,
    Running,
    Done,
    Failed { exit_code: i32 },
}

impl TaskState {
    /// Whether dependents may be scheduled.
    pub fn is_complete(self) -> bool {
        matches!(self, TaskState::Skipped | TaskState::Done)
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Skipped => "skipped",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed { .. } => "failed",
        }
    }
}

/// The processing task an evaluation reads its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub identity: TaskIdentity,
    pub work_dir: Utf8PathBuf,
}

/// A single node of the task graph.
///
/// Tasks never change once built; their state during a run is kept by the
/// scheduler.
#[derive(Debug, Clone)]
pub struct Task {
    pub stage: Stage,
    pub identity: TaskIdentity,
    /// Essential parameters, the identity is computed from exactly these.
    pub params: StageParams,
    pub work_dir: Utf8PathBuf,
    pub target: Target,
    pub upstream: Option<Upstream>,
}

impl Task {
    pub(crate) fn new(
        stage: Stage,
        params: StageParams,
        settings: &Settings,
        upstream: Option<Upstream>,
    ) -> Self {
        let identity = params.identity();
        let work_dir = params.work_dir(settings, stage, identity);
        let database = params.general.db_name();

        let target = match stage {
            Stage::Processing => Target::CollectionMembership {
                database,
                collection: PROCESSING_COLLECTION.to_string(),
                id: identity.to_hex(),
            },
            Stage::Evaluation => {
                let mut predicate = Map::new();
                predicate.insert("task_identity".into(), identity.to_hex().into());

                Target::DocumentExistence {
                    database,
                    collection: RESULTS_COLLECTION.to_string(),
                    predicate,
                }
            }
        };

        Self {
            stage,
            identity,
            params,
            work_dir,
            target,
            upstream,
        }
    }

    /// Short human readable label, e.g. `processing[1f0c5e2a9b3d] setup01@300000`.
    pub fn name(&self) -> String {
        format!(
            "{}[{}] {}@{}",
            self.stage,
            self.identity.short(),
            self.params.general.setup,
            self.params.general.iteration,
        )
    }

    pub fn config_path(&self) -> Utf8PathBuf {
        self.work_dir.join(CONFIG_FILE)
    }

    pub fn log_paths(&self) -> (Utf8PathBuf, Utf8PathBuf) {
        (
            self.work_dir.join(format!("{}.out", self.stage)),
            self.work_dir.join(format!("{}.err", self.stage)),
        )
    }

    /// Content of the configuration file handed to the external program: the
    /// essential parameters plus bookkeeping the program needs to find its
    /// input and report its result.
    pub fn config_document(&self) -> Value {
        let mut document = match self.params.to_value() {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        document.insert("stage".into(), self.stage.name().into());
        document.insert("task_identity".into(), self.identity.to_hex().into());
        document.insert("work_dir".into(), self.work_dir.as_str().into());
        document.insert("database".into(), self.target.database().into());
        document.insert("collection".into(), self.target.collection().into());

        if let Some(upstream) = &self.upstream {
            document.insert(
                "upstream".into(),
                json!({
                    "task_identity": upstream.identity.to_hex(),
                    "work_dir": upstream.work_dir.as_str(),
                }),
            );
        }

        Value::Object(document)
    }

    fn completion_document(&self) -> Value {
        json!({
            "task_identity": self.identity.to_hex(),
            "stage": self.stage.name(),
            "work_dir": self.work_dir.as_str(),
            "parameters": self.params.to_value(),
        })
    }

    /// Runs the task to a terminal state.
    ///
    /// A non-zero exit code is not an error: the task ends up
    /// [`TaskState::Failed`]. Errors are reserved for conditions that affect
    /// the whole run, like an unreachable store.
    pub(crate) fn execute(&self, ctx: &Context<'_>) -> Result<TaskState, GridError> {
        if self.target.exists(ctx.store)? {
            tracing::info!(task = %self.name(), "already complete, skipping");
            return Ok(TaskState::Skipped);
        }

        let command = match self.stage {
            Stage::Processing => ctx.commands.processing.as_deref(),
            Stage::Evaluation => ctx.commands.evaluation.as_deref(),
        }
        .ok_or_else(|| {
            GridError::Dispatch(self.name(), DispatchError::NotImplemented(self.stage.name()))
        })?;

        if command.is_empty() {
            return Err(GridError::Dispatch(self.name(), DispatchError::EmptyCommand));
        }

        crate::utils::ensure_dir(&self.work_dir)?;

        let config = self.config_path();
        let bytes = serde_json::to_vec_pretty(&self.config_document())
            .map_err(|e| GridError::Artifact(self.name(), e))?;
        fs::write(&config, bytes).map_err(|e| GridError::Io(config.clone(), e))?;

        let mut line = command.to_vec();
        line.push(config.to_string());

        let (log_out, log_err) = self.log_paths();
        let job = JobSpec {
            name: self.name(),
            command: line,
            work_dir: self.work_dir.clone(),
            log_out,
            log_err,
            cpus: ctx.cpus,
        };

        tracing::info!(task = %job.name, dir = %job.work_dir, "submitting");

        let exit_code = ctx
            .backend
            .submit(&job)
            .map_err(|e| GridError::Dispatch(job.name.clone(), e))?;

        if exit_code != 0 {
            tracing::warn!(task = %job.name, exit_code, log = %job.log_err, "job failed");
            return Ok(TaskState::Failed { exit_code });
        }

        self.target.record_done(ctx.store, self.completion_document())?;
        tracing::info!(task = %job.name, "done");

        Ok(TaskState::Done)
    }
}

/// Everything a task needs from the outside world while it runs.
#[derive(Clone, Copy)]
pub(crate) struct Context<'a> {
    pub store: &'a dyn DocumentStore,
    pub backend: &'a dyn Backend,
    pub commands: &'a Commands,
    pub cpus: u32,
}
