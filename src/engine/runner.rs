mod diagnostics;

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{Context, Task, TaskState};
use crate::error::GridError;
use crate::store::DocumentStore;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Outcome of a run: the final state of every task and how long the ones
/// that were picked up took.
#[derive(Debug, Default)]
pub struct RunReport {
    pub states: HashMap<NodeIndex, TaskState>,
    pub execution_times: HashMap<NodeIndex, TaskExecution>,
}

impl RunReport {
    pub fn state(&self, index: NodeIndex) -> TaskState {
        self.states
            .get(&index)
            .copied()
            .unwrap_or(TaskState::Pending)
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();

        for state in self.states.values() {
            match state {
                TaskState::Pending | TaskState::Running => summary.pending += 1,
                TaskState::Skipped => summary.skipped += 1,
                TaskState::Done => summary.done += 1,
                TaskState::Failed { .. } => summary.failed += 1,
            }
        }

        summary
    }

    /// True when every task ended up done or skipped.
    pub fn is_success(&self) -> bool {
        self.states.values().all(|state| state.is_complete())
    }
}

/// Number of tasks per final state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub pending: usize,
    pub skipped: usize,
    pub done: usize,
    pub failed: usize,
}

impl Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} done, {} skipped, {} failed, {} not reached",
            self.done, self.skipped, self.failed, self.pending
        )
    }
}

/// Checks every completion target without running anything. Tasks already
/// recorded as complete are reported `Skipped`, everything else `Pending`.
pub(crate) fn plan_tasks(
    graph: &Graph<Task, ()>,
    store: &dyn DocumentStore,
) -> Result<RunReport, GridError> {
    let mut states = HashMap::with_capacity(graph.node_count());

    for index in graph.node_indices() {
        let state = if graph[index].target.exists(store)? {
            TaskState::Skipped
        } else {
            TaskState::Pending
        };
        states.insert(index, state);
    }

    Ok(RunReport {
        states,
        execution_times: HashMap::new(),
    })
}

/// Executes the task graph on a pool of `workers` threads. Tasks are spawned
/// as soon as their prerequisites are complete.
///
/// 1. Every node starts with a count of its prerequisites.
/// 2. Nodes with a count of zero are spawned on the pool.
/// 3. The calling thread waits for results on a channel. When a task ends
///    `Done` or `Skipped` the counts of its dependents are decremented, and
///    any that reach zero are spawned in turn.
/// 4. A `Failed` task unlocks nothing, its dependents stay `Pending`.
/// 5. An error stops any further spawning. Tasks already running are waited
///    for, then the first error is returned.
pub(crate) fn run_tasks_parallel(
    graph: &Graph<Task, ()>,
    ctx: &Context<'_>,
    workers: usize,
) -> Result<RunReport, GridError> {
    if petgraph::algo::toposort(graph, None).is_err() {
        return Err(GridError::Cycle);
    }

    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|i| {
            let count = graph
                .neighbors_directed(i, petgraph::Direction::Incoming)
                .count();
            (i, count)
        })
        .collect();

    let mut states: HashMap<NodeIndex, TaskState> = graph
        .node_indices()
        .map(|i| (i, TaskState::Pending))
        .collect();

    let total_tasks = graph.node_count() as u64;
    if total_tasks == 0 {
        return Ok(RunReport::default());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("gridflow-worker-{i}"))
        .build()?;

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total_tasks);
    root_span.pb_set_style(&crate::utils::get_style_root());
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let pb_style = crate::utils::get_style_task();

    let mut execution_times = HashMap::new();
    let mut failure: Option<GridError> = None;

    // The scheduler loop runs on the calling thread, every pool thread is free
    // for tasks.
    pool.in_place_scope(|s| {
        // (index, result, start, duration)
        let (result_sender, result_receiver) =
            channel::<(NodeIndex, Result<TaskState, GridError>, Instant, Duration)>();

        let spawn_task = |index: NodeIndex| {
            let task = &graph[index];
            let sender = result_sender.clone();
            let pb_style = pb_style.clone();

            s.spawn(move |_| {
                let name = task.name();
                let span = tracing::span!(Level::INFO, "task", name = %name);
                span.pb_set_style(&pb_style);
                span.pb_set_message(&format!("Running {name}"));
                let _enter = span.enter();

                let start = Instant::now();

                // A panic here comes from this crate, not from the external
                // job, and ends the run like any other error.
                let result =
                    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        task.execute(ctx)
                    })) {
                        Ok(result) => result,
                        Err(panic) => Err(GridError::Panic(name, panic_message(panic))),
                    };

                // The receiver outlives every worker.
                let _ = sender.send((index, result, start, start.elapsed()));
            });
        };

        let mut in_flight = 0usize;

        for index in graph.node_indices() {
            if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
                states.insert(index, TaskState::Running);
                spawn_task(index);
                in_flight += 1;
            }
        }

        while in_flight > 0 {
            let Ok((index, result, start, duration)) = result_receiver.recv() else {
                break;
            };

            in_flight -= 1;
            root_span.pb_inc(1);

            let state = match result {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(task = %graph[index].name(), "{e}");
                    states.insert(index, TaskState::Pending);
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    continue;
                }
            };

            states.insert(index, state);
            execution_times.insert(index, TaskExecution { start, duration });

            if failure.is_some() || !state.is_complete() {
                continue;
            }

            if let Some(dependents_of_completed) = dependents.get(&index) {
                for &dependent in dependents_of_completed {
                    if let Some(count) = dependency_counts.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            states.insert(dependent, TaskState::Running);
                            spawn_task(dependent);
                            in_flight += 1;
                        }
                    }
                }
            }
        }
    });

    if let Some(e) = failure {
        return Err(e);
    }

    let report = RunReport {
        states,
        execution_times,
    };

    tracing::info!("Run complete: {}", report.summary());
    Ok(report)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}
