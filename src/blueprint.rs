use std::collections::HashMap;
use std::collections::hash_map::Entry;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::{ParamMap, Settings, TaskIdentity};
use crate::dispatch::Backend;
use crate::engine::{Context, RunReport, Task, Upstream, plan_tasks, run_tasks_parallel};
use crate::error::{ConfigError, GridError};
use crate::grid::{Commands, GridSpec, Group};
use crate::params::{GeneralParams, Stage, StageParams};
use crate::store::DocumentStore;

/// The blueprint for a batch of experiments.
///
/// `Blueprint` turns a parameter grid into a [`TaskGraph`]: one evaluation
/// task per combination of the exploded groups, each depending on the
/// processing task its parameters reduce to.
///
/// # Example
///
/// ```rust,no_run
/// use gridflow::{Blueprint, GridSpec, Settings};
///
/// let spec = GridSpec::load("grid.json")?;
/// let graph = Blueprint::from_spec(&spec, Settings::default()).build(&spec)?;
/// println!("{graph}");
/// # Ok::<(), gridflow::GridError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Blueprint {
    settings: Settings,
    evaluation_only: Vec<String>,
    commands: Commands,
}

impl Blueprint {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            evaluation_only: Vec::new(),
            commands: Commands::default(),
        }
    }

    /// Takes the evaluation-only keys, the commands and the CPU hint from a
    /// grid file.
    pub fn from_spec(spec: &GridSpec, mut settings: Settings) -> Self {
        if let Some(cpus) = spec.cpus {
            settings.cpus = cpus;
        }

        Self {
            settings,
            evaluation_only: spec.evaluation_only.clone(),
            commands: spec.commands.clone(),
        }
    }

    /// Parameters that don't affect the processing stage.
    pub fn evaluation_only<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.evaluation_only = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn commands(mut self, commands: Commands) -> Self {
        self.commands = commands;
        self
    }

    /// Builds the graph from five parameter groups and the keys to explode.
    pub fn build_graph(
        &self,
        general: &ParamMap,
        data: &ParamMap,
        preprocessing: &ParamMap,
        output: &ParamMap,
        solve: &ParamMap,
        range_keys: &[String],
    ) -> Result<TaskGraph, GridError> {
        let spec = GridSpec {
            general: general.clone(),
            data: data.clone(),
            preprocessing: preprocessing.clone(),
            output: output.clone(),
            solve: solve.clone(),
            range_keys: range_keys.to_vec(),
            ..Default::default()
        };

        self.build(&spec)
    }

    /// Builds the graph from the groups and range keys of `spec`.
    ///
    /// Evaluation-only keys and commands are those of the blueprint, see
    /// [`Blueprint::from_spec`].
    pub fn build(&self, spec: &GridSpec) -> Result<TaskGraph, GridError> {
        if let Some(key) = self
            .evaluation_only
            .iter()
            .find(|key| GeneralParams::FIELDS.contains(&key.as_str()))
        {
            return Err(ConfigError::EvaluationOnlyGeneral(key.clone()).into());
        }

        let stage_groups = [Group::Data, Group::Preprocessing, Group::Output, Group::Solve];
        if let Some(key) = self.evaluation_only.iter().find(|key| {
            !stage_groups
                .iter()
                .any(|&group| spec.group(group).contains_key(*key))
        }) {
            return Err(ConfigError::UnusedEvaluationOnlyKey(key.clone()).into());
        }

        let settings = self.settings.absolute()?;
        let grid = spec.explode_all()?;

        let mut graph = Graph::new();
        let mut processing: HashMap<TaskIdentity, NodeIndex> = HashMap::new();
        let mut seen: HashMap<TaskIdentity, NodeIndex> = HashMap::new();
        let mut evaluations = Vec::with_capacity(grid.len());

        for combination in grid.combinations() {
            let params = StageParams {
                general: GeneralParams::from_map(combination.general)?,
                data: combination.data.clone(),
                preprocessing: combination.preprocessing.clone(),
                output: combination.output.clone(),
                solve: combination.solve.clone(),
            };

            let upstream = Task::new(
                Stage::Processing,
                params.without(&self.evaluation_only),
                &settings,
                None,
            );

            let upstream_index = *processing
                .entry(upstream.identity)
                .or_insert_with(|| graph.add_node(upstream));

            let upstream = &graph[upstream_index];
            let upstream = Upstream {
                identity: upstream.identity,
                work_dir: upstream.work_dir.clone(),
            };

            let task = Task::new(Stage::Evaluation, params, &settings, Some(upstream));

            // A candidate listed twice in a range gives the same evaluation
            // twice, it is only run once.
            if let Entry::Vacant(entry) = seen.entry(task.identity) {
                let index = graph.add_node(task);
                graph.add_edge(upstream_index, index, ());
                entry.insert(index);
                evaluations.push(index);
            }
        }

        tracing::debug!(
            processing = processing.len(),
            evaluation = evaluations.len(),
            "built task graph"
        );

        Ok(TaskGraph {
            graph,
            evaluations,
            settings,
            commands: self.commands.clone(),
        })
    }
}

/// The two-stage dependency graph of one invocation.
///
/// Edges point from a processing task to the evaluation tasks that read its
/// output. Processing tasks are unique by identity.
#[derive(Debug)]
pub struct TaskGraph {
    pub(crate) graph: Graph<Task, ()>,
    evaluations: Vec<NodeIndex>,
    settings: Settings,
    commands: Commands,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn task(&self, index: NodeIndex) -> &Task {
        &self.graph[index]
    }

    pub fn tasks(&self) -> impl Iterator<Item = (NodeIndex, &Task)> {
        self.graph
            .node_indices()
            .map(move |index| (index, &self.graph[index]))
    }

    /// Edges as `(processing, evaluation)` pairs.
    pub fn edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex)> + '_ {
        self.graph
            .raw_edges()
            .iter()
            .map(|edge| (edge.source(), edge.target()))
    }

    /// Evaluation tasks, in grid order.
    pub fn evaluations(&self) -> impl Iterator<Item = (NodeIndex, &Task)> {
        self.evaluations
            .iter()
            .map(move |&index| (index, &self.graph[index]))
    }

    pub fn processing(&self) -> impl Iterator<Item = (NodeIndex, &Task)> {
        self.tasks()
            .filter(|(_, task)| task.stage == Stage::Processing)
    }

    /// The task that has to complete before `index` may run.
    pub fn prerequisite(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .neighbors_directed(index, petgraph::Direction::Incoming)
            .next()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs every task that isn't complete yet.
    ///
    /// Only errors that concern the whole run are returned as `Err`, failing
    /// jobs are reported in the [`RunReport`].
    pub fn run(
        &self,
        store: &dyn DocumentStore,
        backend: &dyn Backend,
    ) -> Result<RunReport, GridError> {
        let ctx = Context {
            store,
            backend,
            commands: &self.commands,
            cpus: self.settings.cpus,
        };

        run_tasks_parallel(&self.graph, &ctx, self.settings.workers)
    }

    /// Checks which tasks a run would skip, without dispatching anything.
    pub fn plan(&self, store: &dyn DocumentStore) -> Result<RunReport, GridError> {
        plan_tasks(&self.graph, store)
    }
}

impl std::fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, task) in self.tasks() {
            let name = task.name().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for (source, target) in self.edges() {
            writeln!(f, "    {} --> {}", source.index(), target.index())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::collections::HashSet;

    fn params(value: Value) -> ParamMap {
        serde_json::from_value(value).unwrap()
    }

    fn spec() -> GridSpec {
        GridSpec {
            general: params(json!({
                "experiment": "cremi",
                "setup": ["setup01", "setup02"],
                "iteration": [300000, 400000],
                "sample": "sample_C.n5",
            })),
            preprocessing: params(json!({ "gaussian_sigma_single": [0.1, 0.2] })),
            solve: params(json!({ "cc_min_vertices": [4, 5, 6], "time_limit": 120 })),
            range_keys: vec![
                "setup".into(),
                "iteration".into(),
                "gaussian_sigma_single".into(),
                "cc_min_vertices".into(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_all_parameters_essential_by_default() {
        let graph = Blueprint::default().build(&spec()).unwrap();

        assert_eq!(graph.evaluations().count(), 24);
        assert_eq!(graph.processing().count(), 24);
        assert_eq!(graph.len(), 48);
    }

    #[test]
    fn test_evaluation_only_keys_share_processing() {
        let graph = Blueprint::default()
            .evaluation_only(["gaussian_sigma_single", "cc_min_vertices"])
            .build(&spec())
            .unwrap();

        assert_eq!(graph.evaluations().count(), 24);
        assert_eq!(graph.processing().count(), 4);

        let identities: HashSet<_> = graph.evaluations().map(|(_, t)| t.identity).collect();
        assert_eq!(identities.len(), 24);

        for (_, task) in graph.processing() {
            assert!(task.params.preprocessing.is_empty());
            assert_eq!(task.params.solve["time_limit"], json!(120));
            assert!(!task.params.solve.contains_key("cc_min_vertices"));
        }
    }

    #[test]
    fn test_prerequisite_matches_processing_subset() {
        let keys = vec!["cc_min_vertices".to_string()];
        let graph = Blueprint::default()
            .evaluation_only(keys.clone())
            .build(&spec())
            .unwrap();

        for (index, task) in graph.evaluations() {
            let upstream = graph.prerequisite(index).unwrap();
            let upstream = graph.task(upstream);

            assert_eq!(upstream.stage, Stage::Processing);
            assert_eq!(upstream.identity, task.params.without(&keys).identity());
            assert_eq!(
                task.upstream.as_ref().map(|u| u.identity),
                Some(upstream.identity)
            );
        }

        for (index, _) in graph.processing() {
            assert_eq!(graph.prerequisite(index), None);
        }
    }

    #[test]
    fn test_general_key_cannot_be_evaluation_only() {
        let err = Blueprint::default()
            .evaluation_only(["iteration"])
            .build(&spec())
            .unwrap_err();

        assert!(matches!(
            err,
            GridError::Config(ConfigError::EvaluationOnlyGeneral(_))
        ));
    }

    #[test]
    fn test_unknown_evaluation_only_key() {
        let err = Blueprint::default()
            .evaluation_only(["cc_min_vertice"])
            .build(&spec())
            .unwrap_err();

        assert!(matches!(
            err,
            GridError::Config(ConfigError::UnusedEvaluationOnlyKey(ref key)) if key == "cc_min_vertice"
        ));
    }

    #[test]
    fn test_relative_base_dir_becomes_absolute() {
        let settings = Settings {
            base_dir: "experiments".into(),
            ..Default::default()
        };
        let graph = Blueprint::new(settings).build(&spec()).unwrap();

        assert!(graph.settings().base_dir.is_absolute());
        for (_, task) in graph.tasks() {
            assert!(task.work_dir.is_absolute());
            assert!(task.config_path().is_absolute());
        }
        for (_, task) in graph.evaluations() {
            let upstream = task.upstream.as_ref().unwrap();
            assert!(upstream.work_dir.is_absolute());
        }
    }

    #[test]
    fn test_build_graph_from_groups() {
        let spec = spec();
        let graph = Blueprint::default()
            .build_graph(
                &spec.general,
                &spec.data,
                &spec.preprocessing,
                &spec.output,
                &spec.solve,
                &spec.range_keys,
            )
            .unwrap();

        assert_eq!(graph.evaluations().count(), 24);
    }

    #[test]
    fn test_duplicate_candidates_run_once() {
        let mut spec = spec();
        spec.solve = params(json!({ "cc_min_vertices": [4, 4] }));

        let graph = Blueprint::default().build(&spec).unwrap();
        assert_eq!(graph.evaluations().count(), 8);
    }

    #[test]
    fn test_empty_range_builds_nothing() {
        let mut spec = spec();
        spec.solve = params(json!({ "cc_min_vertices": [] }));

        let graph = Blueprint::default().build(&spec).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_invalid_general_group() {
        let mut spec = spec();
        spec.general.remove("sample");

        let err = Blueprint::default().build(&spec).unwrap_err();
        assert!(matches!(
            err,
            GridError::Config(ConfigError::MissingParameter("sample"))
        ));
    }

    #[test]
    fn test_from_spec_overrides_cpus() {
        let mut spec = spec();
        spec.cpus = Some(2);
        spec.evaluation_only = vec!["cc_min_vertices".into()];

        let graph = Blueprint::from_spec(&spec, Settings::default())
            .build(&spec)
            .unwrap();

        assert_eq!(graph.settings().cpus, 2);
        assert_eq!(graph.processing().count(), 8);
    }

    #[test]
    fn test_display_mermaid() {
        let graph = Blueprint::default()
            .evaluation_only(["gaussian_sigma_single", "cc_min_vertices"])
            .build(&spec())
            .unwrap();

        let text = graph.to_string();
        assert!(text.starts_with("graph LR\n"));
        assert_eq!(text.matches(" --> ").count(), 24);
    }
}
