//! Typed parameter records for the two pipeline stages.

use std::fmt::Display;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::{ParamMap, Settings, TaskIdentity};
use crate::error::ConfigError;

/// Directory inside an experiment that holds all stage outputs.
pub const PREDICT_DIR: &str = "03_predict";

/// The two stages every configuration goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Processing,
    Evaluation,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Processing => "processing",
            Stage::Evaluation => "evaluation",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The general parameters every task carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneralParams {
    /// Name of the experiment directory.
    pub experiment: String,
    /// Which network setup produced the predictions.
    pub setup: String,
    /// Training iteration of the setup.
    pub iteration: u64,
    /// Sample to process, may contain `/`.
    pub sample: String,
}

impl GeneralParams {
    pub const FIELDS: [&'static str; 4] = ["experiment", "setup", "iteration", "sample"];

    /// Validates one exploded general configuration.
    pub fn from_map(map: &ParamMap) -> Result<Self, ConfigError> {
        if let Some(key) = map.keys().find(|k| !Self::FIELDS.contains(&k.as_str())) {
            return Err(ConfigError::UnknownParameter(key.clone()));
        }

        let sample = string_field(map, "sample")?;

        // Joined onto the predict directory, a rooted path would replace it.
        if Utf8Path::new(&sample).has_root() {
            return Err(ConfigError::InvalidParameter {
                key: "sample".to_string(),
                expected: "a relative path",
                found: sample,
            });
        }

        Ok(Self {
            experiment: string_field(map, "experiment")?,
            setup: string_field(map, "setup")?,
            iteration: integer_field(map, "iteration")?,
            sample,
        })
    }

    /// Name of the store database holding results for this setup and
    /// iteration, e.g. `cremi_setup01_300k`.
    pub fn db_name(&self) -> String {
        format!(
            "{}_{}_{}k",
            self.experiment,
            self.setup,
            self.iteration / 1000
        )
    }

    /// `<base>/<experiment>/03_predict/<setup>/<iteration>`
    pub fn predict_dir(&self, settings: &Settings) -> Utf8PathBuf {
        settings
            .base_dir
            .join(&self.experiment)
            .join(PREDICT_DIR)
            .join(&self.setup)
            .join(self.iteration.to_string())
    }
}

fn string_field(map: &ParamMap, key: &'static str) -> Result<String, ConfigError> {
    match map.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ConfigError::InvalidParameter {
            key: key.to_string(),
            expected: "a string",
            found: other.to_string(),
        }),
        None => Err(ConfigError::MissingParameter(key)),
    }
}

fn integer_field(map: &ParamMap, key: &'static str) -> Result<u64, ConfigError> {
    match map.get(key) {
        Some(value) => value.as_u64().ok_or_else(|| ConfigError::InvalidParameter {
            key: key.to_string(),
            expected: "a non-negative integer",
            found: value.to_string(),
        }),
        None => Err(ConfigError::MissingParameter(key)),
    }
}

/// The essential parameters of a task: the general fields and the four other
/// groups kept as nested objects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageParams {
    #[serde(flatten)]
    pub general: GeneralParams,
    pub data: ParamMap,
    pub preprocessing: ParamMap,
    pub output: ParamMap,
    pub solve: ParamMap,
}

impl StageParams {
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("experiment".into(), self.general.experiment.clone().into());
        map.insert("setup".into(), self.general.setup.clone().into());
        map.insert("iteration".into(), self.general.iteration.into());
        map.insert("sample".into(), self.general.sample.clone().into());
        map.insert("data".into(), to_object(&self.data));
        map.insert("preprocessing".into(), to_object(&self.preprocessing));
        map.insert("output".into(), to_object(&self.output));
        map.insert("solve".into(), to_object(&self.solve));
        Value::Object(map)
    }

    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::of(&self.to_value())
    }

    /// A copy with the given keys removed from the four nested groups.
    pub fn without(&self, keys: &[String]) -> Self {
        let strip = |group: &ParamMap| -> ParamMap {
            group
                .iter()
                .filter(|(key, _)| !keys.contains(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };

        Self {
            general: self.general.clone(),
            data: strip(&self.data),
            preprocessing: strip(&self.preprocessing),
            output: strip(&self.output),
            solve: strip(&self.solve),
        }
    }

    /// `<base>/<experiment>/03_predict/<setup>/<iteration>/<sample>/<stage>/<identity>`
    pub fn work_dir(&self, settings: &Settings, stage: Stage, id: TaskIdentity) -> Utf8PathBuf {
        self.general
            .predict_dir(settings)
            .join(&self.general.sample)
            .join(stage.name())
            .join(id.to_hex())
    }
}

fn to_object(map: &ParamMap) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}
