use camino::Utf8PathBuf;
use thiserror::Error;

/// Top-level error returned by graph construction and execution.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("Invalid grid configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("External store unavailable, re-run the grid once it is reachable:\n{0}")]
    StoreUnavailable(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("Task '{0}':\n{1}")]
    Dispatch(String, DispatchError),

    #[error("Couldn't write configuration for task '{0}':\n{1}")]
    Artifact(String, serde_json::Error),

    #[error("Couldn't write '{0}'.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Task '{0}' panicked: {1}")]
    Panic(String, String),

    #[error("Couldn't build worker pool:\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Task graph contains a cycle")]
    Cycle,
}

impl GridError {
    /// Whether the whole run should simply be invoked again later.
    ///
    /// Nothing about completion state can be concluded from a retryable
    /// error, tasks that were reached before it are recorded in the store and
    /// will be skipped by the next run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::StoreUnavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Range key '{key}' not found in the {group} parameters")]
    MissingRangeKey { group: String, key: String },

    #[error("Range key '{key}' in the {group} parameters must be a list of candidates, got {found}")]
    RangeKeyNotSequence {
        group: String,
        key: String,
        found: String,
    },

    #[error("Range key '{0}' is not used by any parameter group")]
    UnusedRangeKey(String),

    #[error("Missing required parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("Parameter '{key}' must be {expected}, got {found}")]
    InvalidParameter {
        key: String,
        expected: &'static str,
        found: String,
    },

    #[error("Unknown general parameter '{0}'")]
    UnknownParameter(String),

    #[error("General parameter '{0}' can't be evaluation-only")]
    EvaluationOnlyGeneral(String),

    #[error("Evaluation-only key '{0}' is not used by any parameter group")]
    UnusedEvaluationOnlyKey(String),

    #[error("The {0} parameters expand to more combinations than can be counted")]
    TooManyCombinations(String),

    #[error("Couldn't resolve base directory '{0}'.\n{1}")]
    BaseDir(Utf8PathBuf, std::io::Error),

    #[error("Couldn't read grid file '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse grid file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store at '{0}' is unreachable")]
    Unreachable(String),

    #[error("Couldn't access '{0}'.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Malformed document '{0}'.\n{1}")]
    Document(Utf8PathBuf, serde_json::Error),
}

#[derive(Debug, Error)]
#[error("Couldn't create directory '{path}'.\n{source}")]
pub struct DirectoryError {
    pub path: Utf8PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No {0} command configured, this pipeline stage is not wired up yet")]
    NotImplemented(&'static str),

    #[error("Empty command line")]
    EmptyCommand,

    #[error("Couldn't open log file '{0}'.\n{1}")]
    Log(Utf8PathBuf, std::io::Error),

    #[error("Couldn't launch '{0}'.\n{1}")]
    Spawn(String, std::io::Error),
}
