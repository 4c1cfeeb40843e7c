//! Parameter grids and their expansion into concrete configurations.
//!
//! A grid is made of five independent parameter groups. Any parameter named
//! in the grid's range keys holds a list of candidate values instead of a
//! single value; expanding the grid produces one configuration for every
//! combination of candidates.

use std::fmt::Display;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ParamMap;
use crate::error::ConfigError;

/// The five parameter groups of a grid, in expansion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    General,
    Data,
    Preprocessing,
    Output,
    Solve,
}

impl Group {
    pub const ALL: [Group; 5] = [
        Group::General,
        Group::Data,
        Group::Preprocessing,
        Group::Output,
        Group::Solve,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Group::General => "general",
            Group::Data => "data",
            Group::Preprocessing => "preprocessing",
            Group::Output => "output",
            Group::Solve => "solve",
        }
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Argument vectors of the external programs run by each stage.
///
/// A missing command marks a stage that is not wired up yet; dispatching a
/// task of that stage fails with [`DispatchError::NotImplemented`].
///
/// [`DispatchError::NotImplemented`]: crate::DispatchError::NotImplemented
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commands {
    #[serde(default)]
    pub processing: Option<Vec<String>>,
    #[serde(default)]
    pub evaluation: Option<Vec<String>>,
}

/// The full description of a batch of experiments.
///
/// This is usually read from a JSON file:
///
/// ```json
/// {
///   "general": { "experiment": "cremi", "setup": ["setup01", "setup02"],
///                "iteration": [300000, 400000], "sample": "sample_C.n5" },
///   "preprocessing": { "gaussian_sigma_single": [0.1, 0.2] },
///   "solve": { "cc_min_vertices": [4, 5, 6] },
///   "range_keys": ["setup", "iteration", "gaussian_sigma_single", "cc_min_vertices"]
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridSpec {
    pub general: ParamMap,
    #[serde(default)]
    pub data: ParamMap,
    #[serde(default)]
    pub preprocessing: ParamMap,
    #[serde(default)]
    pub output: ParamMap,
    #[serde(default)]
    pub solve: ParamMap,
    /// Names of the parameters to explode. The first one listed varies the
    /// slowest.
    #[serde(default)]
    pub range_keys: Vec<String>,
    /// Parameters that only influence the evaluation stage. They are left out
    /// of the processing stage's identity, so evaluations that differ only in
    /// these share a single processing task.
    #[serde(default)]
    pub evaluation_only: Vec<String>,
    #[serde(default)]
    pub commands: Commands,
    /// CPUs requested for every job, overrides [`Settings::cpus`].
    ///
    /// [`Settings::cpus`]: crate::Settings::cpus
    #[serde(default)]
    pub cpus: Option<u32>,
}

impl GridSpec {
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }

    pub fn group(&self, group: Group) -> &ParamMap {
        match group {
            Group::General => &self.general,
            Group::Data => &self.data,
            Group::Preprocessing => &self.preprocessing,
            Group::Output => &self.output,
            Group::Solve => &self.solve,
        }
    }

    /// Explodes every group with the range keys it contains.
    ///
    /// A range key that no group contains is rejected rather than ignored.
    pub fn explode_all(&self) -> Result<ExplodedGrid, ConfigError> {
        for key in &self.range_keys {
            let used = Group::ALL
                .iter()
                .any(|&group| self.group(group).contains_key(key));

            if !used {
                return Err(ConfigError::UnusedRangeKey(key.clone()));
            }
        }

        let explode_group = |group: Group| {
            let params = self.group(group);
            let keys: Vec<&str> = self
                .range_keys
                .iter()
                .map(String::as_str)
                .filter(|key| params.contains_key(*key))
                .collect();

            explode_named(group.name(), params, &keys)
        };

        let grid = ExplodedGrid {
            general: explode_group(Group::General)?,
            data: explode_group(Group::Data)?,
            preprocessing: explode_group(Group::Preprocessing)?,
            output: explode_group(Group::Output)?,
            solve: explode_group(Group::Solve)?,
        };

        match grid.checked_len() {
            Some(_) => Ok(grid),
            None => Err(ConfigError::TooManyCombinations("grid".to_string())),
        }
    }
}

/// One concrete configuration from each group.
#[derive(Debug, Clone, Copy)]
pub struct Combination<'a> {
    pub general: &'a ParamMap,
    pub data: &'a ParamMap,
    pub preprocessing: &'a ParamMap,
    pub output: &'a ParamMap,
    pub solve: &'a ParamMap,
}

/// Every group of a grid, each expanded into its concrete configurations.
#[derive(Debug, Clone, Default)]
pub struct ExplodedGrid {
    pub general: Vec<ParamMap>,
    pub data: Vec<ParamMap>,
    pub preprocessing: Vec<ParamMap>,
    pub output: Vec<ParamMap>,
    pub solve: Vec<ParamMap>,
}

impl ExplodedGrid {
    /// Number of combinations across all five groups, `None` on overflow.
    pub fn checked_len(&self) -> Option<usize> {
        [
            self.data.len(),
            self.preprocessing.len(),
            self.output.len(),
            self.solve.len(),
        ]
        .into_iter()
        .try_fold(self.general.len(), usize::checked_mul)
    }

    /// Number of combinations across all five groups.
    ///
    /// Saturates at `usize::MAX`, grids built by [`GridSpec::explode_all`]
    /// never get there.
    pub fn len(&self) -> usize {
        self.checked_len().unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cross product general × data × preprocessing × output × solve, with
    /// the general configurations varying the slowest.
    pub fn combinations(&self) -> Vec<Combination<'_>> {
        let mut acc = Vec::with_capacity(self.len());

        for general in &self.general {
            for data in &self.data {
                for preprocessing in &self.preprocessing {
                    for output in &self.output {
                        for solve in &self.solve {
                            acc.push(Combination {
                                general,
                                data,
                                preprocessing,
                                output,
                                solve,
                            });
                        }
                    }
                }
            }
        }

        acc
    }
}

/// Explodes a single parameter group over the given range keys.
///
/// Every returned configuration holds exactly one candidate for each range
/// key and a copy of every other parameter. Candidates are combined like
/// nested loops: the first range key is the outermost loop. With no range
/// keys the group is returned unchanged as the only configuration.
pub fn explode<S: AsRef<str>>(
    group: &ParamMap,
    range_keys: &[S],
) -> Result<Vec<ParamMap>, ConfigError> {
    let keys: Vec<&str> = range_keys.iter().map(AsRef::as_ref).collect();
    explode_named("given", group, &keys)
}

fn explode_named(
    name: &str,
    group: &ParamMap,
    range_keys: &[&str],
) -> Result<Vec<ParamMap>, ConfigError> {
    let mut ranged: Vec<(&str, &[Value])> = Vec::with_capacity(range_keys.len());

    for &key in range_keys {
        if ranged.iter().any(|(seen, _)| *seen == key) {
            continue;
        }

        match group.get(key) {
            Some(Value::Array(candidates)) => ranged.push((key, candidates)),
            Some(other) => {
                return Err(ConfigError::RangeKeyNotSequence {
                    group: name.to_string(),
                    key: key.to_string(),
                    found: other.to_string(),
                });
            }
            None => {
                return Err(ConfigError::MissingRangeKey {
                    group: name.to_string(),
                    key: key.to_string(),
                });
            }
        }
    }

    let fixed: ParamMap = group
        .iter()
        .filter(|(key, _)| !ranged.iter().any(|(r, _)| *r == key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let total = ranged
        .iter()
        .try_fold(1usize, |acc, (_, c)| acc.checked_mul(c.len()))
        .ok_or_else(|| ConfigError::TooManyCombinations(name.to_string()))?;
    let mut exploded = Vec::with_capacity(total);

    for n in 0..total {
        // Mixed-radix counter, the last key is the least significant digit.
        let mut rest = n;
        let mut config = fixed.clone();

        for (key, candidates) in ranged.iter().rev() {
            let i = rest % candidates.len();
            rest /= candidates.len();
            config.insert(key.to_string(), candidates[i].clone());
        }

        exploded.push(config);
    }

    Ok(exploded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> ParamMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_no_range_keys() {
        let group = params(json!({ "a": 1, "b": [1, 2] }));
        let exploded = explode::<&str>(&group, &[]).unwrap();
        assert_eq!(exploded, vec![group]);
    }

    #[test]
    fn test_product_size_and_pass_through() {
        let group = params(json!({
            "x": [1, 2, 3],
            "y": ["a", "b"],
            "roi": [0, 100],
            "mode": "single",
        }));

        let exploded = explode(&group, &["x", "y"]).unwrap();
        assert_eq!(exploded.len(), 6);

        for config in &exploded {
            assert_eq!(config.len(), 4);
            assert_eq!(config["roi"], json!([0, 100]));
            assert_eq!(config["mode"], json!("single"));
            assert!(config["x"].is_number());
            assert!(config["y"].is_string());
        }

        let unique: std::collections::HashSet<_> =
            exploded.iter().map(|c| (c["x"].to_string(), c["y"].to_string())).collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_first_key_varies_slowest() {
        let group = params(json!({ "x": [1, 2], "y": ["a", "b"] }));

        let order: Vec<_> = explode(&group, &["x", "y"])
            .unwrap()
            .iter()
            .map(|c| (c["x"].clone(), c["y"].clone()))
            .collect();

        assert_eq!(
            order,
            vec![
                (json!(1), json!("a")),
                (json!(1), json!("b")),
                (json!(2), json!("a")),
                (json!(2), json!("b")),
            ]
        );

        let swapped: Vec<_> = explode(&group, &["y", "x"])
            .unwrap()
            .iter()
            .map(|c| (c["x"].clone(), c["y"].clone()))
            .collect();

        assert_eq!(swapped[1], (json!(2), json!("a")));
    }

    #[test]
    fn test_duplicate_range_key_counts_once() {
        let group = params(json!({ "x": [1, 2] }));
        assert_eq!(explode(&group, &["x", "x"]).unwrap().len(), 2);
    }

    #[test]
    fn test_overflowing_product_is_rejected() {
        let mut group = ParamMap::new();
        let mut keys = Vec::new();
        for i in 0..usize::BITS {
            let key = format!("k{i}");
            group.insert(key.clone(), json!([0, 1]));
            keys.push(key);
        }

        let err = explode(&group, &keys).unwrap_err();
        assert!(matches!(err, ConfigError::TooManyCombinations(_)));
    }

    #[test]
    fn test_exploded_grid_len_saturates() {
        let grid = ExplodedGrid {
            general: vec![ParamMap::new(); 2],
            data: vec![ParamMap::new(); 2],
            preprocessing: vec![ParamMap::new(); 2],
            output: vec![ParamMap::new(); 2],
            solve: vec![ParamMap::new(); 2],
        };
        assert_eq!(grid.checked_len(), Some(32));
        assert_eq!(grid.len(), 32);
    }

    #[test]
    fn test_empty_candidates() {
        let group = params(json!({ "x": [], "y": [1, 2] }));
        assert!(explode(&group, &["x", "y"]).unwrap().is_empty());
    }

    #[test]
    fn test_missing_range_key() {
        let group = params(json!({ "x": [1, 2] }));
        let err = explode(&group, &["z"]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRangeKey { ref key, .. } if key == "z"));
    }

    #[test]
    fn test_range_key_not_a_list() {
        let group = params(json!({ "x": 3 }));
        let err = explode(&group, &["x"]).unwrap_err();
        assert!(matches!(err, ConfigError::RangeKeyNotSequence { .. }));
    }

    #[test]
    fn test_explode_all_per_group() {
        let spec = GridSpec {
            general: params(json!({
                "experiment": "cremi",
                "setup": ["setup01", "setup02"],
                "iteration": [300000, 400000],
                "sample": "sample_C",
            })),
            solve: params(json!({ "cc_min_vertices": [4, 5, 6] })),
            range_keys: vec!["setup".into(), "iteration".into(), "cc_min_vertices".into()],
            ..Default::default()
        };

        let grid = spec.explode_all().unwrap();
        assert_eq!(grid.general.len(), 4);
        assert_eq!(grid.data, vec![ParamMap::new()]);
        assert_eq!(grid.solve.len(), 3);
        assert_eq!(grid.len(), 12);

        let combinations = grid.combinations();
        assert_eq!(combinations.len(), 12);
        assert_eq!(combinations[0].general["setup"], json!("setup01"));
        assert_eq!(combinations[0].solve["cc_min_vertices"], json!(4));
        assert_eq!(combinations[1].solve["cc_min_vertices"], json!(5));
        assert_eq!(combinations[11].general["setup"], json!("setup02"));
    }

    #[test]
    fn test_explode_all_unused_range_key() {
        let spec = GridSpec {
            general: params(json!({ "experiment": "cremi" })),
            range_keys: vec!["typo".into()],
            ..Default::default()
        };

        let err = spec.explode_all().unwrap_err();
        assert!(matches!(err, ConfigError::UnusedRangeKey(ref key) if key == "typo"));
    }

    #[test]
    fn test_spec_from_json() {
        let spec: GridSpec = serde_json::from_value(json!({
            "general": { "experiment": "cremi" },
            "range_keys": [],
            "commands": { "processing": ["python", "track.py"] }
        }))
        .unwrap();

        assert!(spec.solve.is_empty());
        assert_eq!(
            spec.commands.processing,
            Some(vec!["python".to_string(), "track.py".to_string()])
        );
        assert_eq!(spec.commands.evaluation, None);
    }
}
