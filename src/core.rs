use std::collections::BTreeMap;
use std::fmt::Write;
use std::io;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::ConfigError;

/// A named group of parameters, e.g. the `solve` parameters of a grid.
///
/// Values are arbitrary JSON values. Keys are kept sorted, which makes every
/// map traversal in this crate deterministic.
pub type ParamMap = BTreeMap<String, Value>;

/// A 32-byte BLAKE3 digest identifying a task by the content of its essential
/// parameters.
///
/// This serves three purposes:
/// 1. Graph-level deduplication, two tasks with the same identity are the same
///    node.
/// 2. Resumability, completion records in the store are keyed by it.
/// 3. Output paths, every task works in a directory named after it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TaskIdentity([u8; 32]);

impl<T> From<T> for TaskIdentity
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        TaskIdentity(value.into())
    }
}

impl TaskIdentity {
    /// Computes the identity of a parameter set.
    ///
    /// The set is first written in canonical form (see [`canonical_json`]), so
    /// the result does not depend on the order in which keys were inserted,
    /// and then hashed.
    pub fn of(params: &Value) -> Self {
        Self::hash(canonical_json(params))
    }

    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// The first 12 hex characters, for log lines.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Debug for TaskIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskIdentity({})", self.to_hex())
    }
}

impl std::fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for TaskIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Shorthand for [`TaskIdentity::of`].
pub fn identity_of(params: &Value) -> TaskIdentity {
    TaskIdentity::of(params)
}

/// Writes a value in canonical textual form.
///
/// Object keys are emitted in lexicographic order at every nesting level,
/// arrays keep their order, strings are JSON-quoted and numbers use the
/// shortest round-trip representation. Because strings are always quoted,
/// `4` and `"4"` never encode the same way.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_quoted(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_quoted(out, key);
                out.push(':');
                write_canonical(out, item);
            }
            out.push('}');
        }
    }
}

fn write_quoted(out: &mut String, s: &str) {
    let _ = write!(out, "{}", Value::String(s.to_owned()));
}

/// Operational settings for one invocation.
///
/// None of these values are essential parameters, changing them never changes
/// a task identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory that holds the experiment directories.
    pub base_dir: Utf8PathBuf,
    /// Number of tasks that may run at the same time.
    pub workers: usize,
    /// CPU hint passed to the execution backend for every job.
    pub cpus: u32,
}

impl Settings {
    /// A copy with `base_dir` made absolute against the current directory.
    ///
    /// Jobs run inside their own work directory, so every path handed to them
    /// has to be absolute. The directory doesn't have to exist yet.
    pub fn absolute(&self) -> Result<Settings, ConfigError> {
        let base_dir = std::path::absolute(&self.base_dir)
            .and_then(|path| {
                Utf8PathBuf::from_path_buf(path).map_err(|path| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("non UTF-8 path '{}'", path.display()),
                    )
                })
            })
            .map_err(|e| ConfigError::BaseDir(self.base_dir.clone(), e))?;

        Ok(Settings {
            base_dir,
            ..self.clone()
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_dir: Utf8PathBuf::from("."),
            workers: 10,
            cpus: 5,
        }
    }
}
