//! Checkpoint/restart manager.
//!
//! One checkpoint is written per accepted optimizer iteration. A checkpoint
//! is a durable JSON record with two logical groups: the optimizer state
//! (an explicit, versioned [`MethodRecord`] schema -- never "all attributes
//! except some name pattern", so that adding a field cannot silently break
//! old checkpoints) and a flat map of process attributes. Absent values are
//! stored as explicit `null`, never omitted.
//!
//! Restarting is an explicit caller decision: [`CheckpointStore::load_latest`]
//! returns the newest record (or `None` for a normal fresh start) and the
//! caller reconstructs the optimizer from it. Fields that cannot be
//! checkpointed -- communicator handles, callables -- are excluded by
//! construction and must be re-supplied by the caller after a restore.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the checkpoint and partial-record schema.
pub const SCHEMA_VERSION: u32 = 1;

/// Error of the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem access failed.
    #[error("failed to access {path:?}")]
    Io {
        /// The path that could not be accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// Encoding or decoding the record failed.
    #[error("failed to encode or decode checkpoint {path:?}")]
    Codec {
        /// The record path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// The record was written by an incompatible schema version.
    #[error("checkpoint {path:?} has schema version {found}, expected {expected}")]
    SchemaMismatch {
        /// The record path.
        path: PathBuf,
        /// Version found in the record.
        found: u32,
        /// Version this build expects.
        expected: u32,
    },
}

/// Explicit persistence schema of the SPG2 optimizer state.
///
/// Ring-buffer slots that have not been filled yet hold negative infinity in
/// memory; they are stored as `None` (JSON `null`) since JSON has no
/// representation for non-finite floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRecord {
    /// Number of accepted iterations.
    pub iteration: usize,
    /// Number of objective evaluations.
    pub fn_evals: usize,
    /// Number of gradient evaluations.
    pub grad_evals: usize,
    /// Current candidate perturbation.
    pub perturbation: Vec<f64>,
    /// Gradient at the current candidate.
    pub gradient: Vec<f64>,
    /// Best perturbation found so far.
    pub best_perturbation: Vec<f64>,
    /// Objective value of the best perturbation.
    pub best_objective: f64,
    /// Recent objective window for the non-monotone line search; `None`
    /// marks a slot that has not been filled yet.
    pub recent_objectives: Vec<Option<f64>>,
    /// Spectral step length.
    pub step_length: f64,
    /// Stationarity measure at the current candidate.
    pub stationarity_norm: f64,
    /// Objective value at the current candidate.
    pub objective: f64,
    /// Whether the initial objective and gradient have been evaluated.
    pub initialized: bool,
}

/// Durable snapshot of one accepted optimizer iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version of this record.
    pub schema: u32,
    /// Iteration this record belongs to.
    pub iteration: usize,
    /// Optimizer state.
    pub method: MethodRecord,
    /// Flat mapping of process attributes, as produced by
    /// [`Process::snapshot`](crate::Process::snapshot).
    pub process: BTreeMap<String, serde_json::Value>,
}

/// Builds one process snapshot entry, degrading to an explicit `null` with
/// a warning when the value cannot be serialized.
///
/// Checkpointing is a best-effort resiliency feature; a field that cannot
/// be represented must not fail the run, but it must leave a trace.
pub fn process_entry<T: Serialize>(name: &str, value: &T) -> (String, serde_json::Value) {
    match serde_json::to_value(value) {
        Ok(value) => (name.to_owned(), value),
        Err(error) => {
            warn!("skipping process field `{name}` in checkpoint: {error}");
            (name.to_owned(), serde_json::Value::Null)
        }
    }
}

/// Store of checkpoints in a directory, named and ordered by iteration.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Creates a store over the given directory. The directory is created
    /// lazily on the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Gets the directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, iteration: usize) -> PathBuf {
        self.dir.join(format!("checkpoint_{iteration:06}.json"))
    }

    /// Writes the checkpoint for its iteration. The write is atomic
    /// (write-then-rename), so a crash cannot leave a half-written record
    /// that would later be mistaken for the latest state.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let path = self.path_for(checkpoint.iteration);

        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let bytes =
            serde_json::to_vec_pretty(checkpoint).map_err(|source| CheckpointError::Codec {
                path: path.clone(),
                source,
            })?;

        write_atomic(&path, &bytes).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }

    /// Loads the checkpoint with the highest iteration number, or `None`
    /// when the directory holds no checkpoint. Absence is a normal fresh
    /// start, not a failure.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut latest: Option<(usize, PathBuf)> = None;

        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();

            if let Some(iteration) = parse_iteration(&path) {
                if latest.as_ref().map_or(true, |(it, _)| iteration > *it) {
                    latest = Some((iteration, path));
                }
            }
        }

        let Some((named_iteration, path)) = latest else {
            return Ok(None);
        };

        let bytes = fs::read(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Codec {
                path: path.clone(),
                source,
            })?;

        if checkpoint.schema != SCHEMA_VERSION {
            return Err(CheckpointError::SchemaMismatch {
                path,
                found: checkpoint.schema,
                expected: SCHEMA_VERSION,
            });
        }

        if checkpoint.iteration != named_iteration {
            warn!(
                "checkpoint {path:?} embeds iteration {} but is named for {named_iteration}",
                checkpoint.iteration
            );
        }

        Ok(Some(checkpoint))
    }
}

/// Extracts the iteration number from a `checkpoint_<iteration>.json` name.
fn parse_iteration(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let number = name.strip_prefix("checkpoint_")?.strip_suffix(".json")?;
    number.parse().ok()
}

/// Writes bytes to the path atomically via a temporary sibling and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::env;

    fn scratch(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("cnop-checkpoint-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn record(iteration: usize) -> Checkpoint {
        Checkpoint {
            schema: SCHEMA_VERSION,
            iteration,
            method: MethodRecord {
                iteration,
                fn_evals: 3,
                grad_evals: 2,
                perturbation: vec![0.1, -0.2],
                gradient: vec![1.0, 2.0],
                best_perturbation: vec![0.1, -0.2],
                best_objective: -4.5,
                recent_objectives: vec![Some(-4.5), None, None],
                step_length: 0.25,
                stationarity_norm: 0.3,
                objective: -4.5,
                initialized: true,
            },
            process: BTreeMap::from([
                ("t0".to_owned(), serde_json::json!(2.0)),
                ("basename".to_owned(), serde_json::Value::Null),
            ]),
        }
    }

    #[test]
    fn empty_directory_is_a_fresh_start() {
        let store = CheckpointStore::new(scratch("fresh"));
        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn round_trip_is_idempotent() {
        let store = CheckpointStore::new(scratch("roundtrip"));
        let checkpoint = record(4);

        store.save(&checkpoint).unwrap();
        let loaded = store.load_latest().unwrap().unwrap();

        assert_eq!(loaded.iteration, 4);
        assert_eq!(loaded.method, checkpoint.method);
        assert_eq!(loaded.process, checkpoint.process);

        // Saving the loaded record again reproduces the same bytes.
        let path = store.save(&loaded).unwrap();
        let reloaded = store.load_latest().unwrap().unwrap();
        assert_eq!(reloaded.method, checkpoint.method);
        assert_eq!(
            fs::read(&path).unwrap(),
            serde_json::to_vec_pretty(&loaded).unwrap()
        );
    }

    #[test]
    fn latest_wins() {
        let store = CheckpointStore::new(scratch("latest"));

        store.save(&record(1)).unwrap();
        store.save(&record(12)).unwrap();
        store.save(&record(3)).unwrap();

        let loaded = store.load_latest().unwrap().unwrap();
        assert_eq!(loaded.iteration, 12);
    }

    #[test]
    fn unserializable_process_entry_degrades_to_null() {
        // A map with non-string keys cannot be represented in JSON.
        let bad: BTreeMap<Vec<u8>, f64> = BTreeMap::from([(vec![1], 2.0)]);
        let (name, value) = process_entry("weird", &bad);

        assert_eq!(name, "weird");
        assert_eq!(value, serde_json::Value::Null);
    }
}
