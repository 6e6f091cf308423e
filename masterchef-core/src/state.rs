//! On-disk state: run records and JSON snapshot helpers.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{ControlError, Result};
use crate::runner::RunRecord;
use crate::store::RecordSource;

/// Owner of the state directory.
///
/// Run records are written once by the worker that produced them; snapshot
/// files are written by the store that owns them. Every write goes through a
/// temp file in the same directory followed by an atomic rename.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("runs"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a snapshot file under the state root, e.g. `rules.json`.
    pub fn snapshot_path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn save_run(&self, record: &RunRecord) -> Result<()> {
        validate_id(&record.id)?;
        write_json_atomic(&self.runs_dir().join(format!("{}.json", record.id)), record)
    }

    pub fn load_run(&self, id: &str) -> Result<RunRecord> {
        validate_id(id)?;
        read_json(&self.runs_dir().join(format!("{id}.json")))?
            .ok_or_else(|| ControlError::NotFound(format!("run {id}")))
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(self.runs_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<RunRecord>(&path) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable run record");
                }
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }
}

impl RecordSource for StateStore {
    fn list_records(&self) -> Vec<Map<String, Value>> {
        match self.list_runs(usize::MAX) {
            Ok(runs) => runs
                .into_iter()
                .filter_map(|run| match serde_json::to_value(run) {
                    Ok(Value::Object(map)) => Some(map),
                    _ => None,
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "cannot list run records");
                Vec::new()
            }
        }
    }
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ControlError::InvalidRequest(format!("invalid record id {id:?}")))
    }
}

/// Serialises `value` next to `path` and renames it into place.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| ControlError::Io(err.error))?;
    Ok(())
}

/// Reads a JSON file; a missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
