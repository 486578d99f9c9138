/// The `apps.json` document: one record per detected process, keyed by pid.
///
/// ```text
/// {
///   "apps": {
///     "<pid>": { "pid": <int>, "name": "<path>", "GUI": <bool>, "service": <bool> }
///   }
/// }
/// ```
///
/// The document is always rebuilt from the full in-memory snapshot and swapped
/// into place with a rename, so readers never observe a half-written file.
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// A verified, classified, still-running process at the time it was seen.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Full image path of the executable.
    pub name: String,
    #[serde(rename = "GUI")]
    pub is_gui: bool,
    #[serde(rename = "service")]
    pub is_service: bool,
}

/// Insertion-ordered map of pid → [`ProcessRecord`].
///
/// Re-inserting a pid replaces its record in place (last write wins) and keeps
/// the position it was first inserted at.
#[derive(Debug, Default, Clone)]
pub struct ProcessSnapshot {
    records: Vec<ProcessRecord>,
    index: HashMap<u32, usize>,
}

impl ProcessSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the record for `record.pid`, returning the
    /// previous record if there was one.
    pub fn insert(&mut self, record: ProcessRecord) -> Option<ProcessRecord> {
        match self.index.get(&record.pid) {
            Some(&slot) => Some(std::mem::replace(&mut self.records[slot], record)),
            None => {
                self.index.insert(record.pid, self.records.len());
                self.records.push(record);
                None
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, pid: u32) -> Option<&ProcessRecord> {
        self.index.get(&pid).map(|&slot| &self.records[slot])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.iter()
    }
}

impl Serialize for ProcessSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.records.len()))?;
        for record in self.iter() {
            map.serialize_entry(&record.pid.to_string(), record)?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct AppsDocument<'a> {
    apps: &'a ProcessSnapshot,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Renders `snapshot` as the pretty-printed `apps.json` document.
pub fn render(snapshot: &ProcessSnapshot) -> Result<String, DocumentError> {
    let mut content = serde_json::to_string_pretty(&AppsDocument { apps: snapshot })?;
    content.push('\n');
    Ok(content)
}

/// Serializes `snapshot` and replaces the file at `path` with it.
///
/// The content is written to a temporary file next to `path` and renamed over
/// it, so the previous document stays intact if anything fails.
pub fn write_document(path: &Path, snapshot: &ProcessSnapshot) -> Result<(), DocumentError> {
    let content = render(snapshot)?;
    let io_err = |source| DocumentError::Io {
        path: path.display().to_string(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut file = tempfile::Builder::new()
        .prefix(".apps-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(io_err)?;
    file.write_all(content.as_bytes()).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
