//! Append-only JSONL logs
//!
//! One complete JSON object per line, flushed on every append. Appends are
//! serialized per file by the same per-path mutex the JSON writer uses.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::StoreError;

fn append_mutex(path: &Path) -> Arc<Mutex<()>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().expect("jsonl mutex registry poisoned");
    map.entry(path.to_path_buf()).or_default().clone()
}

/// Append one entry as a single JSON line, creating the file as needed
pub fn append_jsonl<T: Serialize>(path: impl AsRef<Path>, entry: &T) -> Result<(), StoreError> {
    let path = path.as_ref();
    let guard = append_mutex(path);
    let _held = guard.lock().expect("jsonl mutex poisoned");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let line = serde_json::to_string(entry)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    writeln!(file, "{}", line).map_err(|e| StoreError::io(path, e))?;
    file.flush().map_err(|e| StoreError::io(path, e))?;

    Ok(())
}

/// Read every parsable entry from a JSONL file
///
/// A missing file is an empty list. Malformed lines are logged and skipped;
/// a torn final line from a crash must not poison the rest of the log.
pub fn read_jsonl<T: DeserializeOwned>(path: impl AsRef<Path>) -> Vec<T> {
    let path = path.as_ref();
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return Vec::new(),
    };

    let mut entries = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "read_jsonl: read error, stopping");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(path = %path.display(), lineno, error = %e, "read_jsonl: skipping malformed line");
            }
        }
    }
    entries
}
