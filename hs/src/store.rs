//! Atomic JSON read/write primitives
//!
//! All writes go through a per-path in-process mutex and land via a temp
//! sibling plus atomic rename. Reads return the typed default for absent
//! or malformed files so callers never branch on storage errors.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::StoreError;

/// Registry of per-path write mutexes
///
/// Two tasks in the same process writing the same file serialize here;
/// distinct paths proceed in parallel.
fn path_mutex(path: &Path) -> Arc<Mutex<()>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().expect("path mutex registry poisoned");
    map.entry(path.to_path_buf()).or_default().clone()
}

/// Read a JSON file into `T`, returning `T::default()` when the file is
/// absent or unparsable. Malformed content is logged and treated as absent.
pub fn read_json_or_default<T>(path: impl AsRef<Path>) -> T
where
    T: DeserializeOwned + Default,
{
    read_json_opt(path).unwrap_or_default()
}

/// Read a JSON file into `Option<T>`: `None` when absent or malformed.
pub fn read_json_opt<T>(path: impl AsRef<Path>) -> Option<T>
where
    T: DeserializeOwned,
{
    let path = path.as_ref();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "read_json_opt: file absent");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "read_json_opt: read failed, treating as absent");
            return None;
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "read_json_opt: malformed JSON, treating as absent");
            None
        }
    }
}

/// Write `value` as pretty JSON via a temp sibling and atomic rename
pub fn write_json_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<(), StoreError> {
    let path = path.as_ref();
    let guard = path_mutex(path);
    let _held = guard.lock().expect("path mutex poisoned");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let json = serde_json::to_string_pretty(value)?;

    // Temp sibling carries the pid so concurrent processes never collide
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "entity".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    fs::write(&tmp, json.as_bytes()).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })?;

    debug!(path = %path.display(), "write_json_atomic: wrote");
    Ok(())
}

/// List files in `dir` ending with `suffix`, sorted by filename
///
/// A missing directory is an empty listing, not an error.
pub fn list_files_with_suffix(dir: impl AsRef<Path>, suffix: &str) -> Vec<PathBuf> {
    let dir = dir.as_ref();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(suffix))
                    .unwrap_or(false)
        })
        .collect();

    files.sort();
    files
}
