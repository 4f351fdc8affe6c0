//! HubStore - durable file-per-entity storage for AgentHub
//!
//! Every entity is a JSON file under a well-known path in the data
//! directory. Writes are atomic (temp sibling + rename) and serialized
//! through a per-path mutex; reads never fail (absent or malformed files
//! yield the typed default). Cross-process coordination uses a PID lock
//! file with stale-holder takeover.

pub mod jsonl;
pub mod lock;
pub mod paths;
pub mod store;

mod error;

pub use error::StoreError;
pub use jsonl::{append_jsonl, read_jsonl};
pub use lock::{FileLock, LockGuard, LOCK_TIMEOUT_MS};
pub use paths::DataDir;
pub use store::{list_files_with_suffix, read_json_or_default, read_json_opt, write_json_atomic};

/// Current unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
