//! Chat session manager
//!
//! Tracks one backend conversation session per external chat, with LRU
//! eviction, TTL purge, and a per-chat serial queue so messages within a
//! chat never interleave while different chats proceed in parallel. The
//! whole map persists to `sessions.json` after every mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hubstore::{DataDir, now_ms, read_json_or_default, write_json_atomic};

use crate::config::SessionsConfig;

/// Cleanup timer period
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-chat conversation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    /// Opaque backend session id; empty for placeholder entries that only
    /// carry overrides
    pub session_id: String,

    /// Unix ms of last activity
    pub last_active_at: i64,

    pub turn_count: u32,

    pub estimated_tokens: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_override: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_backend_type: Option<String>,
}

/// The session manager
pub struct SessionManager {
    data: DataDir,
    config: SessionsConfig,
    sessions: Mutex<HashMap<String, ChatSession>>,
    /// Per-chat serialization locks
    chat_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    /// Load sessions from disk, dropping entries already expired
    pub fn load(data: DataDir, config: SessionsConfig) -> Self {
        let raw: HashMap<String, ChatSession> = read_json_or_default(data.sessions_file());
        let timeout_ms = config.timeout_minutes as i64 * 60_000;
        let now = now_ms();

        let sessions: HashMap<String, ChatSession> = raw
            .into_iter()
            .filter(|(_, s)| now - s.last_active_at < timeout_ms)
            .collect();

        info!(count = sessions.len(), "SessionManager: loaded sessions");
        Self {
            data,
            config,
            sessions: Mutex::new(sessions),
            chat_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn timeout_ms(&self) -> i64 {
        self.config.timeout_minutes as i64 * 60_000
    }

    fn persist(&self, sessions: &HashMap<String, ChatSession>) {
        if let Err(e) = write_json_atomic(self.data.sessions_file(), sessions) {
            warn!(error = %e, "SessionManager: persist failed");
        }
    }

    /// Create or refresh a chat's session
    ///
    /// The same session id refreshes in place (counters preserved); a new
    /// session id resets the counters. Overrides always carry through.
    pub fn set_session(&self, chat_id: &str, session_id: &str, backend_type: Option<&str>) {
        let mut sessions = self.sessions.lock().expect("session map poisoned");

        let existing = sessions.get(chat_id).cloned().unwrap_or_default();
        let same_session = existing.session_id == session_id;

        let updated = ChatSession {
            session_id: session_id.to_string(),
            last_active_at: now_ms(),
            turn_count: if same_session { existing.turn_count } else { 0 },
            estimated_tokens: if same_session { existing.estimated_tokens } else { 0 },
            model_override: existing.model_override,
            backend_override: existing.backend_override,
            session_backend_type: backend_type
                .map(|s| s.to_string())
                .or(existing.session_backend_type),
        };
        sessions.insert(chat_id.to_string(), updated);

        self.evict_over_capacity(&mut sessions);
        self.persist(&sessions);
    }

    /// Oldest-by-activity entries fall out when over capacity
    fn evict_over_capacity(&self, sessions: &mut HashMap<String, ChatSession>) {
        while sessions.len() > self.config.max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_active_at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    debug!(chat_id = %id, "SessionManager: evicting LRU session");
                    sessions.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Fetch a session, purging it lazily if expired
    pub fn get_session(&self, chat_id: &str) -> Option<ChatSession> {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let session = sessions.get(chat_id)?;

        if now_ms() - session.last_active_at >= self.timeout_ms() {
            debug!(chat_id, "SessionManager: purging expired session");
            sessions.remove(chat_id);
            self.persist(&sessions);
            return None;
        }
        Some(session.clone())
    }

    /// Account one conversation turn; no-op when the chat is unknown
    pub fn increment_turn(&self, chat_id: &str, input_tokens: u64, output_tokens: u64) {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let Some(session) = sessions.get_mut(chat_id) else {
            return;
        };
        session.turn_count += 1;
        session.estimated_tokens += input_tokens + output_tokens;
        session.last_active_at = now_ms();
        self.persist(&sessions);
    }

    /// Set or clear the model override, creating a placeholder entry for
    /// chats that have no session yet
    pub fn set_model_override(&self, chat_id: &str, model: Option<&str>) {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let session = sessions.entry(chat_id.to_string()).or_insert_with(|| ChatSession {
            last_active_at: now_ms(),
            ..Default::default()
        });
        session.model_override = model.map(|s| s.to_string());
        self.persist(&sessions);
    }

    /// Set or clear the backend override, same placeholder behavior
    pub fn set_backend_override(&self, chat_id: &str, backend: Option<&str>) {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let session = sessions.entry(chat_id.to_string()).or_insert_with(|| ChatSession {
            last_active_at: now_ms(),
            ..Default::default()
        });
        session.backend_override = backend.map(|s| s.to_string());
        self.persist(&sessions);
    }

    pub fn remove_session(&self, chat_id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let removed = sessions.remove(chat_id).is_some();
        if removed {
            self.persist(&sessions);
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session map poisoned").len()
    }

    /// Drop every expired entry; returns how many were purged
    pub fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let timeout_ms = self.timeout_ms();
        let now = now_ms();
        let before = sessions.len();
        sessions.retain(|_, s| now - s.last_active_at < timeout_ms);
        let purged = before - sessions.len();
        if purged > 0 {
            debug!(purged, "SessionManager: purged expired sessions");
            self.persist(&sessions);
        }
        purged
    }

    /// Run `work` serialized against other calls for the same chat.
    /// Different chats run in parallel; an error in one call never blocks
    /// the next because the lock releases when the future resolves.
    pub async fn enqueue_chat<F, T>(&self, chat_id: &str, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let lock = {
            let mut locks = self.chat_locks.lock().await;
            locks.entry(chat_id.to_string()).or_default().clone()
        };
        let _held = lock.lock().await;
        work.await
    }

    /// Periodic cleanup; stops itself once the map empties
    pub fn spawn_cleanup_task(manager: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_INTERVAL).await;
                manager.cleanup_expired();
                if manager.session_count() == 0 {
                    debug!("SessionManager: cleanup task stopping, no sessions");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(temp: &tempfile::TempDir, max_sessions: usize, timeout_minutes: u64) -> SessionManager {
        let data = DataDir::new(temp.path());
        data.ensure().unwrap();
        SessionManager::load(
            data,
            SessionsConfig {
                max_sessions,
                timeout_minutes,
            },
        )
    }

    #[test]
    fn test_set_and_get_session() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp, 10, 60);

        mgr.set_session("chat-1", "sess-a", Some("process"));
        let session = mgr.get_session("chat-1").unwrap();
        assert_eq!(session.session_id, "sess-a");
        assert_eq!(session.turn_count, 0);
        assert_eq!(session.session_backend_type.as_deref(), Some("process"));
    }

    #[test]
    fn test_same_session_preserves_counters() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp, 10, 60);

        mgr.set_session("chat-1", "sess-a", None);
        mgr.increment_turn("chat-1", 100, 50);
        mgr.increment_turn("chat-1", 200, 80);

        mgr.set_session("chat-1", "sess-a", None);
        let session = mgr.get_session("chat-1").unwrap();
        assert_eq!(session.turn_count, 2);
        assert_eq!(session.estimated_tokens, 430);
    }

    #[test]
    fn test_new_session_resets_counters_keeps_overrides() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp, 10, 60);

        mgr.set_session("chat-1", "sess-a", None);
        mgr.set_model_override("chat-1", Some("opus"));
        mgr.increment_turn("chat-1", 100, 50);

        mgr.set_session("chat-1", "sess-b", None);
        let session = mgr.get_session("chat-1").unwrap();
        assert_eq!(session.session_id, "sess-b");
        assert_eq!(session.turn_count, 0);
        assert_eq!(session.estimated_tokens, 0);
        assert_eq!(session.model_override.as_deref(), Some("opus"));
    }

    #[test]
    fn test_increment_turn_unknown_chat_is_noop() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp, 10, 60);
        mgr.increment_turn("ghost", 10, 10);
        assert!(mgr.get_session("ghost").is_none());
    }

    #[test]
    fn test_model_override_creates_placeholder() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp, 10, 60);

        mgr.set_model_override("chat-9", Some("haiku"));
        let session = mgr.get_session("chat-9").unwrap();
        assert_eq!(session.session_id, "");
        assert_eq!(session.model_override.as_deref(), Some("haiku"));

        mgr.set_model_override("chat-9", None);
        assert!(mgr.get_session("chat-9").unwrap().model_override.is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp, 2, 60);

        mgr.set_session("oldest", "s1", None);
        std::thread::sleep(Duration::from_millis(5));
        mgr.set_session("middle", "s2", None);
        std::thread::sleep(Duration::from_millis(5));
        mgr.set_session("newest", "s3", None);

        assert_eq!(mgr.session_count(), 2);
        assert!(mgr.get_session("oldest").is_none());
        assert!(mgr.get_session("middle").is_some());
        assert!(mgr.get_session("newest").is_some());
    }

    #[test]
    fn test_ttl_lazy_purge() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp, 10, 60);

        mgr.set_session("chat-1", "sess-a", None);
        {
            let mut sessions = mgr.sessions.lock().unwrap();
            sessions.get_mut("chat-1").unwrap().last_active_at = now_ms() - 61 * 60_000;
        }

        assert!(mgr.get_session("chat-1").is_none());
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_cleanup_expired() {
        let temp = tempdir().unwrap();
        let mgr = manager(&temp, 10, 60);

        mgr.set_session("fresh", "s1", None);
        mgr.set_session("stale", "s2", None);
        {
            let mut sessions = mgr.sessions.lock().unwrap();
            sessions.get_mut("stale").unwrap().last_active_at = now_ms() - 2 * 60 * 60_000;
        }

        assert_eq!(mgr.cleanup_expired(), 1);
        assert!(mgr.get_session("fresh").is_some());
        assert!(mgr.get_session("stale").is_none());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let temp = tempdir().unwrap();
        {
            let mgr = manager(&temp, 10, 60);
            mgr.set_session("chat-1", "sess-a", Some("process"));
            mgr.increment_turn("chat-1", 10, 5);
        }

        let mgr = manager(&temp, 10, 60);
        let session = mgr.get_session("chat-1").unwrap();
        assert_eq!(session.session_id, "sess-a");
        assert_eq!(session.turn_count, 1);
        assert_eq!(session.estimated_tokens, 15);
    }

    #[test]
    fn test_load_filters_expired() {
        let temp = tempdir().unwrap();
        {
            let mgr = manager(&temp, 10, 60);
            mgr.set_session("stale", "s1", None);
            let mut sessions = mgr.sessions.lock().unwrap();
            sessions.get_mut("stale").unwrap().last_active_at = now_ms() - 2 * 60 * 60_000;
            mgr.persist(&sessions);
        }

        let mgr = manager(&temp, 10, 60);
        assert_eq!(mgr.session_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_chat_serializes_per_chat() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let temp = tempdir().unwrap();
        let mgr = Arc::new(manager(&temp, 10, 60));
        let log: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let mgr = mgr.clone();
            let log = log.clone();
            let concurrent = concurrent.clone();
            handles.push(tokio::spawn(async move {
                mgr.enqueue_chat("chat-1", async {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    assert_eq!(now, 1, "two calls ran concurrently for one chat");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    log.lock().unwrap().push(i);
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
            // Stagger submissions so enqueue order is deterministic
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_enqueue_chat_parallel_across_chats() {
        let temp = tempdir().unwrap();
        let mgr = Arc::new(manager(&temp, 10, 60));

        let started = std::time::Instant::now();
        let a = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.enqueue_chat("chat-a", async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                })
                .await;
            })
        };
        let b = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.enqueue_chat("chat-b", async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                })
                .await;
            })
        };
        a.await.unwrap();
        b.await.unwrap();

        // Two 100ms sleeps overlapped
        assert!(started.elapsed() < Duration::from_millis(190));
    }

    #[tokio::test]
    async fn test_enqueue_chat_error_does_not_block_next() {
        let temp = tempdir().unwrap();
        let mgr = Arc::new(manager(&temp, 10, 60));

        let result: Result<(), String> = mgr.enqueue_chat("chat-1", async { Err("boom".to_string()) }).await;
        assert!(result.is_err());

        // The next call proceeds normally
        let ok: Result<u32, String> = mgr.enqueue_chat("chat-1", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }
}
