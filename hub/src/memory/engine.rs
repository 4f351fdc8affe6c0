//! Store-backed memory engine
//!
//! Entries live one-per-file under `memories/`. Retrieval is associative:
//! keyword scoring picks seeds, activation spreads over the association
//! graph, and the blended score is weighted by current recall strength so
//! faded memories drop out of prompts naturally.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info};

use hubstore::{DataDir, list_files_with_suffix, read_json_opt, write_json_atomic};

use super::assoc::{self, spread_activation};
use super::entry::{MemoryCategory, MemoryEntry, MemorySource, ReinforceSource};

/// Tuning knobs, `memory.*` in the config file
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Ceiling on stability in hours
    #[serde(rename = "max-stability-hours")]
    pub max_stability_hours: f64,

    /// Below this strength an entry is archived (strength forced to 0)
    #[serde(rename = "archive-threshold")]
    pub archive_threshold: f64,

    /// Below this strength an entry is deleted outright
    #[serde(rename = "delete-threshold")]
    pub delete_threshold: f64,

    /// Minimum keyword Jaccard overlap for an association edge
    #[serde(rename = "overlap-threshold")]
    pub overlap_threshold: f64,

    /// Activation spreading depth
    #[serde(rename = "spread-depth")]
    pub spread_depth: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_stability_hours: 8760.0,
            archive_threshold: 10.0,
            delete_threshold: 5.0,
            overlap_threshold: assoc::DEFAULT_OVERLAP_THRESHOLD,
            spread_depth: 2,
        }
    }
}

/// A scored retrieval hit
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub entry: MemoryEntry,
    pub keyword_score: f64,
    pub activation_score: f64,
    pub final_score: f64,
}

/// Cleanup outcome
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub scanned: usize,
    pub archived: usize,
    pub deleted: usize,
}

/// The memory engine over one data directory
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    data: DataDir,
    config: MemoryConfig,
}

impl MemoryEngine {
    pub fn new(data: DataDir, config: MemoryConfig) -> Self {
        Self { data, config }
    }

    /// Store a new entry, wiring its associations against the existing set
    pub fn add(&self, mut entry: MemoryEntry) -> eyre::Result<String> {
        entry.migrate();
        let id = entry.id.clone();

        let mut entries = self.load_all();
        entries.push(entry);
        assoc::rebuild_associations(&mut entries, self.config.overlap_threshold);
        for entry in &entries {
            write_json_atomic(self.data.memory_file(&entry.id), entry)?;
        }

        debug!(memory_id = %id, "MemoryEngine::add: stored entry");
        Ok(id)
    }

    /// Remember a fact with auto-extracted keywords
    pub fn remember(
        &self,
        content: &str,
        category: MemoryCategory,
        source: MemorySource,
        confidence: f64,
    ) -> eyre::Result<String> {
        let mut entry = MemoryEntry::new(content, category, extract_keywords(content), source);
        entry.confidence = confidence.clamp(0.0, 1.0);
        self.add(entry)
    }

    pub fn get(&self, id: &str) -> Option<MemoryEntry> {
        let mut entry: MemoryEntry = read_json_opt(self.data.memory_file(id))?;
        entry.migrate();
        Some(entry)
    }

    /// All entries, archived included
    pub fn load_all(&self) -> Vec<MemoryEntry> {
        list_files_with_suffix(self.data.memories_dir(), ".json")
            .into_iter()
            .filter_map(|path| read_json_opt::<MemoryEntry>(path))
            .map(|mut entry| {
                entry.migrate();
                entry
            })
            .collect()
    }

    /// Active entries only (archived excluded)
    pub fn list_active(&self) -> Vec<MemoryEntry> {
        self.load_all().into_iter().filter(|e| !e.is_archived()).collect()
    }

    /// Reinforce one entry by id
    pub fn reinforce(&self, id: &str, source: ReinforceSource) -> eyre::Result<()> {
        let mut entry = self
            .get(id)
            .ok_or_else(|| eyre::eyre!("memory not found: {}", id))?;
        entry.reinforce(source, self.config.max_stability_hours);
        write_json_atomic(self.data.memory_file(id), &entry)?;
        debug!(memory_id = %id, stability = entry.stability, "MemoryEngine::reinforce");
        Ok(())
    }

    pub fn delete(&self, id: &str) -> eyre::Result<bool> {
        let path = self.data.memory_file(id);
        if path.exists() {
            std::fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Forgetting sweep: delete entries below the delete threshold,
    /// archive (strength := 0) those below the archive threshold
    pub fn cleanup(&self) -> eyre::Result<CleanupStats> {
        let now = Utc::now();
        let mut stats = CleanupStats::default();

        for mut entry in self.load_all() {
            stats.scanned += 1;
            if entry.is_archived() {
                continue;
            }

            let strength = entry.strength_at(now);
            if strength < self.config.delete_threshold {
                std::fs::remove_file(self.data.memory_file(&entry.id))?;
                stats.deleted += 1;
            } else if strength < self.config.archive_threshold {
                entry.strength = 0.0;
                entry.updated_at = now;
                write_json_atomic(self.data.memory_file(&entry.id), &entry)?;
                stats.archived += 1;
            } else {
                entry.strength = strength;
                write_json_atomic(self.data.memory_file(&entry.id), &entry)?;
            }
        }

        info!(
            scanned = stats.scanned,
            archived = stats.archived,
            deleted = stats.deleted,
            "memory cleanup complete"
        );
        Ok(stats)
    }

    /// Associative retrieval: keyword seeds, activation spreading, blended
    /// scoring weighted by current strength
    pub fn associative_retrieve(&self, query: &str, top_k: usize) -> Vec<ScoredMemory> {
        let query_keywords = extract_keywords(query);
        if query_keywords.is_empty() {
            return Vec::new();
        }

        let entries = self.list_active();
        let by_id: HashMap<String, MemoryEntry> = entries.iter().cloned().map(|e| (e.id.clone(), e)).collect();

        // Keyword overlap ratio against the query
        let keyword_scores: HashMap<String, f64> = entries
            .iter()
            .map(|entry| {
                let entry_set: HashSet<&str> = entry.keywords.iter().map(|s| s.as_str()).collect();
                let hits = query_keywords.iter().filter(|k| entry_set.contains(k.as_str())).count();
                (entry.id.clone(), hits as f64 / query_keywords.len() as f64)
            })
            .collect();

        // Top-3 seeds spread activation; union keeps the max
        let mut seeds: Vec<(&String, &f64)> = keyword_scores.iter().filter(|(_, score)| **score > 0.0).collect();
        seeds.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut activations: HashMap<String, f64> = HashMap::new();
        for (seed_id, _) in seeds.iter().take(3) {
            for (id, activation) in spread_activation(seed_id, &by_id, self.config.spread_depth) {
                let known = activations.get(&id).copied().unwrap_or(0.0);
                if activation > known {
                    activations.insert(id, activation);
                }
            }
        }

        let now = Utc::now();
        let mut scored: Vec<ScoredMemory> = entries
            .into_iter()
            .filter_map(|entry| {
                let keyword_score = keyword_scores.get(&entry.id).copied().unwrap_or(0.0);
                let activation_score = activations.get(&entry.id).copied().unwrap_or(0.0);
                if keyword_score == 0.0 && activation_score == 0.0 {
                    return None;
                }
                let strength = entry.strength_at(now);
                let final_score = (0.6 * keyword_score + 0.4 * activation_score) * (strength / 100.0);
                Some(ScoredMemory {
                    entry,
                    keyword_score,
                    activation_score,
                    final_score,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        // Retrieval is itself a reinforcement signal
        for hit in &scored {
            let mut entry = hit.entry.clone();
            entry.touch_access();
            entry.reinforce(ReinforceSource::Retrieve, self.config.max_stability_hours);
            let _ = write_json_atomic(self.data.memory_file(&entry.id), &entry);
        }

        scored
    }

    /// Render the best matches as prompt context lines
    pub fn recall_for_prompt(&self, query: &str, top_k: usize) -> Vec<String> {
        self.associative_retrieve(query, top_k)
            .into_iter()
            .map(|hit| format!("[{}] {}", hit.entry.category, hit.entry.content))
            .collect()
    }
}

/// Stop words excluded from keyword extraction
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "have", "has", "had", "not", "but",
    "all", "can", "will", "should", "would", "could", "into", "over", "then", "than", "when", "what", "how", "why",
    "where", "which", "while", "its", "use", "using", "used",
];

/// Extract query/content keywords: lowercase, alphanumeric plus CJK runs,
/// length > 1, stop words removed
pub fn extract_keywords(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut keywords = Vec::new();
    let mut seen = HashSet::new();
    let mut current = String::new();

    let mut flush = |current: &mut String, keywords: &mut Vec<String>, seen: &mut HashSet<String>| {
        if current.chars().count() > 1 && !STOP_WORDS.contains(&current.as_str()) && seen.insert(current.clone()) {
            keywords.push(current.clone());
        }
        current.clear();
    };

    for c in lower.chars() {
        if c.is_alphanumeric() {
            current.push(c);
        } else {
            flush(&mut current, &mut keywords, &mut seen);
        }
    }
    flush(&mut current, &mut keywords, &mut seen);

    keywords
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn engine(temp: &tempfile::TempDir) -> MemoryEngine {
        let data = DataDir::new(temp.path());
        data.ensure().unwrap();
        MemoryEngine::new(data, MemoryConfig::default())
    }

    #[test]
    fn test_extract_keywords() {
        let keywords = extract_keywords("The retry classifier should cap delays for HTTP 429 errors");
        assert!(keywords.contains(&"retry".to_string()));
        assert!(keywords.contains(&"classifier".to_string()));
        assert!(keywords.contains(&"429".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"for".to_string()));
    }

    #[test]
    fn test_extract_keywords_cjk() {
        let keywords = extract_keywords("使用 tokio 处理并发");
        assert!(keywords.contains(&"tokio".to_string()));
        assert!(keywords.iter().any(|k| k.contains('并') || k.contains('使')));
    }

    #[test]
    fn test_add_get_roundtrip() {
        let temp = tempdir().unwrap();
        let engine = engine(&temp);

        let id = engine
            .remember(
                "always run the linter before pushing",
                MemoryCategory::Lesson,
                MemorySource::manual(),
                0.8,
            )
            .unwrap();

        let entry = engine.get(&id).unwrap();
        assert_eq!(entry.category, MemoryCategory::Lesson);
        assert!(entry.keywords.contains(&"linter".to_string()));
    }

    #[test]
    fn test_associations_wired_on_add() {
        let temp = tempdir().unwrap();
        let engine = engine(&temp);

        let a = engine
            .remember(
                "tokio channels handle backpressure",
                MemoryCategory::Pattern,
                MemorySource::manual(),
                0.5,
            )
            .unwrap();
        let b = engine
            .remember(
                "tokio channels drop messages when closed",
                MemoryCategory::Pitfall,
                MemorySource::manual(),
                0.5,
            )
            .unwrap();

        let entry_a = engine.get(&a).unwrap();
        assert!(entry_a.associations.iter().any(|x| x.target_id == b));
    }

    #[test]
    fn test_associative_retrieve_ranks_keyword_match_first() {
        let temp = tempdir().unwrap();
        let engine = engine(&temp);

        engine
            .remember(
                "queue locking uses a pid lock file",
                MemoryCategory::Pattern,
                MemorySource::manual(),
                0.5,
            )
            .unwrap();
        engine
            .remember(
                "cooking pasta needs salted water",
                MemoryCategory::Preference,
                MemorySource::manual(),
                0.5,
            )
            .unwrap();

        let hits = engine.associative_retrieve("how does queue locking work", 5);
        assert!(!hits.is_empty());
        assert!(hits[0].entry.content.contains("queue locking"));
        assert!(hits.iter().all(|h| !h.entry.content.contains("pasta")));
    }

    #[test]
    fn test_retrieval_reinforces_hits() {
        let temp = tempdir().unwrap();
        let engine = engine(&temp);

        let id = engine
            .remember(
                "workers poll the queue every second",
                MemoryCategory::Pattern,
                MemorySource::manual(),
                0.5,
            )
            .unwrap();

        let before = engine.get(&id).unwrap();
        engine.associative_retrieve("queue poll workers", 3);
        let after = engine.get(&id).unwrap();

        assert_eq!(after.access_count, before.access_count + 1);
        assert!(after.stability > before.stability);
    }

    #[test]
    fn test_activation_finds_unqueried_neighbor() {
        let temp = tempdir().unwrap();
        let engine = engine(&temp);

        // Two entries share keywords; the second also associates with a
        // third that shares none of the query terms
        engine
            .remember(
                "scheduler backoff retries transient failures",
                MemoryCategory::Pattern,
                MemorySource::task("task-7"),
                0.5,
            )
            .unwrap();
        let bridge = engine
            .remember(
                "scheduler backoff caps at thirty seconds",
                MemoryCategory::Pattern,
                MemorySource::task("task-7"),
                0.5,
            )
            .unwrap();
        let neighbor = engine
            .remember(
                "jitter avoids thundering herds",
                MemoryCategory::Lesson,
                MemorySource::task("task-7"),
                0.5,
            )
            .unwrap();
        let _ = bridge;

        let hits = engine.associative_retrieve("scheduler backoff", 10);
        assert!(hits.iter().any(|h| h.entry.id == neighbor), "co-task neighbor activated");
    }

    #[test]
    fn test_cleanup_archives_and_deletes() {
        let temp = tempdir().unwrap();
        let engine = engine(&temp);

        // Fresh, stays
        engine
            .remember("fresh fact", MemoryCategory::Lesson, MemorySource::manual(), 0.5)
            .unwrap();

        // Weak: strength at ~2.5 days on a 24h curve is ~8 (archive band)
        let mut weak = MemoryEntry::new(
            "weak fact",
            MemoryCategory::Lesson,
            vec!["weak".to_string()],
            MemorySource::manual(),
        );
        weak.last_reinforced_at = Utc::now() - Duration::minutes(61 * 60); // 61h -> ~8
        let weak_id = weak.id.clone();
        write_json_atomic(engine.data.memory_file(&weak_id), &weak).unwrap();

        // Dead: far past the delete threshold
        let mut dead = MemoryEntry::new(
            "dead fact",
            MemoryCategory::Lesson,
            vec!["dead".to_string()],
            MemorySource::manual(),
        );
        dead.last_reinforced_at = Utc::now() - Duration::hours(500);
        let dead_id = dead.id.clone();
        write_json_atomic(engine.data.memory_file(&dead_id), &dead).unwrap();

        let stats = engine.cleanup().unwrap();
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.deleted, 1);

        // Archived entry retrievable by id, excluded from active queries
        let archived = engine.get(&weak_id).unwrap();
        assert!(archived.is_archived());
        assert!(engine.list_active().iter().all(|e| e.id != weak_id));
        assert!(engine.get(&dead_id).is_none());
    }

    #[test]
    fn test_archived_excluded_from_retrieval() {
        let temp = tempdir().unwrap();
        let engine = engine(&temp);

        let id = engine
            .remember(
                "archived knowledge about queues",
                MemoryCategory::Lesson,
                MemorySource::manual(),
                0.5,
            )
            .unwrap();
        let mut entry = engine.get(&id).unwrap();
        entry.strength = 0.0;
        write_json_atomic(engine.data.memory_file(&id), &entry).unwrap();

        let hits = engine.associative_retrieve("archived knowledge queues", 5);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_recall_for_prompt_format() {
        let temp = tempdir().unwrap();
        let engine = engine(&temp);

        engine
            .remember(
                "avoid touching generated files",
                MemoryCategory::Pitfall,
                MemorySource::manual(),
                0.9,
            )
            .unwrap();

        let lines = engine.recall_for_prompt("generated files", 3);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[pitfall] "));
    }
}
