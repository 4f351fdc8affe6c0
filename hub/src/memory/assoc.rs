//! Association building and activation spreading
//!
//! Associations are recomputed pairwise from entry metadata; retrieval
//! spreads activation over the resulting graph with a per-hop damping of
//! 0.5 and a floor below which activation is dropped.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Duration;

use super::entry::{Association, AssociationType, MemoryEntry};

/// Minimum Jaccard keyword overlap to keep a keyword edge
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.3;

/// Weight of a same-task edge
const CO_TASK_WEIGHT: f64 = 0.5;

/// Temporal window for "created around the same time"
const TEMPORAL_WINDOW_HOURS: i64 = 24;

/// Floor below which a temporal edge is dropped
const TEMPORAL_FLOOR: f64 = 0.05;

/// Per-hop damping during activation spreading
const SPREAD_DAMPING: f64 = 0.5;

/// Activation floor during spreading
pub const ACTIVATION_FLOOR: f64 = 0.01;

/// Jaccard overlap of two keyword sets
pub fn keyword_overlap(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: HashSet<&str> = a.iter().map(|s| s.as_str()).collect();
    let set_b: HashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Candidate edges between one pair of entries, merged by max weight
pub fn pair_associations(a: &MemoryEntry, b: &MemoryEntry, overlap_threshold: f64) -> Option<Association> {
    let mut best: Option<(f64, AssociationType)> = None;
    let mut consider = |weight: f64, kind: AssociationType| {
        if best.map(|(w, _)| weight > w).unwrap_or(true) {
            best = Some((weight, kind));
        }
    };

    let overlap = keyword_overlap(&a.keywords, &b.keywords);
    if overlap >= overlap_threshold {
        consider(overlap, AssociationType::Keyword);
    }

    if let (Some(task_a), Some(task_b)) = (&a.source.task_id, &b.source.task_id)
        && task_a == task_b
    {
        consider(CO_TASK_WEIGHT, AssociationType::CoTask);
    }

    let delta = (a.created_at - b.created_at).abs();
    if delta <= Duration::hours(TEMPORAL_WINDOW_HOURS) {
        let fraction = delta.num_milliseconds() as f64 / Duration::hours(TEMPORAL_WINDOW_HOURS).num_milliseconds() as f64;
        let weight = 0.3 * (1.0 - fraction);
        if weight > TEMPORAL_FLOOR {
            consider(weight, AssociationType::Temporal);
        }
    }

    best.map(|(weight, kind)| Association {
        target_id: b.id.clone(),
        weight,
        kind,
    })
}

/// Recompute the association lists for every entry, in place
pub fn rebuild_associations(entries: &mut [MemoryEntry], overlap_threshold: f64) {
    let snapshot: Vec<MemoryEntry> = entries.to_vec();

    for entry in entries.iter_mut() {
        entry.associations = snapshot
            .iter()
            .filter(|other| other.id != entry.id)
            .filter_map(|other| pair_associations(entry, other, overlap_threshold))
            .collect();
        entry
            .associations
            .sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
    }
}

/// BFS activation spreading from a seed entry
///
/// Each hop multiplies activation by `edge_weight * 0.5`; activations
/// below the floor are dropped. When several paths reach the same entry
/// the strongest activation wins. The seed itself is not returned.
pub fn spread_activation(
    seed_id: &str,
    entries: &HashMap<String, MemoryEntry>,
    max_depth: usize,
) -> HashMap<String, f64> {
    let mut activations: HashMap<String, f64> = HashMap::new();
    let mut queue: VecDeque<(String, f64, usize)> = VecDeque::new();
    queue.push_back((seed_id.to_string(), 1.0, 0));

    while let Some((id, activation, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let Some(entry) = entries.get(&id) else { continue };

        for assoc in &entry.associations {
            let next = activation * assoc.weight * SPREAD_DAMPING;
            if next < ACTIVATION_FLOOR {
                continue;
            }
            let known = activations.get(&assoc.target_id).copied().unwrap_or(0.0);
            if next > known && assoc.target_id != seed_id {
                activations.insert(assoc.target_id.clone(), next);
                queue.push_back((assoc.target_id.clone(), next, depth + 1));
            }
        }
    }

    activations
}
