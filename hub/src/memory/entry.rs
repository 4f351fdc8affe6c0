//! Memory entries and the forgetting model
//!
//! Each entry follows an Ebbinghaus-style curve: recall probability decays
//! exponentially with a per-entry time constant (`stability`, in hours)
//! and is reset to 100 by reinforcement. Reinforcement compounds: every
//! reinforcement multiplies the stability, so well-used memories flatten
//! out while untouched ones fade and get cleaned up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::generate_id;

/// What kind of knowledge an entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    #[default]
    Pattern,
    Lesson,
    Preference,
    Pitfall,
    Tool,
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pattern => "pattern",
            Self::Lesson => "lesson",
            Self::Preference => "preference",
            Self::Pitfall => "pitfall",
            Self::Tool => "tool",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pattern" => Ok(Self::Pattern),
            "lesson" => Ok(Self::Lesson),
            "preference" => Ok(Self::Preference),
            "pitfall" => Ok(Self::Pitfall),
            "tool" => Ok(Self::Tool),
            _ => Err(format!("Unknown memory category: {}", s)),
        }
    }
}

/// Where an entry came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemorySource {
    /// "task", "manual", or "chat"
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl MemorySource {
    pub fn manual() -> Self {
        Self {
            kind: "manual".to_string(),
            task_id: None,
            chat_id: None,
        }
    }

    pub fn task(task_id: impl Into<String>) -> Self {
        Self {
            kind: "task".to_string(),
            task_id: Some(task_id.into()),
            chat_id: None,
        }
    }
}

/// Association edge types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssociationType {
    Keyword,
    CoTask,
    CoProject,
    Semantic,
    Temporal,
}

/// A weighted directed edge to another entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    pub target_id: String,
    /// In [0, 1]
    pub weight: f64,
    #[serde(rename = "type")]
    pub kind: AssociationType,
}

/// What caused a reinforcement, with its stability multiplier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinforceSource {
    Retrieve,
    TaskSuccess,
    TaskFailure,
    ManualReview,
    AssociationHit,
}

impl ReinforceSource {
    pub fn stability_factor(&self) -> f64 {
        match self {
            Self::Retrieve => 1.2,
            Self::TaskSuccess => 2.0,
            Self::TaskFailure => 0.8,
            Self::ManualReview => 1.5,
            Self::AssociationHit => 1.1,
        }
    }
}

/// Default decay time constant for new entries: one day
pub const DEFAULT_STABILITY_HOURS: f64 = 24.0;

/// Ceiling on stability: one year
pub const DEFAULT_MAX_STABILITY_HOURS: f64 = 8760.0;

/// One remembered fact, `memories/<id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: String,

    pub content: String,

    pub category: MemoryCategory,

    pub keywords: Vec<String>,

    pub source: MemorySource,

    /// Author confidence in [0, 1]
    pub confidence: f64,

    pub access_count: u32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Recall probability x100 at the last computation; 0 marks an
    /// archived entry
    #[serde(default = "default_strength")]
    pub strength: f64,

    /// Decay time constant in hours
    #[serde(default = "default_stability")]
    pub stability: f64,

    /// Epoch sentinel when absent; [`MemoryEntry::migrate`] backfills it
    /// from `updated_at` for entries that predate the forgetting model
    #[serde(default = "epoch")]
    pub last_reinforced_at: DateTime<Utc>,

    #[serde(default)]
    pub reinforce_count: u32,

    /// Multiplier on elapsed time; lower decays slower
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,

    #[serde(default)]
    pub associations: Vec<Association>,
}

fn default_strength() -> f64 {
    100.0
}

fn default_stability() -> f64 {
    DEFAULT_STABILITY_HOURS
}

fn default_decay_rate() -> f64 {
    1.0
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>, category: MemoryCategory, keywords: Vec<String>, source: MemorySource) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: generate_id("mem", &content),
            content,
            category,
            keywords,
            source,
            confidence: 0.5,
            access_count: 0,
            created_at: now,
            updated_at: now,
            strength: 100.0,
            stability: DEFAULT_STABILITY_HOURS,
            last_reinforced_at: now,
            reinforce_count: 0,
            decay_rate: 1.0,
            associations: Vec::new(),
        }
    }

    /// Current recall strength in [0, 100] at time `t`
    pub fn strength_at(&self, t: DateTime<Utc>) -> f64 {
        let elapsed_hours = (t - self.last_reinforced_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let time_constant = self.stability / self.decay_rate.max(f64::EPSILON);
        let raw = 100.0 * (-elapsed_hours / time_constant).exp();
        raw.round().clamp(0.0, 100.0)
    }

    pub fn current_strength(&self) -> f64 {
        self.strength_at(Utc::now())
    }

    /// Archived entries are kept but excluded from active queries
    pub fn is_archived(&self) -> bool {
        self.strength == 0.0
    }

    /// Reinforce: multiply stability, reset the decay clock, and adapt the
    /// decay rate to confidence and category
    pub fn reinforce(&mut self, source: ReinforceSource, max_stability: f64) {
        self.stability = (self.stability * source.stability_factor()).min(max_stability);
        self.last_reinforced_at = Utc::now();
        self.reinforce_count += 1;
        self.strength = 100.0;
        self.updated_at = Utc::now();

        if self.confidence >= 0.7 {
            self.decay_rate *= 0.7;
        } else if self.confidence <= 0.3 {
            self.decay_rate *= 1.3;
        }
        if self.category == MemoryCategory::Pitfall {
            self.decay_rate *= 0.9;
        }
    }

    /// Record an access without reinforcing
    pub fn touch_access(&mut self) {
        self.access_count += 1;
        self.updated_at = Utc::now();
    }

    /// Backfill decay fields on entries that predate the forgetting model
    pub fn migrate(&mut self) {
        if self.last_reinforced_at == epoch() {
            self.last_reinforced_at = self.updated_at;
        }
    }
}
