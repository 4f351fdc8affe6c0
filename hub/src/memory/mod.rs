//! Forgetting/associative memory engine

pub mod assoc;
pub mod engine;
pub mod entry;

pub use engine::{CleanupStats, MemoryConfig, MemoryEngine, ScoredMemory, extract_keywords};
pub use entry::{
    Association, AssociationType, MemoryCategory, MemoryEntry, MemorySource, ReinforceSource,
};
