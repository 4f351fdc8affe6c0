//! Lifecycle events: bus, per-task logging, stats aggregation

pub mod bus;
pub mod logger;
pub mod stats;
pub mod types;

pub use bus::{EventBus, Listener, create_event_bus};
pub use logger::{TaskEventLogger, record_conversation};
pub use stats::{NodeStats, StatsAggregator, WorkflowExecutionStats};
pub use types::{Event, EventLogEntry};
