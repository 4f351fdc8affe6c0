//! Workflow graph, runtime instance, and expression language

pub mod expr;
pub mod graph;
pub mod instance;
pub mod model;

pub use expr::ExprError;
pub use graph::{InstanceShape, NextNode, ReadySet};
pub use instance::{InstanceStatus, NodeState, NodeStatus, WorkflowInstance};
pub use model::{
    AssignNodeConfig, DelayNodeConfig, Edge, ForeachMode, ForeachNodeConfig, HumanNodeConfig, LoopNodeConfig, Node,
    NodeKind, ScheduleNodeConfig, ScriptNodeConfig, SwitchCase, SwitchNodeConfig, TaskNodeConfig, Workflow,
};
