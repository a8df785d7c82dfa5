// Execution domain models - the local view of a remote workflow run

//! # Execution Models
//!
//! This module defines the records the tracker keeps for each workflow run:
//! - `Execution`: one run of the remote workflow graph
//! - `NodeExecution`: one node visited during a run
//! - `ActiveEdge`: a recorded traversal between two nodes
//! - `ExecutionHistoryEntry`: the lightweight projection shown in history lists
//!
//! All of these are plain data. They are created and mutated only by the
//! [`ExecutionRegistry`](crate::engine::registry::ExecutionRegistry); every
//! other component receives them by shared reference or as clones.
//!
//! ## Rust Learning Notes:
//!
//! ### Enums as State
//! The status enums below make illegal states unrepresentable: a node can be
//! `Running`, `Completed` or `Error`, and nothing else. The UI-only "pending"
//! default lives in a separate enum (`NodeDisplayStatus`) so it can never be
//! stored on a record by accident.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of an execution
///
/// `Completed` and `Error` are terminal. Once an execution reaches either of
/// them, the registry refuses any further execution-level transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Error,
}

impl ExecutionStatus {
    /// Whether this status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a node inside an execution
///
/// A node only exists once it has started, so there is no pending variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Completed,
    Error,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Error)
    }
}

/// What a display layer should show for a node
///
/// `Pending` is produced by selectors for nodes that have no record yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeDisplayStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl From<NodeStatus> for NodeDisplayStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Running => NodeDisplayStatus::Running,
            NodeStatus::Completed => NodeDisplayStatus::Completed,
            NodeStatus::Error => NodeDisplayStatus::Error,
        }
    }
}

/// A single node visited during an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub id: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    /// Seconds between `start_time` and `end_time`, set once the node is terminal
    pub duration: Option<f64>,

    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,

    /// How many times this node was restarted within the same execution
    pub retry_count: u32,
}

impl NodeExecution {
    /// Create a freshly started node
    pub fn started(id: impl Into<String>, node_type: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Running,
            start_time: at,
            end_time: None,
            duration: None,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
        }
    }

    /// Move the node into a terminal status, stamping `end_time` and `duration`
    pub(crate) fn finish(&mut self, status: NodeStatus, at: DateTime<Utc>) {
        // Clock skew between start and finish must never yield a negative duration
        let elapsed = (at - self.start_time).num_milliseconds().max(0);
        self.status = status;
        self.end_time = Some(at);
        self.duration = Some(elapsed as f64 / 1000.0);
    }
}

/// A recorded traversal between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveEdge {
    pub from: String,
    pub to: String,
}

impl ActiveEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// One run of the remote workflow, as seen by this client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub query: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,

    /// Set if and only if `status` is terminal
    pub end_time: Option<DateTime<Utc>>,

    /// The most recently started node
    pub current_node: Option<String>,

    /// Append-only list of traversed edges; duplicates are meaningful
    pub active_edges: Vec<ActiveEdge>,

    pub nodes: HashMap<String, NodeExecution>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

impl Execution {
    /// Create a new running execution with no nodes or edges
    pub fn new(id: impl Into<String>, query: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            status: ExecutionStatus::Running,
            start_time,
            end_time: None,
            current_node: None,
            active_edges: Vec::new(),
            nodes: HashMap::new(),
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.nodes.get(node_id)
    }

    /// Wall-clock seconds from start to end, once the run is terminal
    pub fn duration(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as f64 / 1000.0)
    }

    /// Project this execution into its history-list form
    pub fn history_entry(&self) -> ExecutionHistoryEntry {
        ExecutionHistoryEntry {
            id: self.id.clone(),
            query: self.query.clone(),
            status: self.status,
            timestamp: self.start_time,
            end_time: self.end_time,
            error: self.error.clone(),
        }
    }
}

/// Lightweight projection of an execution kept in the history list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHistoryEntry {
    pub id: String,
    pub query: String,
    pub status: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_node_finish_sets_duration() {
        let start = Utc::now();
        let mut node = NodeExecution::started("n1", "process", start);
        node.finish(NodeStatus::Completed, start + Duration::milliseconds(1500));

        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.duration, Some(1.5));
        assert!(node.end_time.is_some());
    }

    #[test]
    fn test_node_finish_never_negative() {
        let start = Utc::now();
        let mut node = NodeExecution::started("n1", "process", start);
        node.finish(NodeStatus::Error, start - Duration::seconds(3));

        assert_eq!(node.duration, Some(0.0));
    }

    #[test]
    fn test_history_entry_projection() {
        let execution = Execution::new("e1", "sales?", Utc::now());
        let entry = execution.history_entry();

        assert_eq!(entry.id, "e1");
        assert_eq!(entry.query, "sales?");
        assert_eq!(entry.status, ExecutionStatus::Running);
        assert!(entry.end_time.is_none());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExecutionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
