// In-memory registry of executions - the tracker's single source of truth

//! # Execution Registry
//!
//! The registry owns every [`Execution`] this client knows about, a pointer
//! to the "current" execution, and a bounded, most-recent-first history
//! list. It is the only place those records are created or changed.
//!
//! ## Update Rules
//!
//! Every operation is total: an id the registry does not know is ignored
//! rather than treated as a failure, because stream events can legitimately
//! race with a reset or removal. Each operation reports what happened as an
//! [`UpdateOutcome`] so callers can log it.
//!
//! - Execution status moves `running → completed | error` once and never back.
//! - Node status moves `running → completed | error`; finishing a node that was
//!   never started changes nothing.
//! - `active_edges` only grows until the execution is removed.
//!
//! ## Rust Learning Notes:
//!
//! ### Exclusive Access Instead of Locks
//! All operations take `&mut self`. The tracker runs on a single event loop,
//! so the borrow checker alone guarantees that two updates never interleave.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use crate::models::{
    ActiveEdge, Execution, ExecutionHistoryEntry, ExecutionStatus, NodeDisplayStatus,
    NodeExecution, NodeStatus,
};

/// Default number of history entries kept
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Why an update left the registry unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownExecution,
    UnknownNode,
    /// The record already reached a terminal status
    AlreadyTerminal,
    /// A redelivered start for an execution that is still running
    AlreadyStarted,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::UnknownExecution => "unknown execution",
            IgnoreReason::UnknownNode => "unknown node",
            IgnoreReason::AlreadyTerminal => "already terminal",
            IgnoreReason::AlreadyStarted => "already started",
        }
    }

    /// Whether the event pointed at something this client never saw
    pub fn is_unattributable(&self) -> bool {
        matches!(self, IgnoreReason::UnknownExecution | IgnoreReason::UnknownNode)
    }
}

/// Result of a registry update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum UpdateOutcome {
    Applied,
    Ignored(IgnoreReason),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

/// Keyed store of executions plus the current pointer and history list
pub struct ExecutionRegistry {
    executions: HashMap<String, Execution>,
    current: Option<String>,
    history: VecDeque<ExecutionHistoryEntry>,
    history_limit: usize,
    clock: Arc<dyn Clock>,
}

impl ExecutionRegistry {
    /// Create an empty registry using wall-clock time
    pub fn new(history_limit: usize) -> Self {
        Self::with_clock(history_limit, Arc::new(SystemClock))
    }

    pub fn with_clock(history_limit: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            executions: HashMap::new(),
            current: None,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            clock,
        }
    }

    // ------------------------------------------------------------------
    // Execution-level operations
    // ------------------------------------------------------------------

    /// Register a new running execution and make it current
    ///
    /// A missing id is generated. If the id already exists the old record
    /// and its history entry are replaced, since ids are unique per run.
    pub fn start_execution(
        &mut self,
        id: Option<String>,
        query: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> String {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let started_at = timestamp.unwrap_or_else(|| self.clock.now());
        let execution = Execution::new(id.clone(), query, started_at);

        self.history.retain(|entry| entry.id != id);
        self.history.push_front(execution.history_entry());
        self.history.truncate(self.history_limit);

        self.executions.insert(id.clone(), execution);
        self.current = Some(id.clone());
        id
    }

    /// Mark an execution completed
    ///
    /// `retain_current` keeps the execution as the current one so a UI can
    /// keep showing its result after the run ends.
    pub fn complete_execution(
        &mut self,
        id: &str,
        result: Value,
        retain_current: bool,
    ) -> UpdateOutcome {
        let outcome = self.finish_execution(id, ExecutionStatus::Completed, |execution| {
            execution.result = Some(result);
        });
        if outcome.is_applied() && !retain_current {
            self.clear_current_if(id);
        }
        outcome
    }

    /// Mark an execution failed; a failed run is never left current
    pub fn error_execution(&mut self, id: &str, error: Value) -> UpdateOutcome {
        let outcome = self.finish_execution(id, ExecutionStatus::Error, |execution| {
            execution.error = Some(error);
        });
        if outcome.is_applied() {
            self.clear_current_if(id);
        }
        outcome
    }

    fn finish_execution(
        &mut self,
        id: &str,
        status: ExecutionStatus,
        set_payload: impl FnOnce(&mut Execution),
    ) -> UpdateOutcome {
        let now = self.clock.now();
        let Some(execution) = self.executions.get_mut(id) else {
            return UpdateOutcome::Ignored(IgnoreReason::UnknownExecution);
        };
        if execution.is_terminal() {
            return UpdateOutcome::Ignored(IgnoreReason::AlreadyTerminal);
        }

        execution.status = status;
        execution.end_time = Some(now);
        set_payload(execution);

        let entry = execution.history_entry();
        if let Some(slot) = self.history.iter_mut().find(|e| e.id == entry.id) {
            *slot = entry;
        }
        UpdateOutcome::Applied
    }

    fn clear_current_if(&mut self, id: &str) {
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
    }

    // ------------------------------------------------------------------
    // Node-level operations
    // ------------------------------------------------------------------

    /// Record a node as running and make it the execution's current node
    pub fn start_node(&mut self, execution_id: &str, node_id: &str, node_type: &str) -> UpdateOutcome {
        self.start_node_with_input(execution_id, node_id, node_type, None)
    }

    /// Same as [`start_node`](Self::start_node), also keeping the node's input
    ///
    /// Restarting a node that already has a record counts as a retry.
    pub fn start_node_with_input(
        &mut self,
        execution_id: &str,
        node_id: &str,
        node_type: &str,
        input: Option<Value>,
    ) -> UpdateOutcome {
        let now = self.clock.now();
        let Some(execution) = self.executions.get_mut(execution_id) else {
            return UpdateOutcome::Ignored(IgnoreReason::UnknownExecution);
        };

        let retry_count = execution
            .nodes
            .get(node_id)
            .map(|previous| previous.retry_count + 1)
            .unwrap_or(0);

        let mut node = NodeExecution::started(node_id, node_type, now);
        node.retry_count = retry_count;
        node.input = input;

        execution.nodes.insert(node_id.to_string(), node);
        execution.current_node = Some(node_id.to_string());
        UpdateOutcome::Applied
    }

    pub fn complete_node(&mut self, execution_id: &str, node_id: &str, output: Value) -> UpdateOutcome {
        self.finish_node(execution_id, node_id, NodeStatus::Completed, |node| {
            node.output = Some(output);
        })
    }

    pub fn error_node(&mut self, execution_id: &str, node_id: &str, error: Value) -> UpdateOutcome {
        self.finish_node(execution_id, node_id, NodeStatus::Error, |node| {
            node.error = Some(error);
        })
    }

    fn finish_node(
        &mut self,
        execution_id: &str,
        node_id: &str,
        status: NodeStatus,
        set_payload: impl FnOnce(&mut NodeExecution),
    ) -> UpdateOutcome {
        let now = self.clock.now();
        let Some(execution) = self.executions.get_mut(execution_id) else {
            return UpdateOutcome::Ignored(IgnoreReason::UnknownExecution);
        };
        let Some(node) = execution.nodes.get_mut(node_id) else {
            return UpdateOutcome::Ignored(IgnoreReason::UnknownNode);
        };
        if node.status.is_terminal() {
            return UpdateOutcome::Ignored(IgnoreReason::AlreadyTerminal);
        }

        node.finish(status, now);
        set_payload(node);
        UpdateOutcome::Applied
    }

    /// Append a traversed edge; the same edge may be recorded more than once
    pub fn activate_edge(&mut self, execution_id: &str, from: &str, to: &str) -> UpdateOutcome {
        match self.executions.get_mut(execution_id) {
            Some(execution) => {
                execution.active_edges.push(ActiveEdge::new(from, to));
                UpdateOutcome::Applied
            }
            None => UpdateOutcome::Ignored(IgnoreReason::UnknownExecution),
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Clear the current pointer; every record stays browsable
    pub fn reset_current(&mut self) {
        self.current = None;
    }

    /// Delete an execution and its history entry
    pub fn remove_execution(&mut self, id: &str) -> UpdateOutcome {
        let removed = self.executions.remove(id).is_some();
        let before = self.history.len();
        self.history.retain(|entry| entry.id != id);
        self.clear_current_if(id);

        if removed || self.history.len() != before {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Ignored(IgnoreReason::UnknownExecution)
        }
    }

    /// Empty the history list without touching the executions themselves
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Drop every record, leaving an empty registry
    pub fn dispose(&mut self) {
        self.executions.clear();
        self.history.clear();
        self.current = None;
    }

    // ------------------------------------------------------------------
    // Selectors
    // ------------------------------------------------------------------

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_execution(&self) -> Option<&Execution> {
        self.current.as_deref().and_then(|id| self.executions.get(id))
    }

    pub fn execution(&self, id: &str) -> Option<&Execution> {
        self.executions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.executions.contains_key(id)
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    /// History entries, most recent first
    pub fn history(&self) -> impl Iterator<Item = &ExecutionHistoryEntry> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Status to display for a node, `Pending` when it has not started
    pub fn node_status(&self, execution_id: &str, node_id: &str) -> NodeDisplayStatus {
        self.executions
            .get(execution_id)
            .and_then(|execution| execution.node(node_id))
            .map(|node| node.status.into())
            .unwrap_or(NodeDisplayStatus::Pending)
    }

    pub fn is_edge_active(&self, execution_id: &str, from: &str, to: &str) -> bool {
        self.executions
            .get(execution_id)
            .map(|execution| {
                execution
                    .active_edges
                    .iter()
                    .any(|edge| edge.from == from && edge.to == to)
            })
            .unwrap_or(false)
    }

    pub fn running_count(&self) -> usize {
        self.executions
            .values()
            .filter(|execution| execution.status == ExecutionStatus::Running)
            .count()
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
