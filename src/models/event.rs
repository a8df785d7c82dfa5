// Inbound stream events - the server's execution event contract

//! # Stream Events
//!
//! Every message the server pushes over the event stream is one variant of
//! [`StreamEvent`]. The wire format is a JSON object tagged by `type`:
//!
//! ```json
//! {"type": "node.started", "executionId": "e1", "nodeId": "n1", "nodeType": "process"}
//! ```
//!
//! Kinds the server might send that are not listed here fail to deserialize,
//! and the dispatcher drops them as malformed. Matching on `StreamEvent` is
//! exhaustive, so adding a kind forces every consumer to handle it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::hitl::HitlMode;

/// A lifecycle event pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "execution.started", rename_all = "camelCase")]
    ExecutionStarted {
        execution_id: String,
        query: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },

    #[serde(rename = "node.started", rename_all = "camelCase")]
    NodeStarted {
        execution_id: String,
        node_id: String,
        node_type: String,
        #[serde(default)]
        input: Option<serde_json::Value>,
    },

    #[serde(rename = "node.completed", rename_all = "camelCase")]
    NodeCompleted {
        execution_id: String,
        node_id: String,
        #[serde(default)]
        output: serde_json::Value,
    },

    #[serde(rename = "node.error", rename_all = "camelCase")]
    NodeError {
        execution_id: String,
        node_id: String,
        #[serde(default)]
        error: serde_json::Value,
    },

    #[serde(rename = "edge.activated", rename_all = "camelCase")]
    EdgeActivated {
        execution_id: String,
        from: String,
        to: String,
    },

    #[serde(rename = "execution.completed", rename_all = "camelCase")]
    ExecutionCompleted {
        execution_id: String,
        #[serde(default)]
        result: serde_json::Value,
    },

    #[serde(rename = "execution.error", rename_all = "camelCase")]
    ExecutionError {
        execution_id: String,
        #[serde(default)]
        error: serde_json::Value,
    },

    /// Terminal event some servers send after a HITL cancel
    #[serde(rename = "execution.cancelled", rename_all = "camelCase")]
    ExecutionCancelled {
        execution_id: String,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "hitl.paused", rename_all = "camelCase")]
    HitlPaused {
        execution_id: String,
        node_name: String,
        #[serde(default)]
        state_snapshot: serde_json::Value,
    },

    #[serde(rename = "hitl.interrupted", rename_all = "camelCase")]
    HitlInterrupted {
        execution_id: String,
        node_name: String,
        #[serde(default)]
        state_snapshot: serde_json::Value,
    },
}

impl StreamEvent {
    /// Parse a raw text frame from the transport
    pub fn from_frame(frame: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// The execution this event belongs to
    pub fn execution_id(&self) -> &str {
        match self {
            StreamEvent::ExecutionStarted { execution_id, .. }
            | StreamEvent::NodeStarted { execution_id, .. }
            | StreamEvent::NodeCompleted { execution_id, .. }
            | StreamEvent::NodeError { execution_id, .. }
            | StreamEvent::EdgeActivated { execution_id, .. }
            | StreamEvent::ExecutionCompleted { execution_id, .. }
            | StreamEvent::ExecutionError { execution_id, .. }
            | StreamEvent::ExecutionCancelled { execution_id, .. }
            | StreamEvent::HitlPaused { execution_id, .. }
            | StreamEvent::HitlInterrupted { execution_id, .. } => execution_id,
        }
    }

    /// Wire name of the event kind, used for logging and stats
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::ExecutionStarted { .. } => "execution.started",
            StreamEvent::NodeStarted { .. } => "node.started",
            StreamEvent::NodeCompleted { .. } => "node.completed",
            StreamEvent::NodeError { .. } => "node.error",
            StreamEvent::EdgeActivated { .. } => "edge.activated",
            StreamEvent::ExecutionCompleted { .. } => "execution.completed",
            StreamEvent::ExecutionError { .. } => "execution.error",
            StreamEvent::ExecutionCancelled { .. } => "execution.cancelled",
            StreamEvent::HitlPaused { .. } => "hitl.paused",
            StreamEvent::HitlInterrupted { .. } => "hitl.interrupted",
        }
    }

    /// The HITL mode carried by pause/interrupt events
    pub fn hitl_mode(&self) -> Option<HitlMode> {
        match self {
            StreamEvent::HitlPaused { .. } => Some(HitlMode::Pause),
            StreamEvent::HitlInterrupted { .. } => Some(HitlMode::Interrupt),
            _ => None,
        }
    }
}
