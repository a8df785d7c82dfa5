// Outbound control requests sent to the workflow server

use serde::{Deserialize, Serialize};

use super::hitl::{HitlMode, Parameters};

/// Ask the server to start a new execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_source_id: Option<String>,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionResponse {
    pub execution_id: String,
}

/// Ask the server to interrupt a running node; acknowledgment only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRequest {
    pub execution_id: String,
    pub node_name: String,
}

/// Continue a paused or interrupted execution with operator overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub execution_id: String,
    pub parameters: Parameters,
    pub mode: HitlMode,
}

/// Abandon a paused or interrupted execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub execution_id: String,
    pub mode: HitlMode,
}

/// Generic success/failure body returned by resume and cancel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlAck {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}
