// Core data models for the execution tracker
// These are plain, serializable data structures with no I/O

//! # Domain Models Module
//!
//! This module contains the data types the tracker works with:
//! - [`execution`]: executions, nodes, edges and history entries
//! - [`event`]: the inbound stream event contract
//! - [`hitl`]: human-in-the-loop sessions and parameter rules
//! - [`request`]: outbound control request payloads
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API. Users can import
//! `use execution_tracker::models::Execution` instead of
//! `use execution_tracker::models::execution::Execution`.

// Execution, NodeExecution and the history projection
pub mod execution;

// The tagged union of server-pushed events
pub mod event;

// HITL session state and parameter validation
pub mod hitl;

// Request/response bodies for the control transport
pub mod request;

pub use execution::{
    ActiveEdge, Execution, ExecutionHistoryEntry, ExecutionStatus, NodeDisplayStatus,
    NodeExecution, NodeStatus,
};

pub use event::StreamEvent;

pub use hitl::{
    strip_empty, FieldRule, HitlMode, HitlPhase, HitlSession, ParameterSchema, Parameters,
    StateSnapshot, ValidationErrors,
};

pub use request::{
    CancelRequest, ControlAck, InterruptRequest, ResumeRequest, StartExecutionRequest,
    StartExecutionResponse,
};
