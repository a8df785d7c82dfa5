// Execution Tracker
// Client-side view of server-executed workflows, with human-in-the-loop control

//! # Execution Tracker Library
//!
//! This crate keeps a local, consistent view of a long-running workflow that
//! executes on a remote server. It consumes the server's lifecycle event
//! stream, folds each event into an in-memory registry, and drives the
//! human-in-the-loop (HITL) protocol that can pause, interrupt, resume or
//! cancel the remote run.
//!
//! ## Core Components
//!
//! - [`RateGuard`]: sliding-window admission control for new executions
//! - [`ExecutionRegistry`]: the single store of executions, nodes and history
//! - [`EventDispatcher`]: turns raw stream frames into registry updates, in
//!   receipt order, dropping anything it cannot attribute
//! - [`HitlCoordinator`]: the pause/interrupt → resume/cancel state machine
//! - [`WorkflowTracker`]: the facade a UI layer talks to
//!
//! ## Control Flow
//!
//! ```text
//! UI action
//!   ↓ checked by
//! RateGuard
//!   ↓ then sent through
//! ControlTransport (start / interrupt / resume / cancel)
//!   ↓ server pushes events over
//! WebSocketEventSource
//!   ↓ applied by
//! EventDispatcher → ExecutionRegistry / HitlCoordinator
//!   ↓ read back by
//! UI selectors
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use execution_tracker::{HttpControlClient, TrackerConfig, WorkflowTracker};
//!
//! # async fn demo() -> execution_tracker::Result<()> {
//! let config = TrackerConfig::default();
//! let transport = Arc::new(HttpControlClient::from_config(&config)?);
//! let mut tracker = WorkflowTracker::new(config, transport);
//!
//! let execution_id = tracker.start_execution("monthly sales?", None).await?;
//! println!("started {}", execution_id);
//! # Ok(())
//! # }
//! ```

// Plain data types shared by every component
pub mod models;

// The stateful core: registry, dispatcher, HITL coordinator, rate guard
pub mod engine;

// Outbound control requests and the inbound event stream
pub mod transport;

// Layered configuration (defaults, file, environment)
pub mod config;

pub use models::{
    ActiveEdge, Execution, ExecutionHistoryEntry, ExecutionStatus, HitlMode, HitlPhase,
    HitlSession, NodeDisplayStatus, NodeExecution, NodeStatus, ParameterSchema, Parameters,
    StateSnapshot, StreamEvent,
};

pub use engine::{
    clock::{Clock, ManualClock, SystemClock},
    dispatcher::{ConnectionState, DispatchOutcome, DispatchStats, EventDispatcher},
    hitl::{Decision, HitlCoordinator, PendingDecision},
    rate_guard::{Admission, RateGuard},
    registry::{ExecutionRegistry, IgnoreReason, UpdateOutcome},
    tracker::WorkflowTracker,
};

pub use transport::{
    http::HttpControlClient, websocket::WebSocketEventSource, ControlTransport, FrameStream,
};

pub use crate::config::TrackerConfig;

use models::ValidationErrors;
use thiserror::Error;

/// Error types surfaced by tracker operations
///
/// None of these are fatal to the tracker. Each one stays local to the
/// operation that produced it and is handed back as a value; a UI layer
/// decides how to present it using [`TrackerError::kind`].
#[derive(Error, Debug)]
pub enum TrackerError {
    /// An event referenced an execution or node this client does not know
    #[error("Unattributable {kind} event for execution {execution_id}: {detail}")]
    UnattributableEvent {
        kind: String,
        execution_id: String,
        detail: String,
    },

    /// One or more HITL parameters failed their field rule
    #[error("Validation failed for: {}", field_list(.errors))]
    Validation { errors: ValidationErrors },

    /// A request failed at the network layer; the caller may retry
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The rate guard rejected the action; no request was sent
    #[error("Rate limited on '{key}', retry after {retry_after_ms}ms")]
    RateLimited { key: String, retry_after_ms: u64 },

    /// The transition no longer applies (already terminal, already resolved)
    #[error("Stale transition: {message}")]
    StaleTransition { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Discriminant of [`TrackerError`] for collaborators that branch on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnattributableEvent,
    Validation,
    Transport,
    RateLimited,
    StaleTransition,
    Configuration,
    Serialization,
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::UnattributableEvent { .. } => ErrorKind::UnattributableEvent,
            TrackerError::Validation { .. } => ErrorKind::Validation,
            TrackerError::Transport { .. } => ErrorKind::Transport,
            TrackerError::RateLimited { .. } => ErrorKind::RateLimited,
            TrackerError::StaleTransition { .. } => ErrorKind::StaleTransition,
            TrackerError::Configuration { .. } => ErrorKind::Configuration,
            TrackerError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Only transport failures are worth retrying as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackerError::Transport { .. })
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        TrackerError::Transport {
            message: message.into(),
        }
    }

    pub(crate) fn stale(message: impl Into<String>) -> Self {
        TrackerError::StaleTransition {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TrackerError::transport(format!("Request timed out: {}", error))
        } else if error.is_connect() {
            TrackerError::transport(format!("Connection failed: {}", error))
        } else {
            TrackerError::transport(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TrackerError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        TrackerError::transport(format!("WebSocket error: {}", error))
    }
}

impl From<url::ParseError> for TrackerError {
    fn from(error: url::ParseError) -> Self {
        TrackerError::Configuration {
            message: format!("Invalid URL: {}", error),
        }
    }
}

impl From<::config::ConfigError> for TrackerError {
    fn from(error: ::config::ConfigError) -> Self {
        TrackerError::Configuration {
            message: error.to_string(),
        }
    }
}

fn field_list(errors: &ValidationErrors) -> String {
    errors.keys().cloned().collect::<Vec<_>>().join(", ")
}

/// Type alias for Results that use the tracker's error type
pub type Result<T> = std::result::Result<T, TrackerError>;
