// Event dispatcher: raw stream frames -> registry updates, in receipt order

//! # Event Dispatcher
//!
//! The dispatcher owns the client side of the event stream: the client
//! correlation id sent with every outbound request, the connection state,
//! and the mapping from each [`StreamEvent`] to exactly one registry (or
//! HITL coordinator) operation:
//!
//! | Event                  | Operation                                     |
//! |------------------------|-----------------------------------------------|
//! | `execution.started`    | `ExecutionRegistry::start_execution`          |
//! | `node.started`         | `ExecutionRegistry::start_node_with_input`    |
//! | `node.completed`       | `ExecutionRegistry::complete_node`            |
//! | `node.error`           | `ExecutionRegistry::error_node`               |
//! | `edge.activated`       | `ExecutionRegistry::activate_edge`            |
//! | `execution.completed`  | `ExecutionRegistry::complete_execution`       |
//! | `execution.error`      | `ExecutionRegistry::error_execution`          |
//! | `execution.cancelled`  | `ExecutionRegistry::error_execution`          |
//! | `hitl.paused`          | `HitlCoordinator::open` (pause)               |
//! | `hitl.interrupted`     | `HitlCoordinator::open` (interrupt)           |
//!
//! Frames are applied one at a time, in the order they arrive. A frame that
//! does not parse, or that names an execution or node this client never saw,
//! is dropped and counted; the stream keeps going.
//!
//! ## Connection Lifecycle
//!
//! `disconnected → connecting → connected`, plus `error`, which is entered on
//! any transport failure and is absorbing until [`EventDispatcher::recover`]
//! is called. Recovery keeps the client id so executions already running on
//! the server can still be attributed to this session.

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::hitl::HitlCoordinator;
use super::registry::{ExecutionRegistry, IgnoreReason, UpdateOutcome};
use crate::models::{HitlMode, StreamEvent};
use crate::{Result, TrackerError};

/// State of the single event-stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What happened to one inbound frame
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The registry changed
    Applied,
    /// A HITL session was opened or refreshed
    HitlOpened(HitlMode),
    /// Valid but stale; nothing changed
    Ignored(IgnoreReason),
    /// Malformed or unattributable; nothing changed
    Dropped(TrackerError),
}

impl DispatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DispatchOutcome::Applied | DispatchOutcome::HitlOpened(_))
    }
}

/// Running counters over every frame seen by a dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub applied: u64,
    pub ignored: u64,
    pub dropped: u64,

    /// Frames per event kind, including ignored and dropped ones
    pub by_kind: BTreeMap<&'static str, u64>,
}

impl DispatchStats {
    pub fn total(&self) -> u64 {
        self.applied + self.ignored + self.dropped
    }
}

pub struct EventDispatcher {
    client_id: String,
    state: ConnectionState,
    stats: DispatchStats,
    retain_current_on_complete: bool,
}

impl EventDispatcher {
    /// New dispatcher with a freshly generated client id
    pub fn new(retain_current_on_complete: bool) -> Self {
        Self::with_client_id(Uuid::new_v4().to_string(), retain_current_on_complete)
    }

    pub fn with_client_id(client_id: impl Into<String>, retain_current_on_complete: bool) -> Self {
        Self {
            client_id: client_id.into(),
            state: ConnectionState::Disconnected,
            stats: DispatchStats::default(),
            retain_current_on_complete,
        }
    }

    /// Correlation id to attach to every outbound request
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == ConnectionState::Error && next != ConnectionState::Error {
            warn!(
                "Ignoring transition to {:?}: event stream for client {} is in the error state",
                next, self.client_id
            );
            return false;
        }
        if self.state != next {
            info!("Event stream {:?} -> {:?}", self.state, next);
            self.state = next;
        }
        true
    }

    pub fn connecting(&mut self) -> bool {
        self.transition(ConnectionState::Connecting)
    }

    pub fn connected(&mut self) -> bool {
        self.transition(ConnectionState::Connected)
    }

    pub fn disconnected(&mut self) -> bool {
        self.transition(ConnectionState::Disconnected)
    }

    /// Record a transport failure; the connection stays in `error`
    pub fn fail(&mut self, reason: &TrackerError) {
        error!("Event stream for client {} failed: {}", self.client_id, reason);
        self.transition(ConnectionState::Error);
    }

    /// Leave the error state so a new connection can be opened
    ///
    /// The client id is kept.
    pub fn recover(&mut self) {
        if self.state == ConnectionState::Error {
            info!("Recovering event stream for client {}", self.client_id);
            self.state = ConnectionState::Disconnected;
        }
    }

    // ------------------------------------------------------------------
    // Event application
    // ------------------------------------------------------------------

    /// Parse one raw frame and apply it
    pub fn ingest_frame(
        &mut self,
        frame: &str,
        registry: &mut ExecutionRegistry,
        hitl: &mut HitlCoordinator,
    ) -> DispatchOutcome {
        match StreamEvent::from_frame(frame) {
            Ok(event) => self.dispatch(&event, registry, hitl),
            Err(e) => self.drop_malformed(e),
        }
    }

    /// Apply one event to the registry or the HITL coordinator
    pub fn dispatch(
        &mut self,
        event: &StreamEvent,
        registry: &mut ExecutionRegistry,
        hitl: &mut HitlCoordinator,
    ) -> DispatchOutcome {
        *self.stats.by_kind.entry(event.kind()).or_insert(0) += 1;

        let outcome = match event {
            StreamEvent::ExecutionStarted {
                execution_id,
                query,
                timestamp,
            } => match registry.execution(execution_id) {
                Some(existing) if !existing.is_terminal() => {
                    UpdateOutcome::Ignored(IgnoreReason::AlreadyStarted).into()
                }
                _ => {
                    registry.start_execution(Some(execution_id.clone()), query.clone(), *timestamp);
                    DispatchOutcome::Applied
                }
            },

            StreamEvent::NodeStarted {
                execution_id,
                node_id,
                node_type,
                input,
            } => registry
                .start_node_with_input(execution_id, node_id, node_type, input.clone())
                .into(),

            StreamEvent::NodeCompleted {
                execution_id,
                node_id,
                output,
            } => registry
                .complete_node(execution_id, node_id, output.clone())
                .into(),

            StreamEvent::NodeError {
                execution_id,
                node_id,
                error,
            } => registry.error_node(execution_id, node_id, error.clone()).into(),

            StreamEvent::EdgeActivated {
                execution_id,
                from,
                to,
            } => registry.activate_edge(execution_id, from, to).into(),

            StreamEvent::ExecutionCompleted {
                execution_id,
                result,
            } => {
                let outcome = registry.complete_execution(
                    execution_id,
                    result.clone(),
                    self.retain_current_on_complete,
                );
                hitl.discard(execution_id);
                outcome.into()
            }

            StreamEvent::ExecutionError {
                execution_id,
                error,
            } => {
                let outcome = registry.error_execution(execution_id, error.clone());
                hitl.discard(execution_id);
                outcome.into()
            }

            StreamEvent::ExecutionCancelled {
                execution_id,
                reason,
            } => {
                let reason = reason.as_deref().unwrap_or("Execution cancelled");
                let outcome = registry.error_execution(execution_id, reason.into());
                hitl.discard(execution_id);
                outcome.into()
            }

            StreamEvent::HitlPaused {
                execution_id,
                node_name,
                state_snapshot,
            }
            | StreamEvent::HitlInterrupted {
                execution_id,
                node_name,
                state_snapshot,
            } => {
                let mode = event.hitl_mode().unwrap_or(HitlMode::Pause);
                match registry.execution(execution_id) {
                    None => UpdateOutcome::Ignored(IgnoreReason::UnknownExecution).into(),
                    Some(execution) if execution.is_terminal() => {
                        UpdateOutcome::Ignored(IgnoreReason::AlreadyTerminal).into()
                    }
                    Some(execution) => {
                        hitl.open(
                            Some(execution),
                            execution_id,
                            node_name,
                            mode,
                            state_snapshot.clone(),
                        );
                        DispatchOutcome::HitlOpened(mode)
                    }
                }
            }
        };

        self.record(event, outcome)
    }

    /// Apply frames from `frames` until the stream ends or fails
    ///
    /// `observer` sees every frame's outcome, with the parsed event when
    /// there is one. A stream error moves the connection to `error` and is
    /// returned; a clean end of stream leaves it `disconnected`.
    pub async fn run<S, F>(
        &mut self,
        mut frames: S,
        registry: &mut ExecutionRegistry,
        hitl: &mut HitlCoordinator,
        mut observer: F,
    ) -> Result<()>
    where
        S: Stream<Item = Result<String>> + Unpin,
        F: FnMut(Option<&StreamEvent>, &DispatchOutcome),
    {
        if !self.connected() {
            return Err(TrackerError::stale(format!(
                "Event stream for client {} is in the error state",
                self.client_id
            )));
        }

        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            };

            match StreamEvent::from_frame(&frame) {
                Ok(event) => {
                    let outcome = self.dispatch(&event, registry, hitl);
                    observer(Some(&event), &outcome);
                }
                Err(e) => {
                    let outcome = self.drop_malformed(e);
                    observer(None, &outcome);
                }
            }
        }

        self.disconnected();
        Ok(())
    }

    fn drop_malformed(&mut self, error: TrackerError) -> DispatchOutcome {
        warn!("Dropping malformed frame: {}", error);
        self.stats.dropped += 1;
        DispatchOutcome::Dropped(error)
    }

    fn record(&mut self, event: &StreamEvent, outcome: DispatchOutcome) -> DispatchOutcome {
        match outcome {
            DispatchOutcome::Ignored(reason) if reason.is_unattributable() => {
                let error = TrackerError::UnattributableEvent {
                    kind: event.kind().to_string(),
                    execution_id: event.execution_id().to_string(),
                    detail: reason.as_str().to_string(),
                };
                warn!("Dropping event: {}", error);
                self.stats.dropped += 1;
                DispatchOutcome::Dropped(error)
            }
            DispatchOutcome::Ignored(reason) => {
                debug!(
                    "Ignoring {} for execution {}: {}",
                    event.kind(),
                    event.execution_id(),
                    reason.as_str()
                );
                self.stats.ignored += 1;
                outcome
            }
            DispatchOutcome::Dropped(_) => {
                self.stats.dropped += 1;
                outcome
            }
            DispatchOutcome::Applied | DispatchOutcome::HitlOpened(_) => {
                self.stats.applied += 1;
                outcome
            }
        }
    }
}

impl From<UpdateOutcome> for DispatchOutcome {
    fn from(outcome: UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::Applied => DispatchOutcome::Applied,
            UpdateOutcome::Ignored(reason) => DispatchOutcome::Ignored(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStatus, NodeStatus};
    use crate::ErrorKind;
    use futures::stream;
    use serde_json::json;

    struct Harness {
        dispatcher: EventDispatcher,
        registry: ExecutionRegistry,
        hitl: HitlCoordinator,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dispatcher: EventDispatcher::with_client_id("client-1", true),
                registry: ExecutionRegistry::default(),
                hitl: HitlCoordinator::default(),
            }
        }

        fn feed(&mut self, frame: serde_json::Value) -> DispatchOutcome {
            self.dispatcher
                .ingest_frame(&frame.to_string(), &mut self.registry, &mut self.hitl)
        }
    }

    #[test]
    fn test_events_applied_in_order() {
        let mut h = Harness::new();

        assert!(h
            .feed(json!({"type": "execution.started", "executionId": "e1", "query": "sales?"}))
            .is_applied());
        assert!(h
            .feed(json!({"type": "node.started", "executionId": "e1", "nodeId": "n1", "nodeType": "process"}))
            .is_applied());
        assert!(h
            .feed(json!({"type": "edge.activated", "executionId": "e1", "from": "n1", "to": "n2"}))
            .is_applied());
        assert!(h
            .feed(json!({"type": "node.completed", "executionId": "e1", "nodeId": "n1", "output": {"rows": 3}}))
            .is_applied());
        assert!(h
            .feed(json!({"type": "execution.completed", "executionId": "e1", "result": {"ok": true}}))
            .is_applied());

        let execution = h.registry.execution("e1").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.nodes["n1"].status, NodeStatus::Completed);
        assert_eq!(execution.nodes["n1"].output, Some(json!({"rows": 3})));
        assert!(h.registry.is_edge_active("e1", "n1", "n2"));
        assert_eq!(h.registry.current_id(), Some("e1"));
        assert_eq!(h.dispatcher.stats().applied, 5);
    }

    #[test]
    fn test_unattributable_events_dropped() {
        let mut h = Harness::new();
        h.feed(json!({"type": "execution.started", "executionId": "e1", "query": "q"}));

        let ghost_node =
            h.feed(json!({"type": "node.completed", "executionId": "e1", "nodeId": "ghost"}));
        let ghost_exec =
            h.feed(json!({"type": "edge.activated", "executionId": "e9", "from": "a", "to": "b"}));

        match ghost_node {
            DispatchOutcome::Dropped(e) => assert_eq!(e.kind(), ErrorKind::UnattributableEvent),
            other => panic!("expected drop, got {:?}", other),
        }
        assert!(matches!(ghost_exec, DispatchOutcome::Dropped(_)));
        assert!(h.registry.execution("e1").unwrap().nodes.is_empty());
        assert_eq!(h.dispatcher.stats().dropped, 2);
    }

    #[test]
    fn test_malformed_and_unknown_kind_dropped() {
        let mut h = Harness::new();
        let garbage = h
            .dispatcher
            .ingest_frame("not json", &mut h.registry, &mut h.hitl);
        let unknown = h.feed(json!({"type": "graph.rendered", "executionId": "e1"}));

        match garbage {
            DispatchOutcome::Dropped(e) => assert_eq!(e.kind(), ErrorKind::Serialization),
            other => panic!("expected drop, got {:?}", other),
        }
        assert!(matches!(unknown, DispatchOutcome::Dropped(_)));
        assert_eq!(h.dispatcher.stats().dropped, 2);
        assert!(h.dispatcher.stats().by_kind.is_empty());
    }

    #[test]
    fn test_duplicate_completion_ignored() {
        let mut h = Harness::new();
        h.feed(json!({"type": "execution.started", "executionId": "e1", "query": "q"}));
        h.feed(json!({"type": "node.started", "executionId": "e1", "nodeId": "n1", "nodeType": "llm"}));
        h.feed(json!({"type": "node.completed", "executionId": "e1", "nodeId": "n1", "output": 1}));
        let duration = h.registry.execution("e1").unwrap().nodes["n1"].duration;

        let again = h.feed(json!({"type": "node.completed", "executionId": "e1", "nodeId": "n1", "output": 2}));

        assert!(matches!(
            again,
            DispatchOutcome::Ignored(IgnoreReason::AlreadyTerminal)
        ));
        let node = &h.registry.execution("e1").unwrap().nodes["n1"];
        assert_eq!(node.output, Some(json!(1)));
        assert_eq!(node.duration, duration);
        assert_eq!(node.retry_count, 0);
        assert_eq!(h.dispatcher.stats().ignored, 1);
        assert_eq!(h.dispatcher.stats().by_kind["node.completed"], 2);
    }

    #[test]
    fn test_redelivered_start_keeps_progress() {
        let mut h = Harness::new();
        h.feed(json!({"type": "execution.started", "executionId": "e1", "query": "q"}));
        h.feed(json!({"type": "node.started", "executionId": "e1", "nodeId": "n1", "nodeType": "llm"}));

        let again = h.feed(json!({"type": "execution.started", "executionId": "e1", "query": "q"}));

        assert!(matches!(
            again,
            DispatchOutcome::Ignored(IgnoreReason::AlreadyStarted)
        ));
        assert!(h.registry.execution("e1").unwrap().node("n1").is_some());
    }

    #[test]
    fn test_hitl_pause_opens_session_and_terminal_discards_it() {
        let mut h = Harness::new();
        h.feed(json!({"type": "execution.started", "executionId": "e1", "query": "sales?"}));

        let opened = h.feed(json!({
            "type": "hitl.paused",
            "executionId": "e1",
            "nodeName": "n1",
            "stateSnapshot": {"task_type": "analysis"}
        }));
        assert!(matches!(opened, DispatchOutcome::HitlOpened(HitlMode::Pause)));
        assert_eq!(h.hitl.session("e1").unwrap().mode, HitlMode::Pause);

        h.feed(json!({"type": "execution.cancelled", "executionId": "e1"}));

        assert!(h.hitl.session("e1").is_none());
        let execution = h.registry.execution("e1").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert_eq!(execution.error, Some(json!("Execution cancelled")));
        assert_eq!(h.registry.current_id(), None);
    }

    #[test]
    fn test_hitl_for_unknown_execution_dropped() {
        let mut h = Harness::new();
        let outcome = h.feed(json!({
            "type": "hitl.interrupted",
            "executionId": "e1",
            "nodeName": "n1"
        }));
        assert!(matches!(outcome, DispatchOutcome::Dropped(_)));
        assert!(!h.hitl.is_open("e1"));
    }

    #[test]
    fn test_completion_can_clear_current() {
        let mut h = Harness::new();
        h.dispatcher = EventDispatcher::with_client_id("client-1", false);
        h.feed(json!({"type": "execution.started", "executionId": "e1", "query": "q"}));
        h.feed(json!({"type": "execution.completed", "executionId": "e1", "result": null}));
        assert_eq!(h.registry.current_id(), None);
    }

    #[test]
    fn test_error_state_is_absorbing() {
        let mut dispatcher = EventDispatcher::new(true);
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        assert!(dispatcher.connecting());
        assert!(dispatcher.connected());

        dispatcher.fail(&TrackerError::transport("reset by peer"));
        assert_eq!(dispatcher.state(), ConnectionState::Error);
        assert!(!dispatcher.connected());
        assert_eq!(dispatcher.state(), ConnectionState::Error);

        let client_id = dispatcher.client_id().to_string();
        dispatcher.recover();
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        assert_eq!(dispatcher.client_id(), client_id);
    }

    #[tokio::test]
    async fn test_run_applies_stream_in_order() {
        let mut h = Harness::new();
        let frames = stream::iter(vec![
            Ok(json!({"type": "execution.started", "executionId": "e1", "query": "q"}).to_string()),
            Ok(json!({"type": "node.started", "executionId": "e1", "nodeId": "n1", "nodeType": "llm"}).to_string()),
            Ok("{broken".to_string()),
            Ok(json!({"type": "node.error", "executionId": "e1", "nodeId": "n1", "error": "boom"}).to_string()),
        ]);

        let mut seen = Vec::new();
        h.dispatcher
            .run(frames, &mut h.registry, &mut h.hitl, |event, outcome| {
                seen.push((event.map(|e| e.kind()), outcome.is_applied()));
            })
            .await
            .unwrap();

        assert_eq!(
            seen,
            vec![
                (Some("execution.started"), true),
                (Some("node.started"), true),
                (None, false),
                (Some("node.error"), true),
            ]
        );
        assert_eq!(h.dispatcher.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.registry.execution("e1").unwrap().nodes["n1"].status,
            NodeStatus::Error
        );
    }

    #[tokio::test]
    async fn test_run_stream_failure_enters_error_state() {
        let mut h = Harness::new();
        let frames = stream::iter(vec![
            Ok(json!({"type": "execution.started", "executionId": "e1", "query": "q"}).to_string()),
            Err(TrackerError::transport("connection reset")),
            Ok(json!({"type": "execution.completed", "executionId": "e1"}).to_string()),
        ]);

        let err = h
            .dispatcher
            .run(frames, &mut h.registry, &mut h.hitl, |_, _| {})
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(h.dispatcher.state(), ConnectionState::Error);
        assert_eq!(
            h.registry.execution("e1").unwrap().status,
            ExecutionStatus::Running
        );
    }
}
