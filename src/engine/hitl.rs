// Human-in-the-loop coordinator: pause/interrupt -> resume/cancel

//! # HITL Coordinator
//!
//! When the remote workflow stops at a checkpoint (a `hitl.paused` event) or
//! is interrupted (a `hitl.interrupted` event, or an operator request), the
//! coordinator opens a session for that execution. The operator edits the
//! pre-populated parameters and either resumes or cancels.
//!
//! ## Session States
//!
//! ```text
//! idle ──open──▶ awaitingDecision ──prepare──▶ submitting ──settle(ok)──▶ idle
//!                   ▲    │                         │
//!                   │    └──close/discard──▶ idle  │
//!                   └──────────settle(err)─────────┘
//! ```
//!
//! Resume and cancel are split into a synchronous `prepare_*` step (local
//! intent: validation and the `submitting` phase) and a `settle` step that
//! records what the server said. Only the first successful settle for a
//! session takes effect; anything after it reports `StaleTransition`. The
//! async [`submit`](HitlCoordinator::submit) and
//! [`cancel`](HitlCoordinator::cancel) helpers run all three steps.
//!
//! Closing or discarding a session never touches the execution record.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use crate::models::{
    CancelRequest, Execution, HitlMode, HitlPhase, HitlSession, InterruptRequest,
    ParameterSchema, Parameters, ResumeRequest, StateSnapshot,
};
use crate::transport::ControlTransport;
use crate::{Result, TrackerError};

/// The request a prepared decision will send
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Resume(ResumeRequest),
    Cancel(CancelRequest),
}

/// A resume or cancel that passed local checks and awaits the server
///
/// Holds the generation of the session it was prepared for, so a reply to a
/// request made for an older session cannot close a newer one.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDecision {
    pub execution_id: String,
    pub decision: Decision,
    generation: u64,
}

impl PendingDecision {
    /// Send the prepared request through `transport`
    pub async fn send(&self, transport: &dyn ControlTransport) -> Result<()> {
        match &self.decision {
            Decision::Resume(request) => transport.resume(request.clone()).await,
            Decision::Cancel(request) => transport.cancel(request.clone()).await,
        }
    }

    fn action(&self) -> &'static str {
        match self.decision {
            Decision::Resume(_) => "resume",
            Decision::Cancel(_) => "cancel",
        }
    }
}

struct Slot {
    generation: u64,
    session: HitlSession,
}

impl Slot {
    fn accepts_refresh(&self, node_name: &str, mode: HitlMode) -> bool {
        self.session.phase == HitlPhase::AwaitingDecision
            && self.session.node_name == node_name
            && self.session.mode == mode
    }
}

/// Open HITL sessions, at most one per execution
pub struct HitlCoordinator {
    sessions: HashMap<String, Slot>,
    schema: ParameterSchema,
    clock: Arc<dyn Clock>,
    next_generation: u64,
}

impl HitlCoordinator {
    pub fn new(schema: ParameterSchema) -> Self {
        Self::with_clock(schema, Arc::new(SystemClock))
    }

    pub fn with_clock(schema: ParameterSchema, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: HashMap::new(),
            schema,
            clock,
            next_generation: 0,
        }
    }

    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    /// Open (or refresh) the session for an execution
    ///
    /// A session already awaiting a decision at the same node and mode keeps
    /// the operator's edits and only takes the newer snapshot. Anything else,
    /// including a session with a request in flight, is replaced.
    pub fn open(
        &mut self,
        execution: Option<&Execution>,
        execution_id: &str,
        node_name: &str,
        mode: HitlMode,
        raw_snapshot: serde_json::Value,
    ) -> &HitlSession {
        let snapshot = StateSnapshot::capture(execution, raw_snapshot);
        let opened_at = self.clock.now();

        let slot = match self.sessions.entry(execution_id.to_string()) {
            Entry::Occupied(entry) if entry.get().accepts_refresh(node_name, mode) => {
                debug!("Refreshing {} session for execution {}", mode, execution_id);
                let slot = entry.into_mut();
                slot.session.snapshot = snapshot;
                slot
            }
            entry => {
                info!(
                    "Opening {} session for execution {} at node {}",
                    mode, execution_id, node_name
                );
                self.next_generation += 1;
                let parameters = self.schema.prepopulate(&snapshot);
                let fresh = Slot {
                    generation: self.next_generation,
                    session: HitlSession {
                        execution_id: execution_id.to_string(),
                        node_name: node_name.to_string(),
                        mode,
                        phase: HitlPhase::AwaitingDecision,
                        baseline: parameters.clone(),
                        parameters,
                        snapshot,
                        validation_errors: Default::default(),
                        last_error: None,
                        opened_at,
                    },
                };
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(fresh);
                        occupied.into_mut()
                    }
                    Entry::Vacant(vacant) => vacant.insert(fresh),
                }
            }
        };

        &slot.session
    }

    /// Ask the server to interrupt a running node, then open an interrupt session
    pub async fn request_interrupt(
        &mut self,
        execution: &Execution,
        node_name: &str,
        transport: &dyn ControlTransport,
    ) -> Result<&HitlSession> {
        if execution.is_terminal() {
            return Err(TrackerError::stale(format!(
                "Execution {} already finished with status {}",
                execution.id, execution.status
            )));
        }
        if self.sessions.contains_key(&execution.id) {
            return Err(TrackerError::stale(format!(
                "Execution {} is already awaiting a decision",
                execution.id
            )));
        }

        transport
            .interrupt(InterruptRequest {
                execution_id: execution.id.clone(),
                node_name: node_name.to_string(),
            })
            .await?;

        Ok(self.open(
            Some(execution),
            &execution.id,
            node_name,
            HitlMode::Interrupt,
            serde_json::Value::Null,
        ))
    }

    /// Replace one editable parameter
    pub fn set_parameter(
        &mut self,
        execution_id: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let slot = self.slot_mut(execution_id)?;
        slot.session.parameters.insert(name.to_string(), value);
        slot.session.validation_errors.remove(name);
        Ok(())
    }

    /// Validate `parameters` and move the session to `submitting`
    ///
    /// On validation failure the session stays open with per-field errors
    /// and nothing is prepared. The request carries the primary field plus
    /// whatever differs from the pre-populated values; empty values are
    /// stripped.
    pub fn prepare_resume(
        &mut self,
        execution_id: &str,
        parameters: Parameters,
    ) -> Result<PendingDecision> {
        let errors = self.schema.validate(&parameters);
        let sent = self
            .session(execution_id)
            .map(|session| self.schema.changed(&session.baseline, &parameters))
            .unwrap_or_default();
        let slot = self.awaiting_slot_mut(execution_id)?;

        slot.session.parameters = parameters;
        if !errors.is_empty() {
            debug!(
                "Rejecting resume for {}: {} invalid field(s)",
                execution_id,
                errors.len()
            );
            slot.session.validation_errors = errors.clone();
            return Err(TrackerError::Validation { errors });
        }

        slot.session.validation_errors.clear();
        slot.session.last_error = None;
        slot.session.phase = HitlPhase::Submitting;

        Ok(PendingDecision {
            execution_id: execution_id.to_string(),
            decision: Decision::Resume(ResumeRequest {
                execution_id: execution_id.to_string(),
                parameters: sent,
                mode: slot.session.mode,
            }),
            generation: slot.generation,
        })
    }

    /// Move the session to `submitting` for a cancel request
    pub fn prepare_cancel(&mut self, execution_id: &str) -> Result<PendingDecision> {
        let slot = self.awaiting_slot_mut(execution_id)?;
        slot.session.last_error = None;
        slot.session.phase = HitlPhase::Submitting;

        Ok(PendingDecision {
            execution_id: execution_id.to_string(),
            decision: Decision::Cancel(CancelRequest {
                execution_id: execution_id.to_string(),
                mode: slot.session.mode,
            }),
            generation: slot.generation,
        })
    }

    /// Record the server's answer to a prepared decision
    ///
    /// Success closes the session. Failure puts it back to
    /// `awaitingDecision` with the error kept for display, and the error is
    /// returned unchanged so the caller can offer a retry.
    pub fn settle(&mut self, pending: &PendingDecision, outcome: Result<()>) -> Result<()> {
        let current = self
            .sessions
            .get(&pending.execution_id)
            .map_or(false, |slot| slot.generation == pending.generation);

        match outcome {
            Ok(()) if current => {
                info!(
                    "{} accepted for execution {}, closing session",
                    pending.action(),
                    pending.execution_id
                );
                self.sessions.remove(&pending.execution_id);
                Ok(())
            }
            Ok(()) => {
                debug!(
                    "Late {} reply for execution {} ignored",
                    pending.action(),
                    pending.execution_id
                );
                Err(TrackerError::stale(format!(
                    "HITL session for {} was already resolved",
                    pending.execution_id
                )))
            }
            Err(e) => {
                warn!(
                    "{} failed for execution {}: {}",
                    pending.action(),
                    pending.execution_id,
                    e
                );
                if let Some(slot) = self
                    .sessions
                    .get_mut(&pending.execution_id)
                    .filter(|slot| slot.generation == pending.generation)
                {
                    slot.session.phase = HitlPhase::AwaitingDecision;
                    slot.session.last_error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Validate, send a resume request and settle it
    pub async fn submit(
        &mut self,
        execution_id: &str,
        parameters: Parameters,
        transport: &dyn ControlTransport,
    ) -> Result<()> {
        let pending = self.prepare_resume(execution_id, parameters)?;
        let outcome = pending.send(transport).await;
        self.settle(&pending, outcome)
    }

    /// Send a cancel request and settle it
    pub async fn cancel(&mut self, execution_id: &str, transport: &dyn ControlTransport) -> Result<()> {
        let pending = self.prepare_cancel(execution_id)?;
        let outcome = pending.send(transport).await;
        self.settle(&pending, outcome)
    }

    /// Close a session locally without contacting the server
    pub fn close(&mut self, execution_id: &str) -> Option<HitlSession> {
        self.sessions.remove(execution_id).map(|slot| slot.session)
    }

    /// Drop the session of an execution that finished or was removed
    pub fn discard(&mut self, execution_id: &str) -> bool {
        let discarded = self.sessions.remove(execution_id).is_some();
        if discarded {
            debug!("Discarded HITL session for execution {}", execution_id);
        }
        discarded
    }

    pub fn session(&self, execution_id: &str) -> Option<&HitlSession> {
        self.sessions.get(execution_id).map(|slot| &slot.session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &HitlSession> {
        self.sessions.values().map(|slot| &slot.session)
    }

    pub fn is_open(&self, execution_id: &str) -> bool {
        self.sessions.contains_key(execution_id)
    }

    pub fn dispose(&mut self) {
        self.sessions.clear();
    }

    fn slot_mut(&mut self, execution_id: &str) -> Result<&mut Slot> {
        self.sessions.get_mut(execution_id).ok_or_else(|| {
            TrackerError::stale(format!("No open HITL session for execution {}", execution_id))
        })
    }

    fn awaiting_slot_mut(&mut self, execution_id: &str) -> Result<&mut Slot> {
        let slot = self.slot_mut(execution_id)?;
        if slot.session.phase == HitlPhase::Submitting {
            return Err(TrackerError::stale(format!(
                "A decision for execution {} is already in flight",
                execution_id
            )));
        }
        Ok(slot)
    }
}

impl Default for HitlCoordinator {
    fn default() -> Self {
        Self::new(ParameterSchema::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedTransport;
    use crate::ErrorKind;
    use chrono::Utc;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    fn paused(coordinator: &mut HitlCoordinator) {
        let execution = Execution::new("e1", "sales?", Utc::now());
        coordinator.open(
            Some(&execution),
            "e1",
            "n1",
            HitlMode::Pause,
            json!({"task_type": "analysis", "data": {"region": "EU"}}),
        );
    }

    #[test]
    fn test_open_prepopulates_parameters() {
        let mut coordinator = HitlCoordinator::default();
        paused(&mut coordinator);

        let session = coordinator.session("e1").unwrap();
        assert_eq!(session.mode, HitlMode::Pause);
        assert_eq!(session.phase, HitlPhase::AwaitingDecision);
        assert_eq!(session.parameters.get("user_input"), Some(&json!("sales?")));
        assert_eq!(session.parameters.get("task_type"), Some(&json!("analysis")));
        assert_eq!(session.parameters.get("region"), Some(&json!("EU")));
    }

    #[tokio::test]
    async fn test_submit_validation_then_success() {
        let transport = ScriptedTransport::new();
        let mut coordinator = HitlCoordinator::default();
        paused(&mut coordinator);

        let err = coordinator
            .submit("e1", Parameters::new(), &transport)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(transport.resume_count(), 0);

        let session = coordinator.session("e1").unwrap();
        assert_eq!(session.phase, HitlPhase::AwaitingDecision);
        assert!(session.validation_errors.contains_key("user_input"));

        coordinator
            .submit(
                "e1",
                params(json!({"user_input": "retry with X", "note": "", "extra": null})),
                &transport,
            )
            .await
            .unwrap();

        assert!(coordinator.session("e1").is_none());
        let resumes = transport.resumes.lock().unwrap();
        assert_eq!(resumes.len(), 1);
        assert_eq!(resumes[0].mode, HitlMode::Pause);
        assert_eq!(resumes[0].parameters, params(json!({"user_input": "retry with X"})));
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_session_open() {
        let transport = ScriptedTransport::new();
        transport.fail_next(1);
        let mut coordinator = HitlCoordinator::default();
        paused(&mut coordinator);

        let err = coordinator
            .submit("e1", params(json!({"user_input": "go"})), &transport)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let session = coordinator.session("e1").unwrap();
        assert_eq!(session.phase, HitlPhase::AwaitingDecision);
        assert!(session.last_error.is_some());

        coordinator.cancel("e1", &transport).await.unwrap();
        assert!(!coordinator.is_open("e1"));
        assert_eq!(transport.cancel_count(), 1);
    }

    #[test]
    fn test_first_success_wins() {
        let mut coordinator = HitlCoordinator::default();
        paused(&mut coordinator);

        let resume = coordinator
            .prepare_resume("e1", params(json!({"user_input": "go"})))
            .unwrap();
        let in_flight = coordinator.prepare_cancel("e1").unwrap_err();
        assert_eq!(in_flight.kind(), ErrorKind::StaleTransition);

        coordinator.settle(&resume, Ok(())).unwrap();
        let again = coordinator.settle(&resume, Ok(())).unwrap_err();
        assert_eq!(again.kind(), ErrorKind::StaleTransition);
    }

    #[test]
    fn test_late_reply_does_not_close_newer_session() {
        let mut coordinator = HitlCoordinator::default();
        paused(&mut coordinator);
        let resume = coordinator
            .prepare_resume("e1", params(json!({"user_input": "go"})))
            .unwrap();

        // next checkpoint arrives before the resume reply
        coordinator.open(None, "e1", "n2", HitlMode::Pause, json!({}));
        let err = coordinator.settle(&resume, Ok(())).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StaleTransition);
        assert_eq!(coordinator.session("e1").unwrap().node_name, "n2");
    }

    #[tokio::test]
    async fn test_resume_sends_only_edited_fields() {
        let transport = ScriptedTransport::new();
        let mut coordinator = HitlCoordinator::default();
        paused(&mut coordinator);
        coordinator
            .set_parameter("e1", "user_input", json!("retry with X"))
            .unwrap();

        let parameters = coordinator.session("e1").unwrap().parameters.clone();
        coordinator.submit("e1", parameters, &transport).await.unwrap();

        let resumes = transport.resumes.lock().unwrap();
        assert_eq!(resumes[0].parameters, params(json!({"user_input": "retry with X"})));
    }

    #[test]
    fn test_resume_includes_changed_prefilled_field() {
        let mut coordinator = HitlCoordinator::default();
        paused(&mut coordinator);
        coordinator.set_parameter("e1", "region", json!("US")).unwrap();

        let parameters = coordinator.session("e1").unwrap().parameters.clone();
        let pending = coordinator.prepare_resume("e1", parameters).unwrap();

        let Decision::Resume(request) = pending.decision else {
            panic!("expected a resume");
        };
        assert_eq!(
            request.parameters,
            params(json!({"user_input": "sales?", "region": "US"}))
        );
    }

    #[test]
    fn test_reopen_keeps_edits() {
        let mut coordinator = HitlCoordinator::default();
        paused(&mut coordinator);
        coordinator
            .set_parameter("e1", "user_input", json!("edited"))
            .unwrap();

        coordinator.open(None, "e1", "n1", HitlMode::Pause, json!({"query": "newer"}));

        let session = coordinator.session("e1").unwrap();
        assert_eq!(session.parameters.get("user_input"), Some(&json!("edited")));
        assert_eq!(session.snapshot.query.as_deref(), Some("newer"));
    }

    #[tokio::test]
    async fn test_no_session_is_stale() {
        let transport = ScriptedTransport::new();
        let mut coordinator = HitlCoordinator::default();

        let err = coordinator.cancel("e1", &transport).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleTransition);
        assert_eq!(transport.cancel_count(), 0);
    }

    #[tokio::test]
    async fn test_request_interrupt_opens_session() {
        let transport = ScriptedTransport::new();
        let mut coordinator = HitlCoordinator::default();
        let execution = Execution::new("e1", "sales?", Utc::now());

        let session = coordinator
            .request_interrupt(&execution, "n1", &transport)
            .await
            .unwrap();
        assert_eq!(session.mode, HitlMode::Interrupt);
        assert_eq!(session.parameters.get("user_input"), Some(&json!("sales?")));
        assert_eq!(transport.interrupts.lock().unwrap().len(), 1);

        let again = coordinator
            .request_interrupt(&execution, "n1", &transport)
            .await
            .unwrap_err();
        assert_eq!(again.kind(), ErrorKind::StaleTransition);
    }

    #[test]
    fn test_close_and_discard() {
        let mut coordinator = HitlCoordinator::default();
        paused(&mut coordinator);

        let closed = coordinator.close("e1").unwrap();
        assert_eq!(closed.node_name, "n1");
        assert!(!coordinator.discard("e1"));
    }
}
