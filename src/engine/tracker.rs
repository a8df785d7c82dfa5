// Workflow tracker facade - what a UI layer holds on to

//! # Workflow Tracker
//!
//! `WorkflowTracker` owns one of each engine component and a
//! [`ControlTransport`], and exposes the operations a UI layer needs:
//!
//! - actions: `start_execution`, `interrupt`, `submit_hitl`, `cancel_hitl`,
//!   `close_hitl`, `remove_execution`, `reset_current`
//! - stream input: `handle_frame`, `handle_event`, `run`
//! - read-only snapshots: `registry()`, `hitl()`, `dispatcher()`
//!
//! Actions are two-phase. The local intent (rate-guard admission, HITL
//! validation) happens before any request is sent; the registry only
//! reflects what the server confirms, either through a response (the new
//! execution id) or through stream events.
//!
//! The tracker is an explicit object with a `dispose()`, not a global: a
//! test or a second UI session simply creates another one.

use futures::Stream;
use std::sync::Arc;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::dispatcher::{DispatchOutcome, EventDispatcher};
use super::hitl::HitlCoordinator;
use super::rate_guard::RateGuard;
use super::registry::{ExecutionRegistry, UpdateOutcome};
use crate::config::{TrackerConfig, START_EXECUTION_KEY};
use crate::models::{HitlSession, Parameters, StartExecutionRequest, StreamEvent};
use crate::transport::ControlTransport;
use crate::{Result, TrackerError};

pub struct WorkflowTracker {
    config: TrackerConfig,
    transport: Arc<dyn ControlTransport>,
    rate_guard: RateGuard,
    registry: ExecutionRegistry,
    dispatcher: EventDispatcher,
    hitl: HitlCoordinator,
}

impl WorkflowTracker {
    pub fn new(config: TrackerConfig, transport: Arc<dyn ControlTransport>) -> Self {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: TrackerConfig,
        transport: Arc<dyn ControlTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rate_guard: RateGuard::with_clock(clock.clone()),
            registry: ExecutionRegistry::with_clock(config.registry.history_limit, clock.clone()),
            dispatcher: EventDispatcher::new(config.registry.keep_current_on_complete),
            hitl: HitlCoordinator::with_clock(config.parameter_schema(), clock),
            transport,
            config,
        }
    }

    /// Use a known client id instead of a generated one
    ///
    /// Needed when the transport was built with the same id, so outbound
    /// requests and the event stream are attributed to one session.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.dispatcher = EventDispatcher::with_client_id(
            client_id,
            self.config.registry.keep_current_on_complete,
        );
        self
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    /// Start a new execution on the server
    ///
    /// Checks the `start-execution` rate window first; a rejected call sends
    /// nothing. The execution is registered as soon as the server returns
    /// its id, unless the stream already delivered its `execution.started`.
    pub async fn start_execution(
        &mut self,
        query: &str,
        data_source_id: Option<String>,
    ) -> Result<String> {
        let rule = self.config.rate_limits.start_execution;
        let admission = self
            .rate_guard
            .try_admit(START_EXECUTION_KEY, rule.limit, rule.window_ms);
        if !admission.admitted {
            return Err(TrackerError::RateLimited {
                key: START_EXECUTION_KEY.to_string(),
                retry_after_ms: admission.retry_after_ms.unwrap_or(rule.window_ms),
            });
        }

        let response = self
            .transport
            .start_execution(StartExecutionRequest {
                query: query.to_string(),
                data_source_id,
                client_id: self.dispatcher.client_id().to_string(),
            })
            .await?;

        let execution_id = response.execution_id;
        if self.registry.contains(&execution_id) {
            debug!("Execution {} already registered from the stream", execution_id);
        } else {
            self.registry
                .start_execution(Some(execution_id.clone()), query, None);
        }
        info!("Started execution {}", execution_id);
        Ok(execution_id)
    }

    /// Ask the server to interrupt `node_name` and open an interrupt session
    pub async fn interrupt(&mut self, execution_id: &str, node_name: &str) -> Result<&HitlSession> {
        let execution = self.registry.execution(execution_id).ok_or_else(|| {
            TrackerError::stale(format!("Unknown execution {}", execution_id))
        })?;
        self.hitl
            .request_interrupt(execution, node_name, self.transport.as_ref())
            .await
    }

    pub fn set_hitl_parameter(
        &mut self,
        execution_id: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.hitl.set_parameter(execution_id, name, value)
    }

    /// Validate operator parameters and resume the paused execution
    pub async fn submit_hitl(&mut self, execution_id: &str, parameters: Parameters) -> Result<()> {
        self.hitl
            .submit(execution_id, parameters, self.transport.as_ref())
            .await
    }

    /// Cancel the paused or interrupted execution
    pub async fn cancel_hitl(&mut self, execution_id: &str) -> Result<()> {
        self.hitl.cancel(execution_id, self.transport.as_ref()).await
    }

    /// Dismiss the session locally; the execution record is untouched
    pub fn close_hitl(&mut self, execution_id: &str) -> Option<HitlSession> {
        self.hitl.close(execution_id)
    }

    /// Delete an execution, its history entry and any open session
    pub fn remove_execution(&mut self, execution_id: &str) -> UpdateOutcome {
        self.hitl.discard(execution_id);
        self.registry.remove_execution(execution_id)
    }

    pub fn reset_current(&mut self) {
        self.registry.reset_current();
    }

    // ------------------------------------------------------------------
    // Stream input
    // ------------------------------------------------------------------

    pub fn handle_frame(&mut self, frame: &str) -> DispatchOutcome {
        self.dispatcher
            .ingest_frame(frame, &mut self.registry, &mut self.hitl)
    }

    pub fn handle_event(&mut self, event: &StreamEvent) -> DispatchOutcome {
        self.dispatcher
            .dispatch(event, &mut self.registry, &mut self.hitl)
    }

    /// Apply a whole frame stream; see [`EventDispatcher::run`]
    pub async fn run<S, F>(&mut self, frames: S, observer: F) -> Result<()>
    where
        S: Stream<Item = Result<String>> + Unpin,
        F: FnMut(Option<&StreamEvent>, &DispatchOutcome),
    {
        self.dispatcher
            .run(frames, &mut self.registry, &mut self.hitl, observer)
            .await
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        self.dispatcher.client_id()
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    pub fn hitl(&self) -> &HitlCoordinator {
        &self.hitl
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Connection lifecycle is driven by whoever owns the event source
    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    pub fn rate_guard(&self) -> &RateGuard {
        &self.rate_guard
    }

    /// Drop every execution, session and rate window
    pub fn dispose(&mut self) {
        info!("Disposing tracker for client {}", self.dispatcher.client_id());
        self.hitl.dispose();
        self.registry.dispose();
        self.rate_guard.reset(START_EXECUTION_KEY);
        self.dispatcher.disconnected();
    }
}
