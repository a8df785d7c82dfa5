// Transport seams between the tracker core and the workflow server

//! # Transport Layer
//!
//! The core never talks to the network directly. Outbound control requests
//! go through the [`ControlTransport`] trait and inbound events arrive as a
//! stream of raw text frames. Two implementations ship with the crate:
//!
//! - [`http::HttpControlClient`]: JSON over HTTP with `reqwest`
//! - [`websocket::WebSocketEventSource`]: server push over `tokio-tungstenite`
//!
//! Anything else that can deliver ordered, correlated messages (a test
//! double, an SSE bridge, an in-process channel) can stand in for them.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::models::{
    CancelRequest, InterruptRequest, ResumeRequest, StartExecutionRequest, StartExecutionResponse,
};
use crate::Result;

pub mod http;
pub mod websocket;

/// Inbound raw text frames, in the order the server sent them
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Outbound control requests
///
/// Every method returns `TrackerError::Transport` on network or server
/// failure. The core never retries on its own.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Ask the server to start an execution, returning its id
    async fn start_execution(&self, request: StartExecutionRequest) -> Result<StartExecutionResponse>;

    /// Ask the server to interrupt a running node (acknowledgment only)
    async fn interrupt(&self, request: InterruptRequest) -> Result<()>;

    /// Continue a paused/interrupted execution with operator overrides
    async fn resume(&self, request: ResumeRequest) -> Result<()>;

    /// Abandon a paused/interrupted execution
    async fn cancel(&self, request: CancelRequest) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport double shared by the engine tests

    use super::*;
    use crate::TrackerError;
    use std::sync::Mutex;

    /// Records every request and fails on demand
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub starts: Mutex<Vec<StartExecutionRequest>>,
        pub interrupts: Mutex<Vec<InterruptRequest>>,
        pub resumes: Mutex<Vec<ResumeRequest>>,
        pub cancels: Mutex<Vec<CancelRequest>>,
        failures_left: Mutex<u32>,
        next_id: Mutex<u32>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `count` requests fail with a transport error
        pub fn fail_next(&self, count: u32) {
            *self.failures_left.lock().unwrap() = count;
        }

        pub fn resume_count(&self) -> usize {
            self.resumes.lock().unwrap().len()
        }

        pub fn cancel_count(&self) -> usize {
            self.cancels.lock().unwrap().len()
        }

        fn check(&self) -> Result<()> {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TrackerError::transport("scripted failure"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ControlTransport for ScriptedTransport {
        async fn start_execution(
            &self,
            request: StartExecutionRequest,
        ) -> Result<StartExecutionResponse> {
            self.check()?;
            self.starts.lock().unwrap().push(request);
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(StartExecutionResponse {
                execution_id: format!("exec-{}", *next),
            })
        }

        async fn interrupt(&self, request: InterruptRequest) -> Result<()> {
            self.check()?;
            self.interrupts.lock().unwrap().push(request);
            Ok(())
        }

        async fn resume(&self, request: ResumeRequest) -> Result<()> {
            self.check()?;
            self.resumes.lock().unwrap().push(request);
            Ok(())
        }

        async fn cancel(&self, request: CancelRequest) -> Result<()> {
            self.check()?;
            self.cancels.lock().unwrap().push(request);
            Ok(())
        }
    }
}
