// Tracker Engine
// The stateful core that sits between the transport and the UI layer

//! # Tracker Engine Module
//!
//! Everything in this module is synchronous state plus the few async calls
//! that cross the transport boundary. The models in `models/` are plain
//! data; the engine decides how they change.
//!
//! ## Engine Components
//!
//! ### Clock (`clock` module)
//! - Source of "now" for timestamps and rate windows
//! - `ManualClock` lets tests move time explicitly
//!
//! ### Rate Guard (`rate_guard` module)
//! - Sliding-window admission per action key
//! - Consulted before a start request is sent
//!
//! ### Execution Registry (`registry` module)
//! - The only owner of `Execution` records, the current pointer and history
//! - Total operations: unknown ids are ignored, never errors
//!
//! ### Event Dispatcher (`dispatcher` module)
//! - Parses raw frames into `StreamEvent`s
//! - Applies each one to the registry in receipt order
//! - Tracks the connection lifecycle and the client correlation id
//!
//! ### HITL Coordinator (`hitl` module)
//! - One session per paused or interrupted execution
//! - Validates operator parameters, then sends resume or cancel
//!
//! ### Workflow Tracker (`tracker` module)
//! - Facade wiring all of the above to a `ControlTransport`
//!
//! ## Rust Learning Notes:
//!
//! ### Passing State Explicitly
//! The dispatcher and coordinator do not own the registry. They receive
//! `&mut ExecutionRegistry` per call, so ownership stays in one place (the
//! tracker) and each component can be tested against a bare registry.

pub mod clock;
pub mod dispatcher;
pub mod hitl;
pub mod rate_guard;
pub mod registry;
pub mod tracker;
