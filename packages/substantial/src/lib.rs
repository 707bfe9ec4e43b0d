//! # substantial
//!
//! A durable workflow engine: workflow functions written as ordinary
//! imperative procedures are replayed over an append-only event log, so that
//! across crashes, retries, and restarts every computed value and every
//! externally delivered signal is remembered and each run makes monotonic
//! progress toward its terminal result.
//!
//! Workflows call a small set of context primitives (`save`, `sleep`,
//! `receive`, `handle`, `ensure`); the engine records every significant
//! outcome and short-circuits primitives whose result is already on record.
//! An agent polls a priority-queued schedule and replays runs under
//! time-bounded exclusive leases, coordinating workers across processes
//! purely through the backend.

pub mod agent;
pub mod backend;
pub mod conductor;
pub mod ctx;
pub mod error;
pub mod event;
pub mod filter;
pub mod registry;
pub mod retry;
pub mod run;
pub mod workflow;

mod activity;
mod utils;

pub mod prelude {
	pub use crate::agent::{Agent, AgentConfig};
	pub use crate::backend::fs::FsBackend;
	pub use crate::backend::redis::RedisBackend;
	pub use crate::backend::{Backend, BackendHandle};
	pub use crate::conductor::{AgentHandle, Conductor, DEFAULT_QUEUE};
	pub use crate::ctx::Context;
	pub use crate::error::{WorkflowError, WorkflowResult};
	pub use crate::event::{Event, EventRecord, Records, Stop};
	pub use crate::filter::{RunResult, SearchResult, WorkflowFilter};
	pub use crate::retry::RetryStrategy;
	pub use crate::run::Run;
	pub use crate::workflow::Workflow;
}
