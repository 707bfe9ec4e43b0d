use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
	error::WorkflowResult,
	event::{EventRecord, Records},
};

pub mod fs;
pub mod redis;

pub type BackendHandle = Arc<dyn Backend>;

/// Contract the engine requires from any durable store: event log, metadata
/// log, schedule queue, lease registry, and workflow-link index.
///
/// Composite mutations (`add_schedule` fusing, `close_schedule`, lease
/// acquire/renew/remove) must be atomic against concurrent workers.
#[async_trait]
pub trait Backend: Send + Sync {
	// run related

	async fn read_events(&self, run_id: &str) -> WorkflowResult<Option<Records>>;

	async fn write_events(&self, run_id: &str, records: Records) -> WorkflowResult<()>;

	async fn read_all_metadata(&self, run_id: &str) -> WorkflowResult<Vec<String>>;

	async fn append_metadata(
		&self,
		run_id: &str,
		schedule: DateTime<Utc>,
		content: &str,
	) -> WorkflowResult<()>;

	/// Queues a replay for `run_id` at `schedule`. A `None` payload is a bare
	/// replay. Adding a payload-carrying entry first closes any earlier bare
	/// entries for the same run; new input supersedes pending retry requests.
	async fn add_schedule(
		&self,
		queue: &str,
		run_id: &str,
		schedule: DateTime<Utc>,
		content: Option<EventRecord>,
	) -> WorkflowResult<()>;

	async fn read_schedule(
		&self,
		queue: &str,
		run_id: &str,
		schedule: DateTime<Utc>,
	) -> WorkflowResult<Option<EventRecord>>;

	async fn close_schedule(
		&self,
		queue: &str,
		run_id: &str,
		schedule: DateTime<Utc>,
	) -> WorkflowResult<()>;

	// agent related

	/// First due entry (`schedule <= now`) whose run is not excluded, in
	/// schedule-time order with ties broken by run id.
	async fn next_run(
		&self,
		queue: &str,
		excludes: &[String],
	) -> WorkflowResult<Option<(String, DateTime<Utc>)>>;

	async fn active_leases(&self, lease_seconds: u64) -> WorkflowResult<Vec<String>>;

	async fn acquire_lease(&self, run_id: &str, lease_seconds: u64) -> WorkflowResult<bool>;

	async fn renew_lease(&self, run_id: &str, lease_seconds: u64) -> WorkflowResult<bool>;

	async fn remove_lease(&self, run_id: &str, lease_seconds: u64) -> WorkflowResult<()>;

	// search related

	async fn read_workflow_links(&self, workflow_name: &str) -> WorkflowResult<Vec<String>>;

	async fn write_workflow_link(&self, workflow_name: &str, run_id: &str) -> WorkflowResult<()>;
}
