use std::time::Duration;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Thrown by the context primitives to eject from the workflow scope back into
/// the engine.
///
/// The control-flow variants (`Interrupt`, `Delay`, `Retry`, `RetryFail`,
/// `Cancel`) are not errors in the usual sense; `Run::replay` interprets them
/// exactly once per invocation and they never propagate above it.
#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
	#[error("interrupted: {0}")]
	Interrupt(String),

	#[error("sleep in progress: {0}")]
	Delay(String),

	#[error("save failed, retrying in {0:?}")]
	Retry(Duration),

	#[error("save failed, retries exhausted: {0}")]
	RetryFail(String),

	#[error("workflow cancelled")]
	Cancel,

	#[error("activity evaluation timed out")]
	ActivityTimeout,

	#[error("compensation failed while handling `{original}`: {compensation}")]
	CompensationFailed {
		original: String,
		compensation: String,
	},

	#[error("invalid retry strategy: {0}")]
	InvalidRetryStrategy(String),

	#[error("duplicate registered workflow: {0}")]
	DuplicateRegisteredWorkflow(String),

	#[error("workflow missing from registry: {0}")]
	WorkflowMissingFromRegistry(String),

	#[error("malformed run id: {0}")]
	MalformedRunId(String),

	#[error("corrupt event log for {run_id}: {reason}")]
	CorruptEventLog { run_id: String, reason: String },

	#[error("events not found: {0}")]
	EventsNotFound(String),

	#[error("schedule not found: {0}")]
	ScheduleNotFound(String),

	#[error("lease not found: {0}")]
	LeaseNotFound(String),

	#[error("lease integrity failure: {0}")]
	LeaseIntegrity(String),

	#[error("invalid backend key: {0}")]
	InvalidKey(String),

	#[error("invalid timestamp: {0}")]
	InvalidTimestamp(String),

	#[error("invalid filter query: {0}")]
	InvalidFilterQuery(String),

	#[error("serialize value: {0}")]
	SerializeValue(serde_json::Error),

	#[error("deserialize value: {0}")]
	DeserializeValue(serde_json::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("redis error: {0}")]
	Redis(#[from] redis::RedisError),
}

impl WorkflowError {
	/// Whether this is a replay control-flow signal rather than a real error.
	pub(crate) fn is_flow(&self) -> bool {
		matches!(
			self,
			WorkflowError::Interrupt(_)
				| WorkflowError::Delay(_)
				| WorkflowError::Retry(_)
				| WorkflowError::RetryFail(_)
				| WorkflowError::Cancel
		)
	}
}

/// Finds the innermost `WorkflowError` in an `anyhow` chain, if any.
pub(crate) fn as_workflow_error(err: &anyhow::Error) -> Option<&WorkflowError> {
	err.chain().find_map(|e| e.downcast_ref::<WorkflowError>())
}
