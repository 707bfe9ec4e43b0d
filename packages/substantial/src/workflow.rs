use std::{future::Future, sync::Arc};

use futures_util::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

use crate::{
	ctx::Context,
	error::{WorkflowError, WorkflowResult},
};

type WorkflowFn = Arc<
	dyn Fn(
			Context,
			serde_json::Map<String, serde_json::Value>,
		) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
		+ Send
		+ Sync,
>;

/// A registered workflow function with a stable id. Runs are identified as
/// `{name}-{uuid4}`.
#[derive(Clone)]
pub struct Workflow {
	name: String,
	f: WorkflowFn,
	restore_using: Option<String>,
}

impl Workflow {
	pub fn new<F, Fut, T>(name: impl Into<String>, f: F) -> Self
	where
		F: Fn(Context, serde_json::Map<String, serde_json::Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
		T: Serialize,
	{
		let f: WorkflowFn = Arc::new(
			move |ctx, kwargs| -> BoxFuture<'static, anyhow::Result<serde_json::Value>> {
				let fut = f(ctx, kwargs);
				Box::pin(async move {
					let output = fut.await?;
					serde_json::to_value(output)
						.map_err(|err| WorkflowError::SerializeValue(err).into())
				})
			},
		);

		Workflow {
			name: name.into(),
			f,
			restore_using: None,
		}
	}

	/// Bootstraps every new run of this workflow from another run's event
	/// log; saves then replay from the seeded history.
	pub fn restore_using(mut self, source_run_id: impl Into<String>) -> Self {
		self.restore_using = Some(source_run_id.into());
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub(crate) fn restore_source(&self) -> Option<&str> {
		self.restore_using.as_deref()
	}

	pub(crate) fn call(
		&self,
		ctx: Context,
		kwargs: serde_json::Map<String, serde_json::Value>,
	) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> {
		(self.f)(ctx, kwargs)
	}
}

/// Strips the trailing `-{uuid4}` from a run id to recover the workflow name.
pub(crate) fn workflow_name_of_run(run_id: &str) -> WorkflowResult<&str> {
	// uuid4 in its hyphenated form is 36 chars
	let malformed = || WorkflowError::MalformedRunId(run_id.to_string());

	if run_id.len() < 38 {
		return Err(malformed());
	}

	let (name, tail) = run_id.split_at(run_id.len() - 37);
	if !tail.starts_with('-') || Uuid::parse_str(&tail[1..]).is_err() || name.is_empty() {
		return Err(malformed());
	}

	Ok(name)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_the_workflow_name_from_a_run_id() {
		let run_id = format!("invoicing-{}", Uuid::new_v4());
		assert_eq!(workflow_name_of_run(&run_id).unwrap(), "invoicing");

		// workflow names may themselves contain hyphens
		let run_id = format!("send-email-{}", Uuid::new_v4());
		assert_eq!(workflow_name_of_run(&run_id).unwrap(), "send-email");
	}

	#[test]
	fn rejects_malformed_run_ids() {
		assert!(workflow_name_of_run("short").is_err());
		assert!(workflow_name_of_run("name-not-a-uuid-aaaaaaaaaaaaaaaaaaaaaaaaa").is_err());
		assert!(workflow_name_of_run(&format!("-{}", Uuid::new_v4())).is_err());
	}
}
