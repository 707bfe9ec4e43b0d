use std::{future::Future, time::Duration};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::time::Instant;

use crate::{
	ctx::Context,
	error::{as_workflow_error, WorkflowError},
	event::{Compensation, Event, Save},
	retry::RetryStrategy,
};

/// Floor for the remaining timeout after deducting the time spent invoking
/// the closure.
const MIN_TIMEOUT: Duration = Duration::from_micros(100);

pub(crate) type CompensateFn =
	Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send>;

/// Evaluates a single user computation with timeout, retry, and compensation
/// semantics, recording the outcome as `Save` events on the context.
pub(crate) struct Evaluation {
	pub timeout: Option<Duration>,
	pub retry_strategy: Option<RetryStrategy>,
	pub compensate_with: Option<CompensateFn>,
}

impl Evaluation {
	#[tracing::instrument(skip_all, fields(run_id = %ctx.run_id(), save_id = save_id))]
	pub(crate) async fn run<F, Fut, T>(
		self,
		ctx: &Context,
		save_id: u32,
		prior_counter: Option<i32>,
		f: F,
	) -> anyhow::Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = anyhow::Result<T>>,
		T: Serialize,
	{
		let strategy = self.retry_strategy.unwrap_or_default();

		if let Some(compensate) = self.compensate_with {
			ctx.push_compensation(compensate);
		}

		let before = Instant::now();
		let fut = f();

		let res = match self.timeout {
			Some(limit) => {
				let remaining = limit.checked_sub(before.elapsed()).unwrap_or(MIN_TIMEOUT);

				match tokio::time::timeout(remaining, fut).await {
					Ok(res) => res,
					Err(_) => Err(WorkflowError::ActivityTimeout.into()),
				}
			}
			None => fut.await,
		};

		match res {
			Ok(value) => {
				let encoded =
					serde_json::to_string(&value).map_err(WorkflowError::SerializeValue)?;

				ctx.source(Event::Save(Save {
					id: save_id,
					value: encoded,
					counter: -1,
				}));

				tracing::debug!(id = save_id, "computed save");

				Ok(value)
			}
			Err(err) => {
				// Control-flow signals raised by nested primitives pass
				// through untouched; they are not activity failures.
				if as_workflow_error(&err)
					.map(WorkflowError::is_flow)
					.unwrap_or(false)
				{
					return Err(err);
				}

				if strategy.compensate_on_first_fail {
					trigger_compensations(ctx, save_id, &err).await?;
					return Err(WorkflowError::RetryFail(failure_message(&err)).into());
				}

				let attempt = prior_counter.unwrap_or(1);
				let retries_left = strategy.max_retries - attempt;

				if retries_left > 0 {
					ctx.source(Event::Save(Save {
						id: save_id,
						value: "null".to_string(),
						counter: attempt + 1,
					}));

					tracing::debug!(id = save_id, attempt, "save failed, within retry budget");

					Err(WorkflowError::Retry(strategy.linear(retries_left)?).into())
				} else {
					tracing::debug!(id = save_id, attempt, "save failed, retries exhausted");

					trigger_compensations(ctx, save_id, &err).await?;

					Err(WorkflowError::RetryFail(failure_message(&err)).into())
				}
			}
		}
	}
}

/// Runs the recorded compensations LIFO, appending a `Compensation` event for
/// each. A failing compensation skips the remaining ones.
async fn trigger_compensations(
	ctx: &Context,
	save_id: u32,
	original: &anyhow::Error,
) -> anyhow::Result<()> {
	let stack = ctx.take_compensations();

	for compensate in stack.into_iter().rev() {
		match compensate().await {
			Ok(result) => {
				let encoded =
					serde_json::to_string(&result).map_err(WorkflowError::SerializeValue)?;

				ctx.source(Event::Compensation(Compensation {
					save_id,
					error: original.to_string(),
					result: encoded,
				}));
			}
			Err(compensation_error) => {
				return Err(WorkflowError::CompensationFailed {
					original: original.to_string(),
					compensation: compensation_error.to_string(),
				}
				.into());
			}
		}
	}

	Ok(())
}

fn failure_message(err: &anyhow::Error) -> String {
	match as_workflow_error(err) {
		Some(inner @ WorkflowError::ActivityTimeout) => format!("TimeoutError: {inner}"),
		_ => format!("Exception: {}", err.root_cause()),
	}
}
