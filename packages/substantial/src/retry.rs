use std::time::Duration;

use crate::error::{WorkflowError, WorkflowResult};

/// Offset used to derive a missing backoff bound from the other one.
const BACKOFF_BOUND_OFFSET_SECS: i64 = 10;

/// Retry policy for a single `save` call site, with a linearly scaled backoff
/// between `initial_backoff_interval` and `max_backoff_interval` (seconds).
#[derive(Debug, Clone)]
pub struct RetryStrategy {
	pub(crate) max_retries: i32,
	pub(crate) initial_backoff_interval: i64,
	pub(crate) max_backoff_interval: i64,
	pub(crate) compensate_on_first_fail: bool,
}

impl RetryStrategy {
	/// Validates the invariants eagerly: `max_retries >= 1`, bounds ordered
	/// and non-negative. When only one bound is given, the other is derived
	/// at a fixed offset.
	pub fn new(
		max_retries: i32,
		initial_backoff_interval: Option<i64>,
		max_backoff_interval: Option<i64>,
	) -> WorkflowResult<Self> {
		if max_retries < 1 {
			return Err(WorkflowError::InvalidRetryStrategy(
				"max_retries < 1".to_string(),
			));
		}

		let (low, high) = match (initial_backoff_interval, max_backoff_interval) {
			(Some(low), Some(high)) => {
				if low >= high {
					return Err(WorkflowError::InvalidRetryStrategy(
						"initial_backoff_interval >= max_backoff_interval".to_string(),
					));
				}
				if low < 0 {
					return Err(WorkflowError::InvalidRetryStrategy(
						"initial_backoff_interval < 0".to_string(),
					));
				}
				(low, high)
			}
			(Some(low), None) => (low, low + BACKOFF_BOUND_OFFSET_SECS),
			(None, Some(high)) => ((high - BACKOFF_BOUND_OFFSET_SECS).max(0), high),
			(None, None) => (0, BACKOFF_BOUND_OFFSET_SECS),
		};

		Ok(RetryStrategy {
			max_retries,
			initial_backoff_interval: low,
			max_backoff_interval: high,
			compensate_on_first_fail: false,
		})
	}

	/// Run compensations on the first failure instead of retrying.
	pub fn compensate_on_first_fail(mut self, enabled: bool) -> Self {
		self.compensate_on_first_fail = enabled;
		self
	}

	/// Scaled backoff in whole seconds for the given remaining retry budget.
	pub(crate) fn linear(&self, retries_left: i32) -> WorkflowResult<Duration> {
		if retries_left <= 0 {
			return Err(WorkflowError::InvalidRetryStrategy(
				"retries_left <= 0".to_string(),
			));
		}

		let dt = self.max_backoff_interval - self.initial_backoff_interval;
		let secs = ((self.max_retries - retries_left) as i64 * dt) / self.max_retries as i64;

		Ok(Duration::from_secs(secs as u64))
	}
}

impl Default for RetryStrategy {
	fn default() -> Self {
		RetryStrategy {
			max_retries: 3,
			initial_backoff_interval: 0,
			max_backoff_interval: 10,
			compensate_on_first_fail: false,
		}
	}
}
