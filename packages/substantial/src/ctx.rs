use std::{
	future::{Future, IntoFuture},
	marker::PhantomData,
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc, Mutex, MutexGuard, PoisonError,
	},
	time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::{
	activity::{CompensateFn, Evaluation},
	error::WorkflowError,
	event::{Event, EventRecord, Sleep},
	retry::RetryStrategy,
	utils,
};

/// Per-replay object the workflow function uses to invoke primitives.
///
/// Ids for `save` and `sleep` call sites are allocated by a monotonic
/// per-replay counter, so a deterministic workflow assigns the same id to the
/// same call site on every replay.
// NOTE: Cloneable because of inner arcs
#[derive(Clone)]
pub struct Context {
	inner: Arc<ContextInner>,
}

struct ContextInner {
	run_id: String,
	events: Mutex<Vec<EventRecord>>,
	next_id: AtomicU32,
	compensations: Mutex<Vec<CompensateFn>>,
}

impl Context {
	pub(crate) fn new(run_id: String, events: Vec<EventRecord>) -> Self {
		Context {
			inner: Arc::new(ContextInner {
				run_id,
				events: Mutex::new(events),
				next_id: AtomicU32::new(0),
				compensations: Mutex::new(Vec::new()),
			}),
		}
	}

	pub fn run_id(&self) -> &str {
		&self.inner.run_id
	}

	/// Appends a new record to the in-memory event list. The list is written
	/// back to the backend at the end of the replay.
	pub(crate) fn source(&self, event: Event) {
		self.events_mut().push(EventRecord::new(event));
	}

	pub(crate) fn events_snapshot(&self) -> Vec<EventRecord> {
		self.events_mut().clone()
	}

	pub(crate) fn push_compensation(&self, compensate: CompensateFn) {
		self.compensations_mut().push(compensate);
	}

	pub(crate) fn take_compensations(&self) -> Vec<CompensateFn> {
		std::mem::take(&mut *self.compensations_mut())
	}

	fn next_id(&self) -> u32 {
		self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
	}

	fn events_mut(&self) -> MutexGuard<'_, Vec<EventRecord>> {
		self.inner
			.events
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	fn compensations_mut(&self) -> MutexGuard<'_, Vec<CompensateFn>> {
		self.inner
			.compensations
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}
}

impl Context {
	/// Creates a durable checkpoint builder for one computation.
	///
	/// On first execution the closure runs under the activity evaluator
	/// (timeout, retry, compensation); on later replays the recorded value is
	/// returned without invoking the closure again.
	pub fn save<F, T>(&self, f: F) -> SaveBuilder<F, T> {
		SaveBuilder {
			ctx: self.clone(),
			f,
			timeout: None,
			retry_strategy: None,
			compensate_with: None,
			_output: PhantomData,
		}
	}

	/// Durable suspension: records the deadline on first execution, then
	/// signals the engine to reschedule the run until the deadline passes.
	#[tracing::instrument(skip_all, fields(run_id = %self.inner.run_id))]
	pub async fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
		let sleep_id = self.next_id();
		let now = Utc::now();

		let recorded = {
			let events = self.events_mut();
			events
				.iter()
				.filter_map(|record| match &record.event {
					Event::Sleep(sleep) if sleep.id == sleep_id => Some(sleep.clone()),
					_ => None,
				})
				.collect::<Vec<_>>()
		};

		if recorded.is_empty() {
			self.source(Event::Sleep(Sleep {
				id: sleep_id,
				start: now,
				end: now + utils::to_delta(duration),
			}));

			return Err(WorkflowError::Delay(format!("sleep #{sleep_id} scheduled")).into());
		}

		if recorded.iter().any(|sleep| now >= sleep.end) {
			tracing::debug!(id = sleep_id, "sleep already elapsed");
			return Ok(());
		}

		Err(WorkflowError::Delay(format!("sleep #{sleep_id} still in progress")).into())
	}

	/// Invokes `cb` with the decoded payload of the first recorded `Send`
	/// with the given name. The `Send` record itself is authoritative; the
	/// callback is a replay-time view computation.
	pub fn handle<R>(
		&self,
		event_name: &str,
		cb: impl FnOnce(serde_json::Value) -> R,
	) -> anyhow::Result<Option<R>> {
		let payload = {
			let events = self.events_mut();
			events.iter().find_map(|record| match &record.event {
				Event::Send(send) if send.name == event_name => Some(send.value.clone()),
				_ => None,
			})
		};

		match payload {
			Some(raw) => {
				let value =
					serde_json::from_str(&raw).map_err(WorkflowError::DeserializeValue)?;
				Ok(Some(cb(value)))
			}
			None => Ok(None),
		}
	}

	/// Waits for an externally delivered signal and returns its payload.
	pub async fn receive<T: DeserializeOwned>(&self, event_name: &str) -> anyhow::Result<T> {
		let mut holder = None;
		self.handle(event_name, |payload| holder = Some(payload))?;

		match holder {
			Some(payload) => Ok(serde_json::from_value(payload)
				.map_err(WorkflowError::DeserializeValue)?),
			None => Err(WorkflowError::Interrupt(format!(
				"receive => no '{event_name}' event delivered yet"
			))
			.into()),
		}
	}

	/// Gates the replay on a condition: returns `true` when the predicate
	/// holds, otherwise signals the engine to retry later. Consumes and
	/// produces no durable events by itself.
	pub fn ensure(&self, predicate: impl FnOnce() -> bool) -> anyhow::Result<bool> {
		if predicate() {
			Ok(true)
		} else {
			Err(WorkflowError::Interrupt("ensure => condition is still false".to_string()).into())
		}
	}

	/// Terminates the run without recording a `Stop`. Return the produced
	/// error from the workflow function.
	pub fn cancel_run(&self) -> anyhow::Error {
		WorkflowError::Cancel.into()
	}

	/// Replay-stable wrappers around nondeterministic calls.
	pub fn utils(&self) -> Utils {
		Utils { ctx: self.clone() }
	}
}

/// Builder for a single `save` call site; configure it by chaining, then
/// await it directly.
pub struct SaveBuilder<F, T> {
	ctx: Context,
	f: F,
	timeout: Option<Duration>,
	retry_strategy: Option<RetryStrategy>,
	compensate_with: Option<CompensateFn>,
	_output: PhantomData<T>,
}

impl<F, T> SaveBuilder<F, T> {
	/// Upper bound on the awaited computation. Time spent invoking the
	/// closure itself is deducted so tight timeouts remain meaningful.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
		self.retry_strategy = Some(strategy);
		self
	}

	/// Registers a compensating action, run LIFO with the other recorded
	/// compensations if a later save fails terminally.
	pub fn compensate_with<C, CFut, R>(mut self, compensate: C) -> Self
	where
		C: FnOnce() -> CFut + Send + 'static,
		CFut: Future<Output = anyhow::Result<R>> + Send + 'static,
		R: Serialize,
	{
		self.compensate_with = Some(Box::new(
			move || -> BoxFuture<'static, anyhow::Result<serde_json::Value>> {
				Box::pin(async move {
					let result = compensate().await?;
					serde_json::to_value(result)
						.map_err(|err| WorkflowError::SerializeValue(err).into())
				})
			},
		));
		self
	}
}

impl<F, Fut, T> IntoFuture for SaveBuilder<F, T>
where
	F: FnOnce() -> Fut + Send + 'static,
	Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
	T: Serialize + DeserializeOwned + Send + 'static,
{
	type Output = anyhow::Result<T>;
	type IntoFuture = BoxFuture<'static, anyhow::Result<T>>;

	fn into_future(self) -> Self::IntoFuture {
		let SaveBuilder {
			ctx,
			f,
			timeout,
			retry_strategy,
			compensate_with,
			..
		} = self;

		Box::pin(async move {
			let save_id = ctx.next_id();

			// The effective record is the resolved one if present, else the
			// one with the highest counter.
			let mut resolved = None;
			let mut latest = None;
			{
				let events = ctx.events_mut();
				for record in events.iter() {
					if let Event::Save(save) = &record.event {
						if save.id != save_id {
							continue;
						}
						if save.counter == -1 {
							resolved = Some(save.clone());
							break;
						}
						latest = Some(save.clone());
					}
				}
			}

			if let Some(save) = resolved {
				tracing::debug!(id = save_id, "reusing saved value");

				// Completed saves still contribute their compensation, so a
				// later terminal failure unwinds the whole chain.
				if let Some(compensate) = compensate_with {
					ctx.push_compensation(compensate);
				}

				let value = serde_json::from_str(&save.value)
					.map_err(WorkflowError::DeserializeValue)?;
				return Ok(value);
			}

			let evaluation = Evaluation {
				timeout,
				retry_strategy,
				compensate_with,
			};

			evaluation
				.run(&ctx, save_id, latest.map(|save| save.counter), f)
				.await
		})
	}
}

/// Utilities whose results are recorded as saves, so every replay observes
/// the first run's values.
pub struct Utils {
	ctx: Context,
}

impl Utils {
	pub async fn now(&self) -> anyhow::Result<DateTime<Utc>> {
		self.ctx.save(|| async { Ok(Utc::now()) }).await
	}

	pub async fn random(&self, low: i64, high: i64) -> anyhow::Result<i64> {
		self.ctx
			.save(move || async move { Ok(rand::thread_rng().gen_range(low..=high)) })
			.await
	}

	pub async fn uuid4(&self) -> anyhow::Result<Uuid> {
		self.ctx.save(|| async { Ok(Uuid::new_v4()) }).await
	}
}
