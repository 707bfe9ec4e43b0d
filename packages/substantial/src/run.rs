use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
	backend::BackendHandle,
	ctx::Context,
	error::{as_workflow_error, WorkflowError},
	event::{
		self, Event, EventRecord, Metadata, MetadataError, MetadataRecord, MetadataRecords,
		Records, Send, Start, Stop,
	},
	registry::RegistryHandle,
	utils::to_delta,
};

/// Short horizon used to reschedule replays that are expected to make
/// progress immediately (terminal stops, pending sleeps).
const REPLAY_TICK: Duration = Duration::from_millis(500);
/// Backoff before re-evaluating an interrupted condition.
const INTERRUPT_BACKOFF: Duration = Duration::from_secs(10);
/// How often `result` polls the event log for a terminal record.
const RESULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to one workflow invocation. A `Run` is constructed anew for each
/// replay attempt; the durable state lives entirely in the backend.
#[derive(Clone)]
pub struct Run {
	run_id: String,
	queue: String,
	backend: BackendHandle,
	registry: RegistryHandle,
}

impl Run {
	pub(crate) fn new(
		run_id: String,
		queue: String,
		backend: BackendHandle,
		registry: RegistryHandle,
	) -> Self {
		Run {
			run_id,
			queue,
			backend,
			registry,
		}
	}

	pub fn run_id(&self) -> &str {
		&self.run_id
	}

	/// Records the workflow link and queues the initial `Start` replay.
	#[tracing::instrument(skip_all, fields(run_id = %self.run_id))]
	pub(crate) async fn start(
		&self,
		kwargs: serde_json::Map<String, serde_json::Value>,
	) -> anyhow::Result<()> {
		let workflow = self.registry.resolve_run(&self.run_id)?;

		// Seed the log from another run before the fresh lifecycle begins
		if let Some(source_run_id) = workflow.restore_source() {
			let source = self
				.backend
				.read_events(source_run_id)
				.await?
				.ok_or_else(|| WorkflowError::EventsNotFound(source_run_id.to_string()))?;

			if !event::has_stopped(source_run_id, &source.events)? {
				return Err(WorkflowError::CorruptEventLog {
					run_id: source_run_id.to_string(),
					reason: "restore source still has an open lifecycle".to_string(),
				}
				.into());
			}

			tracing::debug!(source = %source_run_id, "seeding run from restore source");

			self.backend
				.write_events(
					&self.run_id,
					Records {
						run_id: self.run_id.clone(),
						events: source.events,
					},
				)
				.await?;
		}

		self.backend
			.write_workflow_link(workflow.name(), &self.run_id)
			.await?;

		let now = Utc::now();
		self.backend
			.add_schedule(
				&self.queue,
				&self.run_id,
				now,
				Some(EventRecord {
					at: now,
					event: Event::Start(Start { kwargs }),
				}),
			)
			.await?;

		Ok(())
	}

	/// Delivers an external signal to the run. Stopped runs still record the
	/// schedule entry, but replays never fold it into the event stream.
	#[tracing::instrument(skip_all, fields(run_id = %self.run_id, name = %name))]
	pub async fn send(&self, name: &str, value: impl Serialize) -> anyhow::Result<()> {
		let encoded = serde_json::to_string(&value).map_err(WorkflowError::SerializeValue)?;

		let now = Utc::now();
		self.backend
			.add_schedule(
				&self.queue,
				&self.run_id,
				now,
				Some(EventRecord {
					at: now,
					event: Event::Send(Send {
						name: name.to_string(),
						value: encoded,
					}),
				}),
			)
			.await?;

		Ok(())
	}

	/// Polls the event log until a terminal record lands, then decodes it.
	#[tracing::instrument(skip_all, fields(run_id = %self.run_id))]
	pub async fn result<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
		loop {
			if let Some(records) = self.backend.read_events(&self.run_id).await? {
				if event::has_stopped(&self.run_id, &records.events)? {
					if let Some(stop) = event::last_stop(&records.events) {
						match stop {
							Stop::Ok(raw) => {
								return Ok(serde_json::from_str(raw)
									.map_err(WorkflowError::DeserializeValue)?);
							}
							Stop::Err(raw) => {
								let message: serde_json::Value = serde_json::from_str(raw)
									.map_err(WorkflowError::DeserializeValue)?;
								let message = match message {
									serde_json::Value::String(s) => s,
									other => other.to_string(),
								};

								return Err(anyhow::anyhow!(message));
							}
						}
					}
				}
			}

			tokio::time::sleep(RESULT_POLL_INTERVAL).await;
		}
	}

	/// Replays the workflow function over the recorded events, folds in the
	/// triggering schedule payload, classifies the outcome, persists, and
	/// closes the schedule slot.
	#[tracing::instrument(skip_all, fields(run_id = %self.run_id, schedule = %schedule))]
	pub(crate) async fn replay(&self, schedule: DateTime<Utc>) -> anyhow::Result<()> {
		let start_at = Utc::now();
		tracing::debug!("replaying run");

		let mut events = self
			.backend
			.read_events(&self.run_id)
			.await?
			.map(|records| records.events)
			.unwrap_or_default();

		let was_stopped = event::has_stopped(&self.run_id, &events)?;

		let payload = self
			.backend
			.read_schedule(&self.queue, &self.run_id, schedule)
			.await?;

		let mut slot_closed = false;
		match payload {
			Some(record) if !was_stopped => events.push(record),
			Some(_) => tracing::debug!("run already stopped, ignoring schedule payload"),
			None => {
				self.backend
					.close_schedule(&self.queue, &self.run_id, schedule)
					.await?;
				slot_closed = true;
			}
		}

		// A folded terminal payload stops the run before invocation
		let stopped = event::has_stopped(&self.run_id, &events)?;

		let ctx = Context::new(self.run_id.clone(), events);
		let mut metadata = vec![MetadataRecord {
			at: start_at,
			data: Metadata::Info("replay".to_string()),
		}];

		let mut replay_err = None;
		if stopped {
			tracing::debug!("run stopped, skipping invocation");
		} else {
			let outcome = self.invoke(&ctx).await;
			if let Err(err) = self.classify(schedule, outcome, &mut metadata).await {
				replay_err = Some(err);
			}
		}

		// Persist in every path so no recorded progress is lost
		self.backend
			.write_events(
				&self.run_id,
				Records {
					run_id: self.run_id.clone(),
					events: ctx.events_snapshot(),
				},
			)
			.await?;

		let content = serde_json::to_string_pretty(&MetadataRecords {
			run_id: self.run_id.clone(),
			metadata,
		})
		.map_err(WorkflowError::SerializeValue)?;
		self.backend
			.append_metadata(&self.run_id, schedule, &content)
			.await?;

		if !slot_closed {
			self.backend
				.close_schedule(&self.queue, &self.run_id, schedule)
				.await?;
		}

		match replay_err {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	/// Resolves the workflow and runs it against the replay context.
	async fn invoke(&self, ctx: &Context) -> anyhow::Result<serde_json::Value> {
		let workflow = self.registry.resolve_run(&self.run_id)?;

		let kwargs = {
			let events = ctx.events_snapshot();
			event::start_kwargs(&events)
				.cloned()
				.ok_or_else(|| WorkflowError::CorruptEventLog {
					run_id: self.run_id.clone(),
					reason: "no start record for an unstopped run".to_string(),
				})?
		};

		workflow.call(ctx.clone(), kwargs).await
	}

	/// Interprets the outcome of one invocation: terminal stops are queued as
	/// schedule payloads, control-flow signals reschedule a bare replay, and
	/// anything else is recorded as a transient error.
	async fn classify(
		&self,
		schedule: DateTime<Utc>,
		outcome: anyhow::Result<serde_json::Value>,
		metadata: &mut Vec<MetadataRecord>,
	) -> anyhow::Result<()> {
		match outcome {
			Ok(value) => {
				tracing::debug!("workflow completed");

				let encoded =
					serde_json::to_string(&value).map_err(WorkflowError::SerializeValue)?;
				self.schedule_stop(schedule, Stop::Ok(encoded)).await?;
			}
			Err(err) => match as_workflow_error(&err) {
				Some(WorkflowError::Interrupt(hint)) => {
					tracing::debug!(%hint, "workflow interrupted");
					self.schedule_bare(schedule + to_delta(INTERRUPT_BACKOFF))
						.await?;
				}
				Some(WorkflowError::Delay(hint)) => {
					tracing::debug!(%hint, "workflow sleeping");
					self.schedule_bare(schedule + to_delta(REPLAY_TICK)).await?;
				}
				Some(WorkflowError::Retry(delta)) => {
					tracing::debug!(?delta, "workflow retrying");
					self.schedule_bare(schedule + to_delta(*delta)).await?;
				}
				Some(WorkflowError::RetryFail(message)) => {
					tracing::debug!(%message, "workflow failed, retries exhausted");

					let encoded = serde_json::to_string(message)
						.map_err(WorkflowError::SerializeValue)?;
					self.schedule_stop(schedule, Stop::Err(encoded)).await?;
				}
				Some(WorkflowError::Cancel) => {
					tracing::info!("workflow cancelled");
				}
				_ => {
					tracing::error!(?err, "workflow error");

					metadata.push(MetadataRecord {
						at: Utc::now(),
						data: Metadata::Error(MetadataError {
							message: format!("error: {err}"),
							stacktrace: format!("{err:?}"),
							kind: "exception".to_string(),
						}),
					});
					self.schedule_bare(schedule + to_delta(REPLAY_TICK)).await?;

					return Err(err);
				}
			},
		}

		Ok(())
	}

	async fn schedule_bare(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
		self.backend
			.add_schedule(&self.queue, &self.run_id, at, None)
			.await?;

		Ok(())
	}

	async fn schedule_stop(&self, schedule: DateTime<Utc>, stop: Stop) -> anyhow::Result<()> {
		let at = schedule + to_delta(REPLAY_TICK);
		self.backend
			.add_schedule(
				&self.queue,
				&self.run_id,
				at,
				Some(EventRecord {
					at,
					event: Event::Stop(stop),
				}),
			)
			.await?;

		Ok(())
	}
}
