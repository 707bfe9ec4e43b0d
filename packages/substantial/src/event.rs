use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};

/// One durable record in a run's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
	pub at: DateTime<Utc>,
	#[serde(flatten)]
	pub event: Event,
}

impl EventRecord {
	pub fn new(event: Event) -> Self {
		EventRecord {
			at: Utc::now(),
			event,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
	Start(Start),
	Save(Save),
	Sleep(Sleep),
	Send(Send),
	Stop(Stop),
	Compensation(Compensation),
}

/// First record of a run lifecycle, carries the initial arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Start {
	pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// Durable checkpoint for one `save` call site. `counter == -1` means
/// resolved; `counter >= 1` means the counter-th attempt failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Save {
	pub id: u32,
	pub value: String,
	pub counter: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sleep {
	pub id: u32,
	pub start: DateTime<Utc>,
	pub end: DateTime<Utc>,
}

/// An externally delivered signal. `value` is the JSON-encoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Send {
	pub name: String,
	pub value: String,
}

/// Terminal record, at most one per run lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stop {
	Ok(String),
	Err(String),
}

/// Record of a compensating action triggered by a terminal save failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compensation {
	pub save_id: u32,
	pub error: String,
	pub result: String,
}

/// The durable unit the backends store per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Records {
	pub run_id: String,
	pub events: Vec<EventRecord>,
}

/// Walks the `Start`/`Stop` life counter over a run's event log and asserts
/// the `(Start . * . Stop)*` shape. The counter must never leave `{0, 1}`.
///
/// Returns whether the run has stopped, i.e. every started lifecycle has a
/// matching `Stop`.
pub fn has_stopped(run_id: &str, events: &[EventRecord]) -> WorkflowResult<bool> {
	let mut lives = 0i32;
	let mut started = false;

	for record in events {
		match &record.event {
			Event::Start(_) => {
				if lives == 1 {
					return Err(WorkflowError::CorruptEventLog {
						run_id: run_id.to_string(),
						reason: "start record while a lifecycle is already open".to_string(),
					});
				}
				lives += 1;
				started = true;
			}
			Event::Stop(_) => {
				if lives == 0 {
					return Err(WorkflowError::CorruptEventLog {
						run_id: run_id.to_string(),
						reason: "stop record without an open lifecycle".to_string(),
					});
				}
				lives -= 1;
			}
			_ => {}
		}
	}

	Ok(started && lives == 0)
}

/// Initial arguments of the latest lifecycle.
pub(crate) fn start_kwargs(
	events: &[EventRecord],
) -> Option<&serde_json::Map<String, serde_json::Value>> {
	events.iter().rev().find_map(|record| match &record.event {
		Event::Start(start) => Some(&start.kwargs),
		_ => None,
	})
}

/// Terminal outcome of the latest lifecycle.
pub(crate) fn last_stop(events: &[EventRecord]) -> Option<&Stop> {
	events.iter().rev().find_map(|record| match &record.event {
		Event::Stop(stop) => Some(stop),
		_ => None,
	})
}

/// Per-replay human readable log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
	pub at: DateTime<Utc>,
	#[serde(flatten)]
	pub data: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metadata {
	Info(String),
	Error(MetadataError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataError {
	pub message: String,
	pub stacktrace: String,
	pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecords {
	pub run_id: String,
	pub metadata: Vec<MetadataRecord>,
}
