use std::{sync::Arc, time::Duration};

use substantial::event::{Compensation, Event, Save, Stop};
use substantial::prelude::*;

/// Conductor over a throwaway filesystem backend.
pub fn conductor() -> (Conductor, tempfile::TempDir) {
	init_tracing();

	let root = tempfile::tempdir().expect("create temp root");
	let backend: BackendHandle = Arc::new(FsBackend::new(root.path()).expect("create fs backend"));

	(Conductor::new(backend), root)
}

/// Agent parameters tightened for tests.
pub fn fast_agent() -> AgentConfig {
	AgentConfig {
		poll_interval: Duration::from_millis(250),
		..AgentConfig::default()
	}
}

pub async fn read_events(conductor: &Conductor, run_id: &str) -> Records {
	conductor
		.backend()
		.read_events(run_id)
		.await
		.expect("read events")
		.expect("events recorded")
}

pub fn saves(records: &Records) -> Vec<(u32, String, i32)> {
	records
		.events
		.iter()
		.filter_map(|record| match &record.event {
			Event::Save(Save { id, value, counter }) => Some((*id, value.clone(), *counter)),
			_ => None,
		})
		.collect()
}

pub fn compensations(records: &Records) -> Vec<(u32, String, String)> {
	records
		.events
		.iter()
		.filter_map(|record| match &record.event {
			Event::Compensation(Compensation {
				save_id,
				error,
				result,
			}) => Some((*save_id, error.clone(), result.clone())),
			_ => None,
		})
		.collect()
}

pub fn last_stop(records: &Records) -> Option<Stop> {
	records.events.iter().rev().find_map(|record| match &record.event {
		Event::Stop(stop) => Some(stop.clone()),
		_ => None,
	})
}

fn init_tracing() {
	use tracing_subscriber::EnvFilter;

	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.try_init();
}
