use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
	agent::{Agent, AgentConfig},
	backend::BackendHandle,
	filter::WorkflowFilter,
	registry::{Registry, RegistryHandle},
	run::Run,
	workflow::Workflow,
};

pub const DEFAULT_QUEUE: &str = "default";

/// Facade tying the registry, the backend, and the agent together.
pub struct Conductor {
	backend: BackendHandle,
	registry: RegistryHandle,
}

impl Conductor {
	pub fn new(backend: BackendHandle) -> Self {
		Conductor {
			backend,
			registry: Arc::new(Registry::default()),
		}
	}

	pub fn register(&self, workflow: Workflow) -> anyhow::Result<()> {
		self.registry.register(workflow)?;
		Ok(())
	}

	/// Starts a run of a registered workflow on the default queue and returns
	/// its handle.
	pub async fn start(
		&self,
		workflow: &Workflow,
		kwargs: serde_json::Map<String, serde_json::Value>,
	) -> anyhow::Result<Run> {
		self.start_on(workflow, kwargs, DEFAULT_QUEUE).await
	}

	#[tracing::instrument(skip_all, fields(workflow = %workflow.name(), queue = %queue))]
	pub async fn start_on(
		&self,
		workflow: &Workflow,
		kwargs: serde_json::Map<String, serde_json::Value>,
		queue: &str,
	) -> anyhow::Result<Run> {
		let run_id = format!("{}-{}", workflow.name(), Uuid::new_v4());
		tracing::debug!(%run_id, "starting run");

		let run = Run::new(
			run_id,
			queue.to_string(),
			self.backend.clone(),
			self.registry.clone(),
		);
		run.start(kwargs).await?;

		Ok(run)
	}

	/// Spawns a background agent over the given queue.
	pub fn run(&self, queue: &str) -> AgentHandle {
		self.run_with(queue, AgentConfig::default())
	}

	pub fn run_with(&self, queue: &str, config: AgentConfig) -> AgentHandle {
		let agent = Agent::new(self.backend.clone(), self.registry.clone(), queue, config);

		let stop = CancellationToken::new();
		let task = tokio::spawn(agent.start(stop.clone()));

		AgentHandle { task, stop }
	}

	/// Read-only search over completed runs.
	pub fn filter(&self) -> WorkflowFilter {
		WorkflowFilter::new(self.backend.clone())
	}

	pub fn backend(&self) -> &BackendHandle {
		&self.backend
	}
}

/// Handle to a background agent; cancelling stops the loop between polls.
pub struct AgentHandle {
	task: JoinHandle<()>,
	stop: CancellationToken,
}

impl AgentHandle {
	pub async fn stop(self) {
		self.stop.cancel();

		if let Err(err) = self.task.await {
			tracing::error!(?err, "agent task panicked");
		}
	}

	/// Kills the agent without waiting for the current poll to finish.
	pub fn abort(&self) {
		self.task.abort();
	}
}
