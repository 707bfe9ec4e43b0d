use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{backend::BackendHandle, registry::RegistryHandle, run::Run};

/// Lease-based worker loop parameters.
#[derive(Debug, Clone)]
pub struct AgentConfig {
	/// How long an acquired lease is valid without renewal.
	pub lease_seconds: u64,
	/// How often the heartbeat renews the lease while a replay is running.
	pub renew_seconds: u64,
	/// How long to wait between schedule polls.
	pub poll_interval: Duration,
}

impl Default for AgentConfig {
	fn default() -> Self {
		AgentConfig {
			lease_seconds: 10,
			renew_seconds: 8,
			poll_interval: Duration::from_secs(1),
		}
	}
}

/// Polls the schedule queue for due runs and replays them under an exclusive
/// lease. Multiple agents across processes coordinate purely through the
/// backend's lease registry.
pub struct Agent {
	backend: BackendHandle,
	registry: RegistryHandle,
	queue: String,
	config: AgentConfig,
}

impl Agent {
	pub fn new(
		backend: BackendHandle,
		registry: RegistryHandle,
		queue: impl Into<String>,
		config: AgentConfig,
	) -> Self {
		Agent {
			backend,
			registry,
			queue: queue.into(),
			config,
		}
	}

	/// Runs the polling loop until the token is cancelled. Backend errors are
	/// logged and the loop continues.
	#[tracing::instrument(skip_all, fields(queue = %self.queue))]
	pub async fn start(self, stop: CancellationToken) {
		tracing::debug!(
			registered_workflows = self.registry.size(),
			"started agent"
		);

		loop {
			// Finish the in-flight tick before honoring a stop, so a leased
			// replay is never abandoned mid-persist
			if stop.is_cancelled() {
				break;
			}

			if let Err(err) = self.tick().await {
				tracing::error!(?err, "agent tick failed");
			}

			tokio::select! {
				_ = stop.cancelled() => break,
				_ = tokio::time::sleep(self.config.poll_interval) => {}
			}
		}

		tracing::debug!("agent stopped");
	}

	/// One poll: pick the next due run not covered by an active lease,
	/// acquire its lease, then race the replay against the heartbeat.
	async fn tick(&self) -> anyhow::Result<()> {
		let active = self
			.backend
			.active_leases(self.config.lease_seconds)
			.await?;

		let Some((run_id, schedule)) = self.backend.next_run(&self.queue, &active).await? else {
			return Ok(());
		};

		if !self
			.backend
			.acquire_lease(&run_id, self.config.lease_seconds)
			.await?
		{
			tracing::debug!(%run_id, "lost the lease race");
			return Ok(());
		}

		let mut heartbeat = tokio::spawn(Self::heartbeat(
			self.backend.clone(),
			run_id.clone(),
			self.config.clone(),
		));

		let run = Run::new(
			run_id.clone(),
			self.queue.clone(),
			self.backend.clone(),
			self.registry.clone(),
		);
		let mut process = tokio::spawn(async move { run.replay(schedule).await });

		tokio::select! {
			_ = &mut heartbeat => {
				// Renewal failed; another worker will pick the run up again
				tracing::warn!(%run_id, "lease renewal lost, cancelling replay");
				process.abort();
				let _ = process.await;
			}
			res = &mut process => {
				heartbeat.abort();
				let _ = heartbeat.await;

				match res {
					Ok(Ok(())) => tracing::debug!(%run_id, "replay complete"),
					Ok(Err(err)) => tracing::error!(?err, %run_id, "replay failed"),
					Err(err) => tracing::error!(?err, %run_id, "replay task panicked"),
				}
			}
		}

		self.backend
			.remove_lease(&run_id, self.config.lease_seconds)
			.await?;

		Ok(())
	}

	/// Renews the lease on a fixed cadence; returns when renewal is lost.
	async fn heartbeat(backend: BackendHandle, run_id: String, config: AgentConfig) {
		loop {
			tokio::time::sleep(Duration::from_secs(config.renew_seconds)).await;

			match backend.renew_lease(&run_id, config.lease_seconds).await {
				Ok(true) => {}
				Ok(false) => {
					tracing::warn!(%run_id, "lease renewal refused");
					return;
				}
				Err(err) => {
					tracing::warn!(?err, %run_id, "lease renewal failed");
					return;
				}
			}
		}
	}
}
