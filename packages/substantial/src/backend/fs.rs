use std::{
	collections::HashSet,
	io::ErrorKind,
	path::{Path, PathBuf},
	time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
	backend::Backend,
	error::{WorkflowError, WorkflowResult},
	event::{EventRecord, Records},
	utils::{format_ts, parse_ts},
};

/// Filesystem backend, for testing purposes only.
///
/// `readdir` has no defined order, so schedule entries are loaded and sorted
/// by their ISO-8601 directory names, which are monotonic for absolute UTC.
pub struct FsBackend {
	root: PathBuf,
}

impl FsBackend {
	pub fn new(root: impl Into<PathBuf>) -> WorkflowResult<Self> {
		let root = root.into();

		for dir in ["runs", "schedules", "leases"] {
			std::fs::create_dir_all(root.join(dir))?;
		}

		Ok(FsBackend { root })
	}

	fn events_path(&self, run_id: &str) -> PathBuf {
		self.root.join("runs").join(run_id).join("events")
	}

	fn logs_dir(&self, run_id: &str) -> PathBuf {
		self.root.join("runs").join(run_id).join("logs")
	}

	fn queue_dir(&self, queue: &str) -> PathBuf {
		self.root.join("schedules").join(queue)
	}

	fn schedule_path(&self, queue: &str, run_id: &str, schedule: &DateTime<Utc>) -> PathBuf {
		self.queue_dir(queue).join(format_ts(schedule)).join(run_id)
	}

	fn lease_path(&self, run_id: &str) -> PathBuf {
		self.root.join("leases").join(run_id)
	}

	/// Rename-based compare-and-swap on the lease file: write a witness file
	/// with a fresh nonce, rename it onto the target, then verify the target
	/// carries our nonce. A held and unexpired lease short-circuits when
	/// `check_held` is set.
	async fn lease_cas(
		&self,
		run_id: &str,
		op: &str,
		lease_seconds: u64,
		check_held: bool,
	) -> WorkflowResult<bool> {
		let target = self.lease_path(run_id);

		if check_held && lease_is_held(&target, lease_seconds).await? {
			return Ok(false);
		}

		let nonce = Uuid::new_v4().to_string();
		let witness = self.root.join("leases").join(format!("{run_id}.{op}"));
		tokio::fs::write(&witness, &nonce).await?;

		if let Err(err) = tokio::fs::rename(&witness, &target).await {
			if err.kind() == ErrorKind::NotFound {
				// a competing witness already moved
				return Ok(false);
			}
			return Err(err.into());
		}

		match tokio::fs::read_to_string(&target).await {
			Ok(content) => Ok(content == nonce),
			Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
			Err(err) => Err(err.into()),
		}
	}

	/// Closes earlier bare-replay entries for `run_id`; a payload-carrying
	/// entry supersedes pending retry requests.
	async fn fuse_bare_schedules(
		&self,
		queue: &str,
		run_id: &str,
		before: &DateTime<Utc>,
	) -> WorkflowResult<()> {
		for name in dir_names(&self.queue_dir(queue)).await? {
			let ts = parse_ts(&name)?;
			if ts >= *before {
				continue;
			}

			let path = self.queue_dir(queue).join(&name).join(run_id);
			match tokio::fs::read_to_string(&path).await {
				Ok(content) if content.is_empty() => {
					tracing::debug!(%run_id, schedule = %name, "fusing bare replay");
					remove_schedule_file(&path).await?;
				}
				Ok(_) => {}
				Err(err) if err.kind() == ErrorKind::NotFound => {}
				Err(err) => return Err(err.into()),
			}
		}

		Ok(())
	}
}

#[async_trait]
impl Backend for FsBackend {
	async fn read_events(&self, run_id: &str) -> WorkflowResult<Option<Records>> {
		let path = self.events_path(run_id);

		let raw = match tokio::fs::read(&path).await {
			Ok(raw) => raw,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};

		let events = serde_json::from_slice::<Vec<EventRecord>>(&raw)
			.map_err(WorkflowError::DeserializeValue)?;

		Ok(Some(Records {
			run_id: run_id.to_string(),
			events,
		}))
	}

	async fn write_events(&self, run_id: &str, records: Records) -> WorkflowResult<()> {
		let path = self.events_path(run_id);
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		let raw =
			serde_json::to_vec_pretty(&records.events).map_err(WorkflowError::SerializeValue)?;
		write_atomically(&path, &raw).await?;

		Ok(())
	}

	async fn read_all_metadata(&self, run_id: &str) -> WorkflowResult<Vec<String>> {
		let dir = self.logs_dir(run_id);
		let mut contents = Vec::new();

		for name in dir_names(&dir).await? {
			contents.push(tokio::fs::read_to_string(dir.join(name)).await?);
		}

		Ok(contents)
	}

	async fn append_metadata(
		&self,
		run_id: &str,
		schedule: DateTime<Utc>,
		content: &str,
	) -> WorkflowResult<()> {
		let dir = self.logs_dir(run_id);
		tokio::fs::create_dir_all(&dir).await?;
		write_atomically(&dir.join(format_ts(&schedule)), content.as_bytes()).await?;

		Ok(())
	}

	async fn add_schedule(
		&self,
		queue: &str,
		run_id: &str,
		schedule: DateTime<Utc>,
		content: Option<EventRecord>,
	) -> WorkflowResult<()> {
		if content.is_some() {
			self.fuse_bare_schedules(queue, run_id, &schedule).await?;
		}

		let path = self.schedule_path(queue, run_id, &schedule);
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		let raw = match &content {
			Some(record) => serde_json::to_string(record).map_err(WorkflowError::SerializeValue)?,
			None => String::new(),
		};
		write_atomically(&path, raw.as_bytes()).await?;

		Ok(())
	}

	async fn read_schedule(
		&self,
		queue: &str,
		run_id: &str,
		schedule: DateTime<Utc>,
	) -> WorkflowResult<Option<EventRecord>> {
		let path = self.schedule_path(queue, run_id, &schedule);

		let raw = match tokio::fs::read_to_string(&path).await {
			Ok(raw) => raw,
			Err(err) if err.kind() == ErrorKind::NotFound => {
				return Err(WorkflowError::ScheduleNotFound(path.display().to_string()));
			}
			Err(err) => return Err(err.into()),
		};

		if raw.is_empty() {
			return Ok(None);
		}

		Ok(Some(
			serde_json::from_str(&raw).map_err(WorkflowError::DeserializeValue)?,
		))
	}

	async fn close_schedule(
		&self,
		queue: &str,
		run_id: &str,
		schedule: DateTime<Utc>,
	) -> WorkflowResult<()> {
		let path = self.schedule_path(queue, run_id, &schedule);

		if !path.exists() {
			return Err(WorkflowError::ScheduleNotFound(path.display().to_string()));
		}

		remove_schedule_file(&path).await
	}

	async fn next_run(
		&self,
		queue: &str,
		excludes: &[String],
	) -> WorkflowResult<Option<(String, DateTime<Utc>)>> {
		let dir = self.queue_dir(queue);
		let excluded = excludes.iter().collect::<HashSet<_>>();
		let now = Utc::now();

		for name in dir_names(&dir).await? {
			let ts = parse_ts(&name)?;
			if ts > now {
				// sorted ascending, nothing further is due
				break;
			}

			for run_id in dir_names(&dir.join(&name)).await? {
				if !excluded.contains(&run_id) {
					return Ok(Some((run_id, ts)));
				}
			}
		}

		Ok(None)
	}

	async fn active_leases(&self, lease_seconds: u64) -> WorkflowResult<Vec<String>> {
		let dir = self.root.join("leases");
		let mut held = Vec::new();

		for name in dir_names(&dir).await? {
			if lease_is_held(&dir.join(&name), lease_seconds).await? {
				held.push(name);
			}
		}

		Ok(held)
	}

	async fn acquire_lease(&self, run_id: &str, lease_seconds: u64) -> WorkflowResult<bool> {
		self.lease_cas(run_id, "acquire", lease_seconds, true).await
	}

	async fn renew_lease(&self, run_id: &str, lease_seconds: u64) -> WorkflowResult<bool> {
		let target = self.lease_path(run_id);
		if !target.exists() {
			return Err(WorkflowError::LeaseNotFound(target.display().to_string()));
		}

		self.lease_cas(run_id, "renew", lease_seconds, false).await
	}

	async fn remove_lease(&self, run_id: &str, lease_seconds: u64) -> WorkflowResult<()> {
		let target = self.lease_path(run_id);
		if !target.exists() {
			return Err(WorkflowError::LeaseNotFound(target.display().to_string()));
		}

		let still_holding = self.lease_cas(run_id, "remove", lease_seconds, false).await?;
		if still_holding {
			match tokio::fs::remove_file(&target).await {
				Ok(()) => {}
				Err(err) if err.kind() == ErrorKind::NotFound => {}
				Err(err) => return Err(err.into()),
			}
		}

		Ok(())
	}

	async fn read_workflow_links(&self, workflow_name: &str) -> WorkflowResult<Vec<String>> {
		dir_names(&self.root.join("links").join(workflow_name)).await
	}

	async fn write_workflow_link(&self, workflow_name: &str, run_id: &str) -> WorkflowResult<()> {
		let dir = self.root.join("links").join(workflow_name);
		tokio::fs::create_dir_all(&dir).await?;
		tokio::fs::write(dir.join(run_id), "").await?;

		Ok(())
	}
}

async fn lease_is_held(path: &Path, lease_seconds: u64) -> WorkflowResult<bool> {
	match tokio::fs::metadata(path).await {
		Ok(meta) => {
			let modified = meta.modified()?;
			Ok(modified + Duration::from_secs(lease_seconds) > SystemTime::now())
		}
		Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
		Err(err) => Err(err.into()),
	}
}

/// Removes a schedule payload file and its timestamp directory once empty.
async fn remove_schedule_file(path: &Path) -> WorkflowResult<()> {
	tokio::fs::remove_file(path).await?;

	if let Some(parent) = path.parent() {
		// non-empty directories are left alone
		let _ = tokio::fs::remove_dir(parent).await;
	}

	Ok(())
}

/// Writes through a dot-prefixed sibling and renames it into place, so
/// concurrent readers never observe a torn file.
async fn write_atomically(path: &Path, raw: &[u8]) -> WorkflowResult<()> {
	let Some(parent) = path.parent() else {
		return Err(WorkflowError::Io(std::io::Error::new(
			ErrorKind::InvalidInput,
			format!("no parent directory for {}", path.display()),
		)));
	};

	let staged = parent.join(format!(".{}.tmp", Uuid::new_v4()));
	tokio::fs::write(&staged, raw).await?;
	tokio::fs::rename(&staged, path).await?;

	Ok(())
}

/// Loads and sorts directory entry names; missing directories read as empty
/// and dot-prefixed staging files are skipped.
async fn dir_names(path: &Path) -> WorkflowResult<Vec<String>> {
	let mut dir = match tokio::fs::read_dir(path).await {
		Ok(dir) => dir,
		Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
		Err(err) => return Err(err.into()),
	};

	let mut names = Vec::new();
	while let Some(entry) = dir.next_entry().await? {
		let name = entry.file_name().to_string_lossy().into_owned();
		if name.starts_with('.') {
			continue;
		}
		names.push(name);
	}
	names.sort();

	Ok(names)
}
