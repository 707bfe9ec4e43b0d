use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Script};

use crate::{
	backend::Backend,
	error::{WorkflowError, WorkflowResult},
	event::{EventRecord, Records},
	utils::{format_ts, parse_ts},
};

const BASE_PREFIX: &str = "substantial";
const SEPARATOR: &str = ":/";

/// Redis backend, for production use.
///
/// Every multi-key mutation executes as one server-side Lua script. Lease
/// expirations are stored as fixed-width RFC 3339 UTC strings, which compare
/// lexicographically in script code.
pub struct RedisBackend {
	conn: ConnectionManager,
	scripts: Scripts,
}

struct Scripts {
	append_metadata: Script,
	add_schedule: Script,
	close_schedule: Script,
	next_run: Script,
	active_leases: Script,
	acquire_lease: Script,
	renew_lease: Script,
	remove_lease: Script,
}

impl Scripts {
	fn new() -> Self {
		Scripts {
			append_metadata: Script::new(
				r#"
				local log_key = KEYS[1]
				local sched_key = KEYS[2]
				local content = ARGV[1]

				redis.call("RPUSH", log_key, sched_key)
				redis.call("SET", sched_key, content)
				"#,
			),
			add_schedule: Script::new(
				r#"
				local q_key = KEYS[1]
				local sched_ref = KEYS[2]
				local sched_key = KEYS[3]
				local sched_score = tonumber(ARGV[1])
				local run_id = ARGV[2]
				local content = ARGV[3]
				local run_ref_prefix = ARGV[4]
				local payload_prefix = ARGV[5]
				local separator = ARGV[6]

				-- a payload entry supersedes earlier bare replays of the run
				if content ~= "" then
					local refs = redis.call("ZRANGEBYSCORE", q_key, "-inf", "(" .. ARGV[1])
					for _, ref in ipairs(refs) do
						if string.sub(ref, 1, #run_ref_prefix) == run_ref_prefix then
							local iso = string.sub(ref, #run_ref_prefix + 1)
							local payload_key = payload_prefix .. iso .. separator .. run_id
							if redis.call("GET", payload_key) == "" then
								redis.call("ZREM", q_key, ref)
								redis.call("DEL", ref)
								redis.call("DEL", payload_key)
							end
						end
					end
				end

				redis.call("ZADD", q_key, sched_score, sched_ref)
				redis.call("ZADD", sched_ref, sched_score, run_id)
				redis.call("SET", sched_key, content)
				"#,
			),
			close_schedule: Script::new(
				r#"
				local q_key = KEYS[1]
				local sched_ref = KEYS[2]
				local sched_key = KEYS[3]
				local run_id = ARGV[1]

				redis.call("ZREM", q_key, sched_ref)
				redis.call("ZREM", sched_ref, run_id)
				redis.call("DEL", sched_key)
				"#,
			),
			next_run: Script::new(
				r#"
				local q_key = KEYS[1]
				local now = ARGV[1]

				local refs = redis.call("ZRANGEBYSCORE", q_key, "-inf", now)
				for _, ref in ipairs(refs) do
					local run_ids = redis.call("ZRANGE", ref, 0, -1)
					for _, run_id in ipairs(run_ids) do
						local excluded = false
						for k = 2, #ARGV do
							if run_id == ARGV[k] then
								excluded = true
								break
							end
						end
						if not excluded then
							return {run_id, ref}
						end
					end
				end

				return nil
				"#,
			),
			active_leases: Script::new(
				r#"
				local all_leases_key = KEYS[1]

				local lease_refs = redis.call("ZRANGE", all_leases_key, 0, -1)
				local results = {}
				for _, lease_ref in ipairs(lease_refs) do
					local exp_time = redis.call("GET", lease_ref)
					if exp_time then
						table.insert(results, lease_ref)
						table.insert(results, exp_time)
					end
				end

				return results
				"#,
			),
			acquire_lease: Script::new(
				r#"
				local all_leases_key = KEYS[1]
				local lease_ref = KEYS[2]
				local now = ARGV[1]
				local lease_exp = ARGV[2]

				if redis.call("EXISTS", lease_ref) == 1 then
					if redis.call("ZRANK", all_leases_key, lease_ref) == false then
						return redis.error_reply("integrity failure: lease ref " .. lease_ref .. " is not an element of " .. all_leases_key)
					end
					if redis.call("GET", lease_ref) > now then
						return 0
					end
				end

				redis.call("ZADD", all_leases_key, 0, lease_ref)
				redis.call("SET", lease_ref, lease_exp)
				return 1
				"#,
			),
			renew_lease: Script::new(
				r#"
				local lease_ref = KEYS[1]
				local new_lease_exp = ARGV[1]

				if redis.call("EXISTS", lease_ref) == 1 then
					redis.call("SET", lease_ref, new_lease_exp)
					return 1
				else
					return 0
				end
				"#,
			),
			remove_lease: Script::new(
				r#"
				local all_leases_key = KEYS[1]
				local lease_ref = KEYS[2]

				redis.call("ZREM", all_leases_key, lease_ref)
				redis.call("DEL", lease_ref)
				"#,
			),
		}
	}
}

impl RedisBackend {
	pub async fn connect(url: &str) -> WorkflowResult<Self> {
		let client = redis::Client::open(url)?;
		let conn = client.get_connection_manager().await?;

		Ok(RedisBackend {
			conn,
			scripts: Scripts::new(),
		})
	}

	fn key(&self, parts: &[&str]) -> WorkflowResult<String> {
		key(parts)
	}

	fn parts<'a>(&self, key: &'a str) -> WorkflowResult<Vec<&'a str>> {
		parts(key)
	}
}

fn key(parts: &[&str]) -> WorkflowResult<String> {
	for part in parts {
		if part.contains(SEPARATOR) {
			return Err(WorkflowError::InvalidKey(format!(
				"part '{part}' cannot contain separator '{SEPARATOR}'"
			)));
		}
	}

	Ok(format!("{BASE_PREFIX}{SEPARATOR}{}", parts.join(SEPARATOR)))
}

fn parts(key: &str) -> WorkflowResult<Vec<&str>> {
	let prefix = format!("{BASE_PREFIX}{SEPARATOR}");
	let Some(rest) = key.strip_prefix(&prefix) else {
		return Err(WorkflowError::InvalidKey(format!(
			"key '{key}' is missing prefix '{BASE_PREFIX}'"
		)));
	};

	Ok(rest.split(SEPARATOR).collect())
}

#[async_trait]
impl Backend for RedisBackend {
	async fn read_events(&self, run_id: &str) -> WorkflowResult<Option<Records>> {
		let key = self.key(&["runs", run_id, "events"])?;
		let mut conn = self.conn.clone();

		let raw: Option<String> = conn.get(&key).await?;
		match raw {
			Some(raw) => Ok(Some(
				serde_json::from_str(&raw).map_err(WorkflowError::DeserializeValue)?,
			)),
			None => Ok(None),
		}
	}

	async fn write_events(&self, run_id: &str, records: Records) -> WorkflowResult<()> {
		let key = self.key(&["runs", run_id, "events"])?;
		let raw = serde_json::to_string_pretty(&records).map_err(WorkflowError::SerializeValue)?;
		let mut conn = self.conn.clone();

		let _: () = conn.set(&key, raw).await?;

		Ok(())
	}

	async fn read_all_metadata(&self, run_id: &str) -> WorkflowResult<Vec<String>> {
		let log_key = self.key(&["runs", run_id, "logs"])?;
		let mut conn = self.conn.clone();

		let sched_keys: Vec<String> = conn.lrange(&log_key, 0, -1).await?;
		if sched_keys.is_empty() {
			return Ok(Vec::new());
		}

		let contents: Vec<Option<String>> = conn.mget(&sched_keys).await?;

		Ok(contents.into_iter().flatten().collect())
	}

	async fn append_metadata(
		&self,
		run_id: &str,
		schedule: DateTime<Utc>,
		content: &str,
	) -> WorkflowResult<()> {
		let log_key = self.key(&["runs", run_id, "logs"])?;
		let sched_key = self.key(&[run_id, &format_ts(&schedule)])?;
		let mut conn = self.conn.clone();

		let _: () = self
			.scripts
			.append_metadata
			.key(&log_key)
			.key(&sched_key)
			.arg(content)
			.invoke_async(&mut conn)
			.await?;

		Ok(())
	}

	async fn add_schedule(
		&self,
		queue: &str,
		run_id: &str,
		schedule: DateTime<Utc>,
		content: Option<EventRecord>,
	) -> WorkflowResult<()> {
		let iso = format_ts(&schedule);
		let q_key = self.key(&["schedules", queue])?;
		let sched_ref = self.key(&["ref_", run_id, &iso])?;
		let sched_key = self.key(&[&iso, run_id])?;

		let raw = match &content {
			Some(record) => serde_json::to_string(record).map_err(WorkflowError::SerializeValue)?,
			None => String::new(),
		};

		// ref prefix this run's schedule refs start with; the script derives
		// the ISO tail from it when fusing
		let run_ref_prefix = format!("{}{SEPARATOR}", self.key(&["ref_", run_id])?);
		let payload_prefix = format!("{BASE_PREFIX}{SEPARATOR}");

		let mut conn = self.conn.clone();
		let _: () = self
			.scripts
			.add_schedule
			.key(&q_key)
			.key(&sched_ref)
			.key(&sched_key)
			.arg(schedule.timestamp_micros())
			.arg(run_id)
			.arg(raw)
			.arg(&run_ref_prefix)
			.arg(&payload_prefix)
			.arg(SEPARATOR)
			.invoke_async(&mut conn)
			.await?;

		Ok(())
	}

	async fn read_schedule(
		&self,
		_queue: &str,
		run_id: &str,
		schedule: DateTime<Utc>,
	) -> WorkflowResult<Option<EventRecord>> {
		let sched_key = self.key(&[&format_ts(&schedule), run_id])?;
		let mut conn = self.conn.clone();

		let raw: Option<String> = conn.get(&sched_key).await?;
		match raw {
			None => Err(WorkflowError::ScheduleNotFound(sched_key)),
			Some(raw) if raw.is_empty() => Ok(None),
			Some(raw) => Ok(Some(
				serde_json::from_str(&raw).map_err(WorkflowError::DeserializeValue)?,
			)),
		}
	}

	async fn close_schedule(
		&self,
		queue: &str,
		run_id: &str,
		schedule: DateTime<Utc>,
	) -> WorkflowResult<()> {
		let iso = format_ts(&schedule);
		let q_key = self.key(&["schedules", queue])?;
		let sched_ref = self.key(&["ref_", run_id, &iso])?;
		let sched_key = self.key(&[&iso, run_id])?;

		let mut conn = self.conn.clone();
		let _: () = self
			.scripts
			.close_schedule
			.key(&q_key)
			.key(&sched_ref)
			.key(&sched_key)
			.arg(run_id)
			.invoke_async(&mut conn)
			.await?;

		Ok(())
	}

	async fn next_run(
		&self,
		queue: &str,
		excludes: &[String],
	) -> WorkflowResult<Option<(String, DateTime<Utc>)>> {
		let q_key = self.key(&["schedules", queue])?;
		let mut conn = self.conn.clone();

		let ret: Option<(String, String)> = self
			.scripts
			.next_run
			.key(&q_key)
			.arg(Utc::now().timestamp_micros())
			.arg(excludes)
			.invoke_async(&mut conn)
			.await?;

		match ret {
			Some((run_id, sched_ref)) => {
				let parts = self.parts(&sched_ref)?;
				let iso = parts.last().ok_or_else(|| {
					WorkflowError::InvalidKey(format!("empty schedule ref '{sched_ref}'"))
				})?;

				Ok(Some((run_id, parse_ts(iso)?)))
			}
			None => Ok(None),
		}
	}

	async fn active_leases(&self, _lease_seconds: u64) -> WorkflowResult<Vec<String>> {
		let all_leases_key = self.key(&["leases"])?;
		let mut conn = self.conn.clone();

		let pairs: Vec<String> = self
			.scripts
			.active_leases
			.key(&all_leases_key)
			.invoke_async(&mut conn)
			.await?;

		let now = format_ts(&Utc::now());
		let mut held = Vec::new();

		for pair in pairs.chunks(2) {
			let [lease_ref, exp_time] = pair else {
				return Err(WorkflowError::LeaseIntegrity(
					"odd lease listing from the index".to_string(),
				));
			};

			if exp_time.as_str() > now.as_str() {
				let parts = self.parts(lease_ref)?;
				let run_id = parts.last().ok_or_else(|| {
					WorkflowError::InvalidKey(format!("empty lease ref '{lease_ref}'"))
				})?;
				held.push((*run_id).to_string());
			}
		}

		Ok(held)
	}

	async fn acquire_lease(&self, run_id: &str, lease_seconds: u64) -> WorkflowResult<bool> {
		let all_leases_key = self.key(&["leases"])?;
		let lease_ref = self.key(&["lease", run_id])?;

		let now = Utc::now();
		let lease_exp = now + chrono::Duration::seconds(lease_seconds as i64);

		let mut conn = self.conn.clone();
		let acquired: i64 = self
			.scripts
			.acquire_lease
			.key(&all_leases_key)
			.key(&lease_ref)
			.arg(format_ts(&now))
			.arg(format_ts(&lease_exp))
			.invoke_async(&mut conn)
			.await?;

		Ok(acquired == 1)
	}

	async fn renew_lease(&self, run_id: &str, lease_seconds: u64) -> WorkflowResult<bool> {
		let lease_ref = self.key(&["lease", run_id])?;
		let lease_exp = Utc::now() + chrono::Duration::seconds(lease_seconds as i64);

		let mut conn = self.conn.clone();
		let renewed: i64 = self
			.scripts
			.renew_lease
			.key(&lease_ref)
			.arg(format_ts(&lease_exp))
			.invoke_async(&mut conn)
			.await?;

		if renewed == 0 {
			return Err(WorkflowError::LeaseNotFound(lease_ref));
		}

		Ok(true)
	}

	async fn remove_lease(&self, run_id: &str, _lease_seconds: u64) -> WorkflowResult<()> {
		let all_leases_key = self.key(&["leases"])?;
		let lease_ref = self.key(&["lease", run_id])?;

		let mut conn = self.conn.clone();
		let _: () = self
			.scripts
			.remove_lease
			.key(&all_leases_key)
			.key(&lease_ref)
			.invoke_async(&mut conn)
			.await?;

		Ok(())
	}

	async fn read_workflow_links(&self, workflow_name: &str) -> WorkflowResult<Vec<String>> {
		let links_key = self.key(&["links", "runs", workflow_name])?;
		let mut conn = self.conn.clone();

		Ok(conn.zrange(&links_key, 0, -1).await?)
	}

	async fn write_workflow_link(&self, workflow_name: &str, run_id: &str) -> WorkflowResult<()> {
		let links_key = self.key(&["links", "runs", workflow_name])?;
		let mut conn = self.conn.clone();

		let _: () = conn.zadd(&links_key, run_id, 0).await?;

		Ok(())
	}
}
