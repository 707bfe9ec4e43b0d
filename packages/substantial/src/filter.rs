use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
	backend::BackendHandle,
	error::{WorkflowError, WorkflowResult},
	event::{Event, Stop},
};

/// Decoded terminal outcome of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
	Ok(Value),
	Err(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
	pub run_id: String,
	pub result: Option<RunResult>,
	pub started_at: Option<DateTime<Utc>>,
	pub ended_at: Option<DateTime<Utc>>,
}

/// Read-only search over completed runs, driven by the workflow-link index
/// and the event logs.
///
/// Queries are nested JSON records: node operators `and`/`or`/`not`,
/// projections `started_at`/`ended_at`, and terminal operators
/// `eq`/`gt`/`gte`/`lt`/`lte`/`in`/`contains`. A term written as
/// `{"ok": v}`, `{"err": v}`, or `null` selects the result kind; any other
/// term is lifted to `{"ok": term}`.
pub struct WorkflowFilter {
	backend: BackendHandle,
}

impl WorkflowFilter {
	pub fn new(backend: BackendHandle) -> Self {
		WorkflowFilter { backend }
	}

	/// Run ids ever started for the workflow.
	pub async fn related_runs(&self, workflow_name: &str) -> anyhow::Result<Vec<String>> {
		Ok(self.backend.read_workflow_links(workflow_name).await?)
	}

	/// Terminal outcomes of the workflow's runs. Runs without any recorded
	/// events surface with an empty result.
	pub async fn list_results(&self, workflow_name: &str) -> anyhow::Result<Vec<SearchResult>> {
		let run_ids = self.backend.read_workflow_links(workflow_name).await?;
		let mut results = Vec::new();

		for run_id in run_ids {
			let records = self.backend.read_events(&run_id).await?;

			let Some(records) = records.filter(|records| !records.events.is_empty()) else {
				results.push(SearchResult {
					run_id,
					result: None,
					started_at: None,
					ended_at: None,
				});
				continue;
			};

			let mut started_at = None;
			for record in &records.events {
				match &record.event {
					Event::Start(_) => started_at = Some(record.at),
					Event::Stop(stop) => {
						let result = match stop {
							Stop::Ok(raw) => RunResult::Ok(
								serde_json::from_str(raw)
									.map_err(WorkflowError::DeserializeValue)?,
							),
							Stop::Err(raw) => RunResult::Err(
								serde_json::from_str(raw)
									.map_err(WorkflowError::DeserializeValue)?,
							),
						};

						results.push(SearchResult {
							run_id: run_id.clone(),
							result: Some(result),
							started_at,
							ended_at: Some(record.at),
						});
						break;
					}
					_ => {}
				}
			}
		}

		Ok(results)
	}

	pub async fn search(
		&self,
		workflow_name: &str,
		query: &Value,
	) -> anyhow::Result<Vec<SearchResult>> {
		let results = self.list_results(workflow_name).await?;
		let mut filtered = Vec::new();

		for result in results {
			if eval_expr(&result, query)? {
				filtered.push(result);
			}
		}

		Ok(filtered)
	}
}

/// Evaluates a query node against one search result.
pub fn eval_expr(s_result: &SearchResult, query: &Value) -> WorkflowResult<bool> {
	let Some(map) = query.as_object() else {
		return Err(WorkflowError::InvalidFilterQuery(format!(
			"expected an object, got {query}"
		)));
	};

	for (op, operand) in map {
		match op.as_str() {
			"and" | "or" => {
				let Some(list) = operand.as_array() else {
					return Err(WorkflowError::InvalidFilterQuery(format!(
						"'{op}' expects a list"
					)));
				};
				if list.iter().any(Value::is_null) {
					return Err(WorkflowError::InvalidFilterQuery(format!(
						"'{op}' operand cannot be null"
					)));
				}

				if op == "and" {
					for sub in list {
						if !eval_expr(s_result, sub)? {
							return Ok(false);
						}
					}
				} else {
					let mut any = false;
					for sub in list {
						if eval_expr(s_result, sub)? {
							any = true;
							break;
						}
					}
					if !any {
						return Ok(false);
					}
				}
			}
			"not" => {
				if !operand.is_object() {
					return Err(WorkflowError::InvalidFilterQuery(
						"'not' expects an object".to_string(),
					));
				}
				if eval_expr(s_result, operand)? {
					return Ok(false);
				}
			}
			"started_at" | "ended_at" => {
				let discr = if op == "started_at" {
					s_result.started_at
				} else {
					s_result.ended_at
				};

				// project the date into a result so terminal operators apply
				let term = SearchResult {
					run_id: s_result.run_id.clone(),
					result: discr.map(|ts| RunResult::Ok(Value::String(format_date(&ts)))),
					started_at: None,
					ended_at: None,
				};

				return eval_term(&term, operand);
			}
			_ => return eval_term(s_result, query),
		}
	}

	Ok(true)
}

fn eval_term(s_result: &SearchResult, term_map: &Value) -> WorkflowResult<bool> {
	let Some(map) = term_map.as_object() else {
		return Err(WorkflowError::InvalidFilterQuery(format!(
			"expected an object of terminal operators, got {term_map}"
		)));
	};

	let result = &s_result.result;

	for (op, raw) in map {
		let term = lift_term(raw);

		match op.as_str() {
			"eq" => {
				if !(same(result, &term) && unlift(result) == unlift(&term)) {
					return Ok(false);
				}
			}
			"gt" | "gte" | "lt" | "lte" => {
				if !same(result, &term) {
					return Ok(false);
				}

				let ordering = match (unlift(result), unlift(&term)) {
					(Some(a), Some(b)) => compare_values(a, b),
					_ => None,
				};

				let holds = match (op.as_str(), ordering) {
					("gt", Some(std::cmp::Ordering::Greater)) => true,
					("gte", Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)) => true,
					("lt", Some(std::cmp::Ordering::Less)) => true,
					("lte", Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)) => true,
					_ => false,
				};

				if !holds {
					return Ok(false);
				}
			}
			"in" | "contains" => {
				// `in` means result in term, `contains` means term in result
				let (val, container) = if op == "contains" {
					(unlift(&term), unlift(result))
				} else {
					(unlift(result), unlift(&term))
				};

				if !generic_includes(val, container) {
					return Ok(false);
				}
			}
			other => {
				return Err(WorkflowError::InvalidFilterQuery(format!(
					"unknown terminal operator: {other}, must be eq, gt, gte, lt, lte, in or contains"
				)));
			}
		}
	}

	Ok(true)
}

/// Lifts a raw query term into a result: `null` selects unfinished runs,
/// single-key `{"ok": v}`/`{"err": v}` objects select the kind, anything
/// else reads as `Ok(term)`.
fn lift_term(raw: &Value) -> Option<RunResult> {
	if raw.is_null() {
		return None;
	}

	if let Some(map) = raw.as_object() {
		if map.len() == 1 {
			if let Some(inner) = map.get("ok") {
				return Some(RunResult::Ok(inner.clone()));
			}
			if let Some(inner) = map.get("err") {
				return Some(RunResult::Err(inner.clone()));
			}
		}
	}

	Some(RunResult::Ok(raw.clone()))
}

fn unlift(result: &Option<RunResult>) -> Option<&Value> {
	match result {
		Some(RunResult::Ok(value)) | Some(RunResult::Err(value)) => Some(value),
		None => None,
	}
}

/// `Ok`/`Err`/absent mismatch reads as different; same kind compares the
/// unwrapped JSON types.
fn same(a: &Option<RunResult>, b: &Option<RunResult>) -> bool {
	match (a, b) {
		(None, None) => true,
		(Some(RunResult::Ok(x)), Some(RunResult::Ok(y)))
		| (Some(RunResult::Err(x)), Some(RunResult::Err(y))) => same_json_type(x, y),
		_ => false,
	}
}

fn same_json_type(a: &Value, b: &Value) -> bool {
	matches!(
		(a, b),
		(Value::Null, Value::Null)
			| (Value::Bool(_), Value::Bool(_))
			| (Value::Number(_), Value::Number(_))
			| (Value::String(_), Value::String(_))
			| (Value::Array(_), Value::Array(_))
			| (Value::Object(_), Value::Object(_))
	)
}

fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
	match (a, b) {
		(Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
		(Value::String(x), Value::String(y)) => Some(x.cmp(y)),
		_ => None,
	}
}

/// Container membership: lists by element equality, objects by subset (or key
/// membership for string needles), strings by substring.
fn generic_includes(val: Option<&Value>, container: Option<&Value>) -> bool {
	let (Some(val), Some(container)) = (val, container) else {
		return false;
	};

	match container {
		Value::Array(items) => items.contains(val),
		Value::Object(map) => match val {
			Value::Object(sub) => sub.iter().all(|(k, v)| map.get(k) == Some(v)),
			Value::String(key) => map.contains_key(key),
			_ => false,
		},
		Value::String(text) => {
			matches!(val, Value::String(needle) if text.contains(needle.as_str()))
		}
		_ => false,
	}
}

fn format_date(ts: &DateTime<Utc>) -> String {
	ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}
