use chrono::{TimeZone, Utc};
use serde_json::json;
use substantial::filter::{eval_expr, RunResult, SearchResult};

fn search_results() -> Vec<SearchResult> {
	let raw = vec![
		Some(RunResult::Ok(json!(1))),
		Some(RunResult::Ok(json!(2))),
		Some(RunResult::Ok(json!(3))),
		Some(RunResult::Ok(json!(["one", "two"]))),
		None,
		Some(RunResult::Ok(json!(4))),
		Some(RunResult::Err(json!("fatal: example"))),
		Some(RunResult::Ok(json!(5))),
		Some(RunResult::Err(json!("error: example"))),
		None,
	];

	let mut results = Vec::new();
	let mut start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

	for (i, result) in raw.into_iter().enumerate() {
		match result {
			None => results.push(SearchResult {
				run_id: format!("fake_uuid#{i}"),
				result: None,
				started_at: Some(start),
				ended_at: None,
			}),
			Some(result) => {
				let end = start + chrono::Duration::days(1);
				results.push(SearchResult {
					run_id: format!("fake_uuid#{i}"),
					result: Some(result),
					started_at: Some(start),
					ended_at: Some(end),
				});
				if i % 2 == 0 {
					// new day at every second result
					start = end;
				}
			}
		}
	}

	results
}

fn filtered(query: serde_json::Value) -> Vec<Option<RunResult>> {
	search_results()
		.into_iter()
		.filter(|r| eval_expr(r, &query).unwrap())
		.map(|r| r.result)
		.collect()
}

#[test]
fn null_terms_select_unfinished_runs() {
	assert_eq!(filtered(json!({"eq": null})), vec![None, None]);
}

#[test]
fn invalid_queries_are_rejected() {
	let results = search_results();

	let err = eval_expr(&results[0], &json!({"bad_op": {"contains": "..."}})).unwrap_err();
	assert!(err
		.to_string()
		.contains("unknown terminal operator: bad_op, must be eq, gt, gte, lt, lte, in or contains"));

	let err = eval_expr(&results[0], &json!({"and": {"contains": "..."}})).unwrap_err();
	assert!(err.to_string().contains("'and' expects a list"));

	let err = eval_expr(&results[0], &json!({"or": [{"eq": "valid"}, null]})).unwrap_err();
	assert!(err.to_string().contains("'or' operand cannot be null"));

	let err = eval_expr(&results[0], &json!({"not": null})).unwrap_err();
	assert!(err.to_string().contains("'not' expects an object"));
}

#[test]
fn simple_ordering_filter() {
	assert_eq!(
		filtered(json!({"lt": {"ok": 3}})),
		vec![
			Some(RunResult::Ok(json!(1))),
			Some(RunResult::Ok(json!(2))),
		]
	);
}

#[test]
fn nested_filters_preserve_order() {
	let query = json!({
		"or": [
			{
				"and": [
					{"contains": {"err": "fatal"}},
					{"not": {"eq": {"err": "error: example"}}},
					{"not": {"eq": null}},
				]
			},
			{"eq": {"ok": 1}},
			{"gte": 4},
		]
	});

	assert_eq!(
		filtered(query),
		vec![
			Some(RunResult::Ok(json!(1))),
			Some(RunResult::Ok(json!(4))),
			Some(RunResult::Err(json!("fatal: example"))),
			Some(RunResult::Ok(json!(5))),
		]
	);
}

#[test]
fn date_projections_compare_as_strings() {
	let query = json!({
		"or": [
			{"ended_at": {"gte": "2024-01-05 00:00:00"}},
			{"eq": -1},
		]
	});

	assert_eq!(
		filtered(query),
		vec![
			Some(RunResult::Ok(json!(5))),
			Some(RunResult::Err(json!("error: example"))),
		]
	);

	assert_eq!(
		filtered(json!({"started_at": {"contains": "01-01 00:"}})),
		vec![Some(RunResult::Ok(json!(1)))]
	);
}

#[test]
fn contains_and_in_are_mirrored() {
	let query = json!({
		"or": [
			{"contains": {"err": "fatal"}},
			{"in": [1, 4]},
			{"contains": "two"},
		]
	});

	assert_eq!(
		filtered(query),
		vec![
			Some(RunResult::Ok(json!(1))),
			Some(RunResult::Ok(json!(["one", "two"]))),
			Some(RunResult::Ok(json!(4))),
			Some(RunResult::Err(json!("fatal: example"))),
		]
	);
}
