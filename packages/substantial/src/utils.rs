use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{WorkflowError, WorkflowResult};

/// Formats a timestamp as a fixed-width RFC 3339 UTC string. The fixed
/// microsecond width keeps lexicographic order equal to chronological order,
/// which both backends rely on for schedule keys.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> WorkflowResult<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(raw)
		.map(|ts| ts.with_timezone(&Utc))
		.map_err(|err| WorkflowError::InvalidTimestamp(format!("{raw}: {err}")))
}

pub(crate) fn to_delta(duration: std::time::Duration) -> chrono::Duration {
	chrono::Duration::milliseconds(duration.as_millis() as i64)
}
