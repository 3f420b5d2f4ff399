//! Record digests computed locally from fetched log records.
//!
//! These helpers never talk to the backend. [`LogService`](crate::service::LogService)
//! fetches records through the cached search path and hands them here:
//!
//! | Function | Used by | Produces |
//! |----------|---------|----------|
//! | [`error_entries`] | `extract_errors` | flattened error records with stack traces |
//! | [`aggregate`] | `analyze_logs` | per-value counts of one field and the error rate |
//! | [`recent_entries`] | `recent_logs` | records tagged with their normalized timestamp |
//! | [`session_attempts`] | `extract_session_id` | session ids parsed from pipe-delimited messages |

use std::collections::BTreeMap;

use kibana_harness_core::models::LogRecord;
use serde::Serialize;
use serde_json::Value;

/// Levels counted as errors, upper case.
pub const ERROR_LEVELS: &[&str] = &["ERROR", "FATAL", "CRITICAL"];

/// Separator between segments of a payment log message.
pub const SESSION_SEGMENT_SEPARATOR: &str = " | ";

const SNIPPET_LEN: usize = 250;

fn is_error_level(level: &str) -> bool {
    ERROR_LEVELS.iter().any(|l| l.eq_ignore_ascii_case(level))
}

// ============ Errors ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub timestamp: Option<String>,
    pub level: String,
    pub message: String,
    pub service: String,
    pub stack_trace: Option<Value>,
}

/// `error.stack_trace` wins over a top-level `stack_trace`.
fn stack_trace(record: &LogRecord) -> Option<Value> {
    record
        .field("error")
        .and_then(|e| e.get("stack_trace"))
        .or_else(|| record.field("stack_trace"))
        .filter(|v| !v.is_null())
        .cloned()
}

pub fn error_entries(records: &[LogRecord], include_stack_traces: bool) -> Vec<ErrorEntry> {
    records
        .iter()
        .map(|record| ErrorEntry {
            timestamp: record.timestamp().map(str::to_string),
            level: record.level().unwrap_or("error").to_string(),
            message: record.message().unwrap_or_default().to_string(),
            service: record.str_field("service").unwrap_or_default().to_string(),
            stack_trace: if include_stack_traces {
                stack_trace(record)
            } else {
                None
            },
        })
        .collect()
}

// ============ Aggregation ============

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldStats {
    pub total_logs: usize,
    /// Share of records at an error level, in `[0, 1]`.
    pub error_rate: f64,
    pub group_by: Option<String>,
    /// Record count per distinct value of `group_by`. Records without the
    /// field are not counted.
    pub groups: BTreeMap<String, usize>,
}

fn group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn aggregate(records: &[LogRecord], group_by: Option<&str>) -> FieldStats {
    let total_logs = records.len();
    let errors = records
        .iter()
        .filter(|r| r.level().is_some_and(is_error_level))
        .count();

    let mut groups = BTreeMap::new();
    if let Some(field) = group_by {
        for value in records.iter().filter_map(|r| r.field(field)) {
            *groups.entry(group_key(value)).or_insert(0) += 1;
        }
    }

    FieldStats {
        total_logs,
        error_rate: if total_logs == 0 {
            0.0
        } else {
            errors as f64 / total_logs as f64
        },
        group_by: group_by.map(str::to_string),
        groups,
    }
}

// ============ Recent logs ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentEntry {
    /// First timestamp-like field found on the record.
    pub normalized_timestamp: Option<String>,
    pub record: LogRecord,
}

pub fn recent_entries(records: &[LogRecord]) -> Vec<RecentEntry> {
    records
        .iter()
        .map(|record| RecentEntry {
            normalized_timestamp: record.timestamp().map(str::to_string),
            record: record.clone(),
        })
        .collect()
}

// ============ Session ids ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Extracted,
    /// The third segment exists but is blank.
    EmptySegment,
    NotEnoughSegments,
    MissingMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionAttempt {
    pub log_index: usize,
    pub snippet: String,
    pub session_id: Option<String>,
    pub status: ExtractionStatus,
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_LEN).collect()
}

/// Session id from a `{num} | {id} | {session} | ...` message.
pub fn parse_session_id(message: &str) -> Result<&str, ExtractionStatus> {
    let segment = message
        .split(SESSION_SEGMENT_SEPARATOR)
        .nth(2)
        .ok_or(ExtractionStatus::NotEnoughSegments)?
        .trim();
    if segment.is_empty() {
        return Err(ExtractionStatus::EmptySegment);
    }
    Ok(segment)
}

pub fn session_attempts(records: &[LogRecord]) -> Vec<SessionAttempt> {
    records
        .iter()
        .enumerate()
        .map(|(log_index, record)| match record.message() {
            Some(message) => {
                let (session_id, status) = match parse_session_id(message) {
                    Ok(id) => (Some(id.to_string()), ExtractionStatus::Extracted),
                    Err(status) => (None, status),
                };
                SessionAttempt {
                    log_index,
                    snippet: snippet(message),
                    session_id,
                    status,
                }
            }
            None => SessionAttempt {
                log_index,
                snippet: snippet(&record.0.to_string()),
                session_id: None,
                status: ExtractionStatus::MissingMessage,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> LogRecord {
        LogRecord::new(v)
    }

    #[test]
    fn test_error_entries_prefer_nested_stack_trace() {
        let records = vec![
            rec(json!({
                "@timestamp": "2024-06-01T00:00:00Z",
                "level": "ERROR",
                "message": "payment failed",
                "service": "payments",
                "stack_trace": "outer",
                "error": { "stack_trace": "inner" }
            })),
            rec(json!({ "timestamp": "2024-06-01T00:00:01Z", "stack_trace": "only" })),
        ];

        let entries = error_entries(&records, true);
        assert_eq!(entries[0].stack_trace, Some(json!("inner")));
        assert_eq!(entries[0].service, "payments");
        assert_eq!(entries[1].stack_trace, Some(json!("only")));
        assert_eq!(entries[1].level, "error");
        assert_eq!(entries[1].timestamp.as_deref(), Some("2024-06-01T00:00:01Z"));

        let bare = error_entries(&records, false);
        assert!(bare.iter().all(|e| e.stack_trace.is_none()));
    }

    #[test]
    fn test_aggregate_counts_and_error_rate() {
        let records = vec![
            rec(json!({ "level": "ERROR", "status": 500 })),
            rec(json!({ "level": "info", "status": 200 })),
            rec(json!({ "level": "critical", "status": 500 })),
            rec(json!({ "level": "INFO" })),
        ];

        let stats = aggregate(&records, Some("status"));
        assert_eq!(stats.total_logs, 4);
        assert!((stats.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.groups.get("500"), Some(&2));
        assert_eq!(stats.groups.get("200"), Some(&1));
        assert_eq!(stats.groups.len(), 2);

        let none = aggregate(&[], Some("level"));
        assert_eq!(none.error_rate, 0.0);
        assert!(none.groups.is_empty());
    }

    #[test]
    fn test_parse_session_id() {
        assert_eq!(parse_session_id("17 | abc | sess-9 | callStartPayment"), Ok("sess-9"));
        assert_eq!(
            parse_session_id("17 | abc"),
            Err(ExtractionStatus::NotEnoughSegments)
        );
        assert_eq!(
            parse_session_id("17 | abc |   | x"),
            Err(ExtractionStatus::EmptySegment)
        );
    }

    #[test]
    fn test_session_attempts_report_each_record() {
        let records = vec![
            rec(json!({ "message": "1 | a" })),
            rec(json!({ "level": "INFO" })),
            rec(json!({ "message": "1 | a | s-1 | callStartPayment" })),
        ];
        let attempts = session_attempts(&records);
        let statuses: Vec<_> = attempts.iter().map(|a| a.status).collect();
        assert_eq!(
            statuses,
            vec![
                ExtractionStatus::NotEnoughSegments,
                ExtractionStatus::MissingMessage,
                ExtractionStatus::Extracted
            ]
        );
        assert_eq!(attempts[2].session_id.as_deref(), Some("s-1"));
        assert_eq!(attempts[2].log_index, 2);
    }

    #[test]
    fn test_recent_entries_normalize_timestamp() {
        let entries = recent_entries(&[rec(json!({ "created_at": "2024-06-01T00:00:00Z" }))]);
        assert_eq!(
            entries[0].normalized_timestamp.as_deref(),
            Some("2024-06-01T00:00:00Z")
        );
    }
}
