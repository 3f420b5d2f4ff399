//! Core data models shared by the query and summarization pipeline.
//!
//! [`LogRecord`] is the opaque unit returned by the search backend.
//! [`AnalysisResult`] is what the analysis collaborator produces for one
//! ordered slice of records, and [`MergedAnalysis`] is the combined report
//! built by [`summarize`](crate::chunk::summarize).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field names tried, in order, when reading a record's timestamp.
pub const TIMESTAMP_FIELDS: &[&str] = &["@timestamp", "timestamp", "time", "start_time", "created_at"];

/// A single log record as returned by the backend (the `_source` document).
///
/// The core never interprets records beyond a few well-known fields used
/// for local heuristics; everything else is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecord(pub Value);

impl LogRecord {
    pub fn new(source: Value) -> Self {
        Self(source)
    }

    /// Look up a top-level field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Look up a top-level field that holds a string.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// First timestamp-looking field present on the record.
    pub fn timestamp(&self) -> Option<&str> {
        TIMESTAMP_FIELDS.iter().find_map(|f| self.str_field(f))
    }

    pub fn level(&self) -> Option<&str> {
        self.str_field("level")
    }

    pub fn message(&self) -> Option<&str> {
        self.str_field("message")
    }
}

/// Structured analysis of one ordered slice of log records.
///
/// Every field defaults to empty so that partially-populated responses from
/// an analysis provider still deserialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisResult {
    /// Overview of what the records show.
    pub summary: String,
    pub key_insights: Vec<String>,
    pub errors: Vec<String>,
    pub function_calls: Vec<String>,
    /// Chronological narrative of the slice.
    pub timestamp_flow: String,
    pub anomalies: Vec<String>,
    pub focus_areas: Vec<String>,
    pub recommendations: Vec<String>,
}

/// A chunk whose analysis failed and was left out of a merged report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    /// Zero-based chunk position in the original record order.
    pub index: usize,
    /// Number of records in the skipped chunk.
    pub records: usize,
    pub message: String,
}

/// Combined report derived from one or more [`AnalysisResult`]s.
///
/// Never persisted; it is rebuilt on every summarization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedAnalysis {
    #[serde(flatten)]
    pub analysis: AnalysisResult,
    /// Number of chunks the input was split into.
    pub chunks_total: usize,
    /// Number of chunks whose analysis failed and was skipped.
    pub chunks_skipped: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<ChunkFailure>,
}

impl MergedAnalysis {
    /// Wrap a single, unchunked analysis.
    pub fn single(analysis: AnalysisResult) -> Self {
        Self {
            analysis,
            chunks_total: 1,
            chunks_skipped: 0,
            skipped: Vec::new(),
        }
    }

    /// Human-readable note about skipped chunks, e.g. `"1 chunk skipped"`.
    pub fn skipped_note(&self) -> Option<String> {
        match self.chunks_skipped {
            0 => None,
            1 => Some("1 chunk skipped".to_string()),
            n => Some(format!("{} chunks skipped", n)),
        }
    }
}
