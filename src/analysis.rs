//! Analysis providers.
//!
//! Defines the [`Analyzer`] trait consumed by the summarization pipeline and
//! its concrete implementations:
//! - **[`DisabledAnalyzer`]**: always fails; used when analysis is not configured.
//! - **[`HeuristicAnalyzer`]**: local, no-network analysis built from record fields.
//! - **[`OpenAiAnalyzer`]**: calls an OpenAI-compatible chat-completions API.
//!
//! # Provider Selection
//!
//! Use [`create_analyzer`] to instantiate the provider named by the
//! configuration:
//!
//! ```rust,no_run
//! # use kibana_harness::config::AnalysisConfig;
//! # use kibana_harness::analysis::create_analyzer;
//! let config = AnalysisConfig::default(); // provider = "disabled"
//! let analyzer = create_analyzer(&config).unwrap();
//! assert_eq!(analyzer.name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use kibana_harness_core::chunk::{AnalysisError, ChunkContext};
use kibana_harness_core::models::{AnalysisResult, LogRecord};
use kibana_harness_core::time_filter::TimeWindow;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AnalysisConfig;

/// Query context handed to the analyzer with each chunk.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub query: String,
    pub index_pattern: String,
    pub window: TimeWindow,
    /// Focus on function-call tracing rather than general log analysis.
    pub function_mode: bool,
    pub chunk: ChunkContext,
}

/// An analysis collaborator: ordered records in, structured analysis out.
///
/// Calls are independent; no session state is shared between chunks.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(
        &self,
        records: &[LogRecord],
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, AnalysisError>;
}

/// Create an analyzer for the configured provider.
pub fn create_analyzer(config: &AnalysisConfig) -> Result<Arc<dyn Analyzer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledAnalyzer)),
        "heuristic" => Ok(Arc::new(HeuristicAnalyzer)),
        "openai" => Ok(Arc::new(OpenAiAnalyzer::new(config)?)),
        other => bail!("Unknown analysis provider: {}", other),
    }
}

// ============ Disabled Provider ============

pub struct DisabledAnalyzer;

#[async_trait]
impl Analyzer for DisabledAnalyzer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn analyze(
        &self,
        _records: &[LogRecord],
        _context: &AnalysisContext,
    ) -> Result<AnalysisResult, AnalysisError> {
        Err(AnalysisError::new(
            "analysis provider is disabled; set analysis.provider to heuristic or openai",
        ))
    }
}

// ============ Heuristic Provider ============

/// Field names that may hold the invoked function.
const FUNCTION_FIELDS: &[&str] = &["FunctionCalled", "function", "function_name", "func"];

/// Builds an analysis from level counts, error messages, function fields
/// and timestamps. Deterministic and offline.
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn analyze_records(&self, records: &[LogRecord], context: &AnalysisContext) -> AnalysisResult {
        let mut levels: BTreeMap<String, usize> = BTreeMap::new();
        let mut errors = Vec::new();
        let mut function_calls = Vec::new();
        let mut services = Vec::new();

        for record in records {
            let level = record.level().unwrap_or("UNKNOWN").to_ascii_uppercase();
            *levels.entry(level.clone()).or_default() += 1;

            if level == "ERROR" {
                if let Some(msg) = record.message() {
                    push_unique(&mut errors, msg.to_string());
                }
            }
            if let Some(f) = FUNCTION_FIELDS.iter().find_map(|f| record.str_field(f)) {
                push_unique(&mut function_calls, f.to_string());
            }
            if let Some(s) = record.str_field("service").or_else(|| record.str_field("app")) {
                push_unique(&mut services, s.to_string());
            }
        }

        let count = |l: &str| levels.get(l).copied().unwrap_or(0);
        let total = records.len();
        let error_count = count("ERROR");
        let warn_count = count("WARN") + count("WARNING");

        let level_summary = levels
            .iter()
            .map(|(l, n)| format!("{} {}", n, l))
            .collect::<Vec<_>>()
            .join(", ");

        let mut summary = format!(
            "{} record(s) from {} between {} and {}",
            total,
            context.index_pattern,
            context.window.start.to_rfc3339(),
            context.window.end.to_rfc3339()
        );
        if !context.query.is_empty() {
            summary.push_str(&format!(" matching '{}'", context.query));
        }
        if !level_summary.is_empty() {
            summary.push_str(&format!(": {}.", level_summary));
        }

        let mut key_insights = Vec::new();
        if !services.is_empty() {
            key_insights.push(format!("Services involved: {}", services.join(", ")));
        }
        if context.function_mode && !function_calls.is_empty() {
            key_insights.push(format!("{} distinct function(s) invoked", function_calls.len()));
        }
        if error_count > 0 {
            key_insights.push(format!("{} distinct error message(s)", errors.len()));
        }

        let mut anomalies = Vec::new();
        if total > 0 && error_count * 2 > total {
            anomalies.push(format!(
                "Error rate above 50% ({} of {} records)",
                error_count, total
            ));
        }
        let untimed = records.iter().filter(|r| r.timestamp().is_none()).count();
        if untimed > 0 {
            anomalies.push(format!("{} record(s) without a timestamp", untimed));
        }

        let mut focus_areas = Vec::new();
        let mut recommendations = Vec::new();
        if error_count > 0 {
            focus_areas.push("Errors".to_string());
            recommendations.push(format!(
                "Investigate the {} distinct error message(s), starting with the first occurrence",
                errors.len()
            ));
        }
        if warn_count > 0 {
            focus_areas.push("Warnings".to_string());
        }

        AnalysisResult {
            summary,
            key_insights,
            errors,
            function_calls,
            timestamp_flow: timestamp_flow(records),
            anomalies,
            focus_areas,
            recommendations,
        }
    }
}

#[async_trait]
impl Analyzer for HeuristicAnalyzer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn analyze(
        &self,
        records: &[LogRecord],
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, AnalysisError> {
        Ok(self.analyze_records(records, context))
    }
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}

fn timestamp_flow(records: &[LogRecord]) -> String {
    let stamped: Vec<(&str, &LogRecord)> = records
        .iter()
        .filter_map(|r| r.timestamp().map(|t| (t, r)))
        .collect();

    match (stamped.first(), stamped.last()) {
        (Some((first, a)), Some((last, b))) => format!(
            "{} [{}] {} → {} [{}] {}",
            first,
            a.level().unwrap_or("-"),
            a.message().unwrap_or(""),
            last,
            b.level().unwrap_or("-"),
            b.message().unwrap_or("")
        ),
        _ => String::new(),
    }
}

// ============ OpenAI Provider ============

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Longest serialized record sent to the model.
const MAX_RECORD_CHARS: usize = 2000;

/// Analysis via an OpenAI-compatible chat-completions endpoint.
///
/// Requires `OPENAI_API_KEY` and `analysis.model`.
pub struct OpenAiAnalyzer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
    max_retries: u32,
}

impl OpenAiAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("analysis.model required for openai provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn analyze(
        &self,
        records: &[LogRecord],
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, AnalysisError> {
        let body = serde_json::json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system_prompt(context.function_mode) },
                { "role": "user", "content": user_prompt(records, context) },
            ],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            debug!(
                chunk = context.chunk.index,
                total = context.chunk.total,
                attempt,
                "requesting analysis"
            );

            let resp = self
                .client
                .post(format!("{}/chat/completions", self.url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|e| AnalysisError::new(format!("invalid response: {}", e)))?;
                        return parse_chat_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(status = status.as_u16(), attempt, "analysis API unavailable; will retry");
                        last_err = Some(format!("analysis API error {}: {}", status, body_text));
                        continue;
                    }

                    return Err(AnalysisError::new(format!(
                        "analysis API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(AnalysisError::new(
            last_err.unwrap_or_else(|| "analysis failed after retries".to_string()),
        ))
    }
}

fn system_prompt(function_mode: bool) -> String {
    let focus = if function_mode {
        "You trace function calls in backend logs: call order, parameters, results, and failures along the execution path."
    } else {
        "You analyze backend logs from production services: activity, errors, patterns, and anomalies."
    };
    format!(
        "{} Respond with one JSON object with keys: \
         summary (string), key_insights (array of strings), errors (array of strings), \
         function_calls (array of strings), timestamp_flow (string, chronological), \
         anomalies (array of strings), focus_areas (array of strings), \
         recommendations (array of strings). Be specific and cite values from the logs.",
        focus
    )
}

fn user_prompt(records: &[LogRecord], context: &AnalysisContext) -> String {
    let mut prompt = format!(
        "Index: {}\nQuery: {}\nWindow: {} to {}\nChunk {} of {}\n\nLogs:\n",
        context.index_pattern,
        if context.query.is_empty() { "*" } else { context.query.as_str() },
        context.window.start.to_rfc3339(),
        context.window.end.to_rfc3339(),
        context.chunk.index + 1,
        context.chunk.total,
    );
    for record in records {
        let line = record.0.to_string();
        if line.len() > MAX_RECORD_CHARS {
            let mut end = MAX_RECORD_CHARS;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            prompt.push_str(&line[..end]);
            prompt.push('…');
        } else {
            prompt.push_str(&line);
        }
        prompt.push('\n');
    }
    prompt
}

/// Parse `choices[0].message.content` as an [`AnalysisResult`].
fn parse_chat_response(json: &Value) -> Result<AnalysisResult, AnalysisError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| AnalysisError::new("invalid response: missing message content"))?;

    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(trimmed)
        .map_err(|e| AnalysisError::new(format!("model returned invalid analysis JSON: {}", e)))
}
