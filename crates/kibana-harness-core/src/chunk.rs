//! Chunked analysis of large record sets.
//!
//! Splits an ordered record sequence into contiguous [`chunk_records`]
//! slices, hands each slice to an analysis function, and merges the
//! partial [`AnalysisResult`]s into one [`MergedAnalysis`].
//!
//! # Algorithm
//!
//! 1. If `records.len() <= threshold`, analyze once and return the result
//!    unchanged.
//! 2. Otherwise split into slices of at most `threshold` records. The last
//!    slice may be shorter. Concatenating the slices yields the input.
//! 3. Analyze up to `max_concurrent` slices at a time. Results are
//!    collected in slice order regardless of completion order.
//! 4. Merge successful results:
//!    - summaries joined with [`CHUNK_BOUNDARY`]
//!    - list fields concatenated, then de-duplicated by exact string
//!      equality keeping first-seen order
//!    - `timestamp_flow` concatenated in slice order
//! 5. Failed slices are skipped and reported. If every slice failed,
//!    return [`SummarizeError::SummarizationFailed`].
//!
//! The combiner never reorders records. The merged narrative follows time
//! order only if the input does.
//!
//! # Example
//!
//! ```rust
//! use kibana_harness_core::chunk::chunk_records;
//!
//! let records: Vec<u32> = (0..240).collect();
//! let sizes: Vec<usize> = chunk_records(&records, 100).iter().map(|c| c.len()).collect();
//! assert_eq!(sizes, vec![100, 100, 40]);
//! ```

use std::collections::HashSet;
use std::future::Future;

use futures::stream::{self, StreamExt};
use thiserror::Error;

use crate::models::{AnalysisResult, ChunkFailure, MergedAnalysis};

/// Separator inserted between per-chunk summaries.
pub const CHUNK_BOUNDARY: &str = "\n\n--- chunk boundary ---\n\n";

/// Failure of a single analysis call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("analysis failed: {message}")]
pub struct AnalysisError {
    pub message: String,
}

impl AnalysisError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SummarizeError {
    #[error(
        "summarization failed: all {chunks} chunk(s) failed analysis; first error: {}",
        .failures.first().map(|f| f.message.as_str()).unwrap_or("none")
    )]
    SummarizationFailed {
        chunks: usize,
        failures: Vec<ChunkFailure>,
    },
}

/// Position of a slice within the whole summarization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkContext {
    pub index: usize,
    pub total: usize,
}

/// Tuning for [`summarize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    /// Maximum records per analysis call.
    pub threshold: usize,
    /// Maximum analysis calls in flight at once.
    pub max_concurrent: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            threshold: 100,
            max_concurrent: 4,
        }
    }
}

/// Partition `records` into contiguous slices of at most `size` elements.
///
/// `size` is clamped to at least 1. An empty input yields no slices.
pub fn chunk_records<T>(records: &[T], size: usize) -> Vec<&[T]> {
    records.chunks(size.max(1)).collect()
}

/// Outcome of analyzing one slice.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub index: usize,
    pub records: usize,
    pub result: Result<AnalysisResult, AnalysisError>,
}

/// Analyze `records`, splitting into slices when above the threshold.
pub async fn summarize<'a, T, F, Fut>(
    records: &'a [T],
    options: ChunkOptions,
    analyze: F,
) -> Result<MergedAnalysis, SummarizeError>
where
    F: Fn(ChunkContext, &'a [T]) -> Fut,
    Fut: Future<Output = Result<AnalysisResult, AnalysisError>>,
{
    let threshold = options.threshold.max(1);

    if records.len() <= threshold {
        return match analyze(ChunkContext { index: 0, total: 1 }, records).await {
            Ok(analysis) => Ok(MergedAnalysis::single(analysis)),
            Err(e) => Err(SummarizeError::SummarizationFailed {
                chunks: 1,
                failures: vec![ChunkFailure {
                    index: 0,
                    records: records.len(),
                    message: e.message,
                }],
            }),
        };
    }

    let chunks = chunk_records(records, threshold);
    let total = chunks.len();
    let analyze = &analyze;

    let outcomes: Vec<ChunkOutcome> = stream::iter(chunks.into_iter().enumerate())
        .map(|(index, chunk)| async move {
            let result = analyze(ChunkContext { index, total }, chunk).await;
            ChunkOutcome {
                index,
                records: chunk.len(),
                result,
            }
        })
        .buffered(options.max_concurrent.max(1))
        .collect()
        .await;

    merge_outcomes(outcomes)
}

fn extend_unique(target: &mut Vec<String>, seen: &mut HashSet<String>, items: Vec<String>) {
    for item in items {
        if seen.insert(item.clone()) {
            target.push(item);
        }
    }
}

#[derive(Default)]
struct ListMerger {
    items: Vec<String>,
    seen: HashSet<String>,
}

impl ListMerger {
    fn extend(&mut self, items: Vec<String>) {
        extend_unique(&mut self.items, &mut self.seen, items);
    }
}

/// Merge per-slice outcomes, given in slice order.
pub fn merge_outcomes(outcomes: Vec<ChunkOutcome>) -> Result<MergedAnalysis, SummarizeError> {
    let total = outcomes.len();
    let mut skipped = Vec::new();
    let mut summaries = Vec::new();
    let mut flows = Vec::new();
    let mut key_insights = ListMerger::default();
    let mut errors = ListMerger::default();
    let mut function_calls = ListMerger::default();
    let mut anomalies = ListMerger::default();
    let mut focus_areas = ListMerger::default();
    let mut recommendations = ListMerger::default();

    for outcome in outcomes {
        let part = match outcome.result {
            Ok(part) => part,
            Err(e) => {
                skipped.push(ChunkFailure {
                    index: outcome.index,
                    records: outcome.records,
                    message: e.message,
                });
                continue;
            }
        };

        if !part.summary.trim().is_empty() {
            summaries.push(part.summary);
        }
        if !part.timestamp_flow.trim().is_empty() {
            flows.push(part.timestamp_flow);
        }
        key_insights.extend(part.key_insights);
        errors.extend(part.errors);
        function_calls.extend(part.function_calls);
        anomalies.extend(part.anomalies);
        focus_areas.extend(part.focus_areas);
        recommendations.extend(part.recommendations);
    }

    if skipped.len() == total {
        return Err(SummarizeError::SummarizationFailed {
            chunks: total,
            failures: skipped,
        });
    }

    Ok(MergedAnalysis {
        analysis: AnalysisResult {
            summary: summaries.join(CHUNK_BOUNDARY),
            key_insights: key_insights.items,
            errors: errors.items,
            function_calls: function_calls.items,
            timestamp_flow: flows.join("\n"),
            anomalies: anomalies.items,
            focus_areas: focus_areas.items,
            recommendations: recommendations.items,
        },
        chunks_total: total,
        chunks_skipped: skipped.len(),
        skipped,
    })
}
