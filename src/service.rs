//! Query orchestration.
//!
//! [`LogService`] is the single entry point for log retrieval. A request
//! flows through the layers in a fixed order:
//!
//! ```text
//! SearchRequest
//!   │  validate + resolve time parameters
//!   ▼
//! QueryDescriptor ──fingerprint──▶ FingerprintCache ── hit ──▶ SearchOutcome
//!                                        │ miss (single flight)
//!                                        ▼
//!                     RetryController ──▶ ConnectionPool ──▶ backend
//! ```
//!
//! Summarization fetches through the same path and then hands the records
//! to [`kibana_harness_core::chunk::summarize`] with the configured
//! [`Analyzer`]. Error extraction, field statistics, recent logs and
//! session-id lookup also fetch through it and digest the records locally
//! (see [`crate::digest`]).
//!
//! Each caller's deadline bounds that caller's wait. A caller that joins
//! a fetch already in flight stops waiting at its own deadline while the
//! fetch carries on for the others.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use kibana_harness_core::chunk::{self, AnalysisError, ChunkContext, ChunkOptions};
use kibana_harness_core::descriptor::{
    Canonical, Fingerprint, QueryDescriptor, SchemaDescriptor, SortOrder,
};
use kibana_harness_core::models::{AnalysisResult, LogRecord, MergedAnalysis};
use kibana_harness_core::time_filter::{resolve_time_params, TimeFilter, TimeParams, TimeWindow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::analysis::{create_analyzer, AnalysisContext, Analyzer};
use crate::backend::{BackendConnection, Connector, KibanaConnector};
use crate::cache::{FingerprintCache, TtlClass};
use crate::config::Config;
use crate::digest::{self, ErrorEntry, FieldStats, RecentEntry, SessionAttempt, ERROR_LEVELS};
use crate::error::QueryError;
use crate::pool::{ConnectionPool, PoolStats};
use crate::retry::{RetryController, RetryPolicy, StateProbe};
use crate::session::Session;

pub const VALID_LEVELS: &[&str] = &["ERROR", "WARN", "INFO", "DEBUG", "TRACE"];
pub const MAX_QUERY_LEN: usize = 5000;
pub const MAX_FIELD_LEN: usize = 100;

/// Default window for `extract_errors`.
pub const ERRORS_DEFAULT_RANGE: &str = "24h";
/// Default window for `analyze_logs`.
pub const STATS_DEFAULT_RANGE: &str = "1h";
pub const ERRORS_DEFAULT_LIMIT: usize = 10;
pub const RECENT_DEFAULT_COUNT: usize = 10;
/// Records fetched when looking up a session id.
pub const SESSION_LOOKUP_RESULTS: usize = 3;
/// Marker message of the log line that carries a payment session id.
pub const SESSION_MARKER: &str = "callStartPayment";

// ============ Requests and Results ============

/// One log search as a caller expresses it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub query: String,
    #[serde(flatten)]
    pub time: TimeParams,
    pub levels: Vec<String>,
    pub include_fields: Vec<String>,
    pub exclude_fields: Vec<String>,
    pub max_results: Option<usize>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    /// Overrides the session's active index for this request only.
    pub index_pattern: Option<String>,
    /// Overrides `query.timeout_secs`.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub records: Vec<LogRecord>,
    pub total_hits: Option<u64>,
    /// False when the backend rejected the sort field and the records were
    /// fetched unsorted, or when no sort was requested.
    pub sort_applied: bool,
    pub index_pattern: String,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub fingerprint: Fingerprint,
    pub from_cache: bool,
    pub results: Arc<SearchResults>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryOutcome {
    pub analysis: MergedAnalysis,
    pub records_analyzed: usize,
    pub from_cache: bool,
    pub sort_applied: bool,
    pub index_pattern: String,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexListing {
    pub patterns: Arc<Vec<String>>,
    pub from_cache: bool,
}

/// Error-level records in a window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorQuery {
    #[serde(flatten)]
    pub time: TimeParams,
    pub include_stack_traces: bool,
    pub limit: Option<usize>,
    pub index_pattern: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for ErrorQuery {
    fn default() -> Self {
        Self {
            time: TimeParams::default(),
            include_stack_traces: true,
            limit: None,
            index_pattern: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub errors: Vec<ErrorEntry>,
    /// Backend hit count, or the number of errors returned if it sent none.
    pub total: u64,
    pub index_pattern: String,
    pub window: TimeWindow,
    pub from_cache: bool,
}

/// Field statistics over a window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsQuery {
    #[serde(flatten)]
    pub time: TimeParams,
    /// Field to count values of; `None` or blank skips grouping.
    pub group_by: Option<String>,
    pub index_pattern: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for StatsQuery {
    fn default() -> Self {
        Self {
            time: TimeParams::default(),
            group_by: Some("level".to_string()),
            index_pattern: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    #[serde(flatten)]
    pub stats: FieldStats,
    pub total_hits: Option<u64>,
    pub index_pattern: String,
    pub window: TimeWindow,
    pub from_cache: bool,
}

/// Most recent records, newest first.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecentQuery {
    pub count: Option<usize>,
    pub level: Option<String>,
    pub index_pattern: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentLogs {
    pub logs: Vec<RecentEntry>,
    pub index_pattern: String,
    pub window: TimeWindow,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionLookup {
    pub order_id: String,
    /// First session id found, if any record carried one.
    pub session_id: Option<String>,
    pub attempts: Vec<SessionAttempt>,
    pub from_cache: bool,
}

/// What the cache stores. Search results and index listings share one
/// cache and are kept apart by [`TtlClass`].
#[derive(Debug, Clone)]
enum Cached {
    Search(Arc<SearchResults>),
    Indexes(Arc<Vec<String>>),
}

// ============ Service ============

pub struct LogService<C: Connector> {
    config: Arc<Config>,
    pool: Arc<ConnectionPool<C>>,
    cache: FingerprintCache<Cached>,
    analyzer: Arc<dyn Analyzer>,
    session: Session,
}

impl LogService<KibanaConnector> {
    /// Build a service talking to the configured Kibana host.
    pub fn from_config(config: Config, session: Session) -> anyhow::Result<Self> {
        config.validate()?;
        let connector = KibanaConnector::new(&config.backend);
        let analyzer = create_analyzer(&config.analysis)?;
        Ok(Self::new(config, connector, analyzer, session))
    }
}

impl<C: Connector> LogService<C> {
    pub fn new(config: Config, connector: C, analyzer: Arc<dyn Analyzer>, session: Session) -> Self {
        let pool = Arc::new(ConnectionPool::new(connector, &config.pool));
        let cache = FingerprintCache::new(&config.cache);
        Self {
            config: Arc::new(config),
            pool,
            cache,
            analyzer,
            session,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Number of cached entries in `class`.
    pub fn cached_entries(&self, class: TtlClass) -> usize {
        self.cache.len(class)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Validate `request` and turn it into a canonical descriptor.
    ///
    /// Relative windows end at `now`, or at `now` rounded down to
    /// `query.relative_alignment_secs` when that is non-zero.
    pub fn build_descriptor(
        &self,
        request: &SearchRequest,
        now: DateTime<Utc>,
    ) -> Result<QueryDescriptor, QueryError> {
        let window = self.resolve_window(&request.time, &self.config.query.default_time_range, now)?;

        validate_query(&request.query)?;
        let levels = validate_levels(&request.levels)?;
        validate_fields("include_fields", &request.include_fields)?;
        validate_fields("exclude_fields", &request.exclude_fields)?;
        let max_results = self.result_limit("max_results", request.max_results)?;

        let order = match request.sort_order.as_deref().map(str::trim) {
            None | Some("") => SortOrder::default(),
            Some(raw) => SortOrder::parse(raw)
                .ok_or_else(|| QueryError::invalid("sort_order", raw, "expected 'asc' or 'desc'"))?,
        };
        if let Some(field) = request.sort_by.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
            validate_field("sort_by", field)?;
        }

        let index = self.resolve_index(request.index_pattern.as_deref())?;

        Ok(QueryDescriptor::new(index, window)
            .with_query(&request.query)
            .with_levels(levels)
            .with_include_fields(request.include_fields.iter().map(|f| f.trim()))
            .with_exclude_fields(request.exclude_fields.iter().map(|f| f.trim()))
            .with_max_results(max_results)
            .with_sort(request.sort_by.as_deref(), order))
    }

    fn resolve_window(
        &self,
        time: &TimeParams,
        default_range: &str,
        now: DateTime<Utc>,
    ) -> Result<TimeWindow, QueryError> {
        let resolved = resolve_time_params(time, default_range)?;
        debug!(source = ?resolved.source, filter = %resolved.filter, "time filter resolved");
        Ok(match resolved.filter {
            TimeFilter::Relative { .. } => {
                resolved.filter.resolve(align(now, self.config.query.relative_alignment_secs))
            }
            TimeFilter::Absolute { .. } => resolved.filter.resolve(now),
        })
    }

    /// Apply the configured default and cap to a requested result count.
    fn result_limit(&self, field: &'static str, requested: Option<usize>) -> Result<usize, QueryError> {
        let cap = self.config.query.max_results_cap;
        match requested {
            None => Ok(self.config.query.default_max_results.min(cap)),
            Some(0) => Err(QueryError::invalid(field, "0", "must be at least 1")),
            Some(n) if n > cap => {
                debug!(requested = n, cap, "{} capped", field);
                Ok(cap)
            }
            Some(n) => Ok(n),
        }
    }

    fn resolve_index(&self, requested: Option<&str>) -> Result<String, QueryError> {
        let index = match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(index) => index.to_string(),
            None => self.session.current_index().ok_or(QueryError::NoIndexSelected)?,
        };
        validate_index_pattern(&index)?;
        Ok(index)
    }

    /// Run a search, serving from cache when a fresh identical result
    /// exists.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome, QueryError> {
        let descriptor = self.build_descriptor(request, Utc::now())?;
        self.search_descriptor(&descriptor, self.deadline(request.timeout_secs))
            .await
    }

    /// Run an already-built descriptor through the cache. `deadline` bounds
    /// this caller's wait, whether it starts the fetch or joins one.
    pub async fn search_descriptor(
        &self,
        descriptor: &QueryDescriptor,
        deadline: Duration,
    ) -> Result<SearchOutcome, QueryError> {
        let fingerprint = descriptor.fingerprint();

        let (value, from_cache) = self
            .cache
            .get_or_fetch_within(descriptor, TtlClass::Search, deadline, |probe| {
                self.fetch_search(descriptor.clone(), deadline, probe)
            })
            .await?;

        let results = match value {
            Cached::Search(results) => results,
            Cached::Indexes(_) => {
                return Err(QueryError::Pool {
                    message: format!("cache entry {} holds an index listing", fingerprint.short()),
                });
            }
        };

        info!(
            index = %results.index_pattern,
            records = results.records.len(),
            from_cache,
            sort_applied = results.sort_applied,
            fingerprint = fingerprint.short(),
            "search complete"
        );

        Ok(SearchOutcome {
            fingerprint,
            from_cache,
            results,
        })
    }

    fn deadline(&self, timeout_secs: Option<u64>) -> Duration {
        timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.query.timeout())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.retry)
    }

    /// The shared fetch, bounded by the deadline of the caller that
    /// started it.
    fn fetch_search(
        &self,
        descriptor: QueryDescriptor,
        deadline: Duration,
        probe: StateProbe,
    ) -> impl Future<Output = Result<Cached, QueryError>> + Send + 'static {
        let pool = Arc::clone(&self.pool);
        let policy = self.retry_policy();

        async move {
            let mut controller = RetryController::with_probe(policy, probe.clone());

            let run = controller.run(&descriptor, |attempt: QueryDescriptor| {
                let pool = &pool;
                async move {
                    let conn = pool.acquire().await?;
                    let result = conn.search(&attempt).await;
                    if let Err(e) = &result {
                        if e.connection_fault {
                            conn.mark_broken();
                        }
                    }
                    result
                }
            });

            match tokio::time::timeout(deadline, run).await {
                Ok(Ok(outcome)) => Ok(Cached::Search(Arc::new(SearchResults {
                    records: outcome.value.records,
                    total_hits: outcome.value.total_hits,
                    sort_applied: outcome.sort_applied,
                    index_pattern: descriptor.index_pattern().to_string(),
                    window: descriptor.window(),
                }))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(QueryError::Timeout {
                    after: deadline,
                    state: probe.get(),
                }),
            }
        }
    }

    /// List the index patterns the backend knows about.
    pub async fn discover_indexes(&self) -> Result<IndexListing, QueryError> {
        let descriptor = SchemaDescriptor::index_patterns();
        let pool = Arc::clone(&self.pool);
        let policy = self.retry_policy();
        let deadline = self.config.query.timeout();

        let fetch = move |probe: StateProbe| async move {
            let mut controller = RetryController::with_probe(policy, probe.clone());
            let request = SchemaDescriptor::index_patterns();

            let run = controller.run(&request, |_: SchemaDescriptor| {
                let pool = &pool;
                async move {
                    let conn = pool.acquire().await?;
                    let result = conn.discover_indexes().await;
                    if let Err(e) = &result {
                        if e.connection_fault {
                            conn.mark_broken();
                        }
                    }
                    result
                }
            });

            match tokio::time::timeout(deadline, run).await {
                Ok(Ok(outcome)) => Ok(Cached::Indexes(Arc::new(outcome.value))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(QueryError::Timeout {
                    after: deadline,
                    state: probe.get(),
                }),
            }
        };

        let (value, from_cache) = self
            .cache
            .get_or_fetch_within(&descriptor, TtlClass::Schema, deadline, fetch)
            .await?;

        match value {
            Cached::Indexes(patterns) => {
                info!(count = patterns.len(), from_cache, "index patterns discovered");
                Ok(IndexListing {
                    patterns,
                    from_cache,
                })
            }
            Cached::Search(_) => Err(QueryError::Pool {
                message: "schema cache entry holds search results".to_string(),
            }),
        }
    }

    /// Switch the session's active index.
    ///
    /// Cached search results scoped to the previous index are dropped;
    /// returns how many were removed.
    pub fn set_current_index(&self, pattern: &str) -> Result<usize, QueryError> {
        let pattern = pattern.trim();
        validate_index_pattern(pattern)?;

        let previous = self.session.set_current_index(pattern);
        let removed = match previous.as_deref() {
            Some(prev) if prev != pattern => self.cache.invalidate_scope(prev, TtlClass::Search),
            _ => 0,
        };

        info!(
            previous = previous.as_deref().unwrap_or("<none>"),
            current = pattern,
            invalidated = removed,
            "active index changed"
        );
        Ok(removed)
    }

    /// Fetch logs for `request` and analyze them.
    ///
    /// In function mode the records are sorted ascending on the timestamp
    /// field unless the caller asked for another sort.
    pub async fn summarize(
        &self,
        request: &SearchRequest,
        function_mode: bool,
    ) -> Result<SummaryOutcome, QueryError> {
        let mut request = request.clone();
        if function_mode {
            let named = request
                .sort_by
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .is_some();
            if !named {
                request.sort_by = Some(self.config.backend.timestamp_field.clone());
                request.sort_order = Some(SortOrder::Asc.as_str().to_string());
            }
        }

        let descriptor = self.build_descriptor(&request, Utc::now())?;
        let outcome = self
            .search_descriptor(&descriptor, self.deadline(request.timeout_secs))
            .await?;
        let results = Arc::clone(&outcome.results);

        let analysis = if results.records.is_empty() {
            MergedAnalysis::single(AnalysisResult {
                summary: "No log records matched the query in the selected window.".to_string(),
                ..Default::default()
            })
        } else {
            self.analyze_records(&results.records, &descriptor, function_mode)
                .await?
        };

        if let Some(note) = analysis.skipped_note() {
            info!(note = %note, "summary is partial");
        }

        Ok(SummaryOutcome {
            analysis,
            records_analyzed: results.records.len(),
            from_cache: outcome.from_cache,
            sort_applied: results.sort_applied,
            index_pattern: results.index_pattern.clone(),
            window: results.window,
        })
    }

    async fn analyze_records(
        &self,
        records: &[LogRecord],
        descriptor: &QueryDescriptor,
        function_mode: bool,
    ) -> Result<MergedAnalysis, QueryError> {
        let options = ChunkOptions {
            threshold: self.config.analysis.chunk_threshold,
            max_concurrent: self.config.analysis.max_concurrent_chunks,
        };
        let per_chunk = Duration::from_secs(self.config.analysis.timeout_secs.max(1));
        let base = AnalysisContext {
            query: descriptor.query().to_string(),
            index_pattern: descriptor.index_pattern().to_string(),
            window: descriptor.window(),
            function_mode,
            chunk: ChunkContext { index: 0, total: 1 },
        };
        let analyzer = &self.analyzer;

        let merged = chunk::summarize(records, options, |ctx, slice| {
            let context = AnalysisContext {
                chunk: ctx,
                ..base.clone()
            };
            async move {
                match tokio::time::timeout(per_chunk, analyzer.analyze(slice, &context)).await {
                    Ok(result) => result,
                    Err(_) => Err(AnalysisError::new(format!(
                        "analysis timed out after {}s",
                        per_chunk.as_secs()
                    ))),
                }
            }
        })
        .await?;

        Ok(merged)
    }
}

// ============ Digests ============

impl<C: Connector> LogService<C> {
    /// Error, fatal and critical records in a window (default `24h`),
    /// newest first.
    pub async fn extract_errors(&self, query: &ErrorQuery) -> Result<ErrorReport, QueryError> {
        let window = self.resolve_window(&query.time, ERRORS_DEFAULT_RANGE, Utc::now())?;
        let limit = self.result_limit("limit", Some(query.limit.unwrap_or(ERRORS_DEFAULT_LIMIT)))?;
        let index = self.resolve_index(query.index_pattern.as_deref())?;

        let descriptor = QueryDescriptor::new(index, window)
            .with_levels(ERROR_LEVELS)
            .with_max_results(limit)
            .with_sort(Some(self.config.backend.timestamp_field.as_str()), SortOrder::Desc);
        let outcome = self
            .search_descriptor(&descriptor, self.deadline(query.timeout_secs))
            .await?;
        let results = &outcome.results;

        let errors = digest::error_entries(&results.records, query.include_stack_traces);
        info!(errors = errors.len(), index = %results.index_pattern, "errors extracted");
        Ok(ErrorReport {
            total: results.total_hits.unwrap_or(errors.len() as u64),
            errors,
            index_pattern: results.index_pattern.clone(),
            window: results.window,
            from_cache: outcome.from_cache,
        })
    }

    /// Count values of one field over a window (default `1h`) and report
    /// the error rate. Counts come from at most `query.max_results_cap`
    /// records.
    pub async fn analyze_logs(&self, query: &StatsQuery) -> Result<LogStats, QueryError> {
        let window = self.resolve_window(&query.time, STATS_DEFAULT_RANGE, Utc::now())?;
        let group_by = query
            .group_by
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty());
        if let Some(field) = group_by {
            validate_field("group_by", field)?;
        }
        let index = self.resolve_index(query.index_pattern.as_deref())?;

        let descriptor = QueryDescriptor::new(index, window)
            .with_max_results(self.config.query.max_results_cap);
        let outcome = self
            .search_descriptor(&descriptor, self.deadline(query.timeout_secs))
            .await?;
        let results = &outcome.results;

        let stats = digest::aggregate(&results.records, group_by);
        info!(
            records = stats.total_logs,
            groups = stats.groups.len(),
            error_rate = stats.error_rate,
            "log statistics computed"
        );
        Ok(LogStats {
            stats,
            total_hits: results.total_hits,
            index_pattern: results.index_pattern.clone(),
            window: results.window,
            from_cache: outcome.from_cache,
        })
    }

    /// The newest records in the default window, optionally at one level.
    pub async fn recent_logs(&self, query: &RecentQuery) -> Result<RecentLogs, QueryError> {
        let window = self.resolve_window(
            &TimeParams::default(),
            &self.config.query.default_time_range,
            Utc::now(),
        )?;
        let count = self.result_limit("count", Some(query.count.unwrap_or(RECENT_DEFAULT_COUNT)))?;
        let levels = validate_levels(&query.level.iter().cloned().collect::<Vec<_>>())?;
        let index = self.resolve_index(query.index_pattern.as_deref())?;

        let descriptor = QueryDescriptor::new(index, window)
            .with_levels(levels)
            .with_max_results(count)
            .with_sort(Some(self.config.backend.timestamp_field.as_str()), SortOrder::Desc);
        let outcome = self
            .search_descriptor(&descriptor, self.deadline(query.timeout_secs))
            .await?;

        Ok(RecentLogs {
            logs: digest::recent_entries(&outcome.results.records),
            index_pattern: outcome.results.index_pattern.clone(),
            window: outcome.results.window,
            from_cache: outcome.from_cache,
        })
    }

    /// Find the payment session id logged for `order_id`.
    ///
    /// Searches the default window for the order id together with the
    /// payment-start marker and reads the third ` | `-separated segment of
    /// each matching message. The first id found wins; every attempt is
    /// reported.
    pub async fn extract_session_id(
        &self,
        order_id: &str,
        index_pattern: Option<&str>,
    ) -> Result<SessionLookup, QueryError> {
        let order_id = order_id.trim();
        validate_order_id(order_id)?;
        let window = self.resolve_window(
            &TimeParams::default(),
            &self.config.query.default_time_range,
            Utc::now(),
        )?;
        let index = self.resolve_index(index_pattern)?;

        let descriptor = QueryDescriptor::new(index, window)
            .with_query(&format!("{} AND \"{}\"", order_id, SESSION_MARKER))
            .with_max_results(SESSION_LOOKUP_RESULTS);
        let outcome = self
            .search_descriptor(&descriptor, self.config.query.timeout())
            .await?;

        let attempts = digest::session_attempts(&outcome.results.records);
        let session_id = attempts.iter().find_map(|a| a.session_id.clone());
        match &session_id {
            Some(id) => info!(order_id, session_id = %id, "session id extracted"),
            None => info!(order_id, records = attempts.len(), "no session id found"),
        }

        Ok(SessionLookup {
            order_id: order_id.to_string(),
            session_id,
            attempts,
            from_cache: outcome.from_cache,
        })
    }
}

// ============ Validation ============

fn align(now: DateTime<Utc>, step_secs: u64) -> DateTime<Utc> {
    let Ok(step) = i64::try_from(step_secs) else {
        return now;
    };
    if step == 0 {
        return now;
    }
    let ts = now.timestamp();
    Utc.timestamp_opt(ts - ts.rem_euclid(step), 0)
        .single()
        .unwrap_or(now)
}

fn validate_query(query: &str) -> Result<(), QueryError> {
    let len = query.chars().count();
    if len > MAX_QUERY_LEN {
        return Err(QueryError::invalid(
            "query",
            format!("{}...", query.chars().take(40).collect::<String>()),
            format!("{} characters exceeds the limit of {}", len, MAX_QUERY_LEN),
        ));
    }
    Ok(())
}

fn validate_levels(levels: &[String]) -> Result<Vec<String>, QueryError> {
    levels
        .iter()
        .map(|l| l.trim().to_uppercase())
        .filter(|l| !l.is_empty())
        .map(|l| {
            if VALID_LEVELS.contains(&l.as_str()) {
                Ok(l)
            } else {
                Err(QueryError::invalid(
                    "levels",
                    l,
                    format!("expected one of {}", VALID_LEVELS.join(", ")),
                ))
            }
        })
        .collect()
}

fn validate_fields(name: &'static str, fields: &[String]) -> Result<(), QueryError> {
    for field in fields {
        validate_field(name, field.trim())?;
    }
    Ok(())
}

fn validate_field(name: &'static str, field: &str) -> Result<(), QueryError> {
    if field.is_empty() || field.len() > MAX_FIELD_LEN {
        return Err(QueryError::invalid(
            name,
            field,
            format!("field names must be 1-{} characters", MAX_FIELD_LEN),
        ));
    }
    if let Some(bad) = field
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-')))
    {
        return Err(QueryError::invalid(
            name,
            field,
            format!("character '{}' is not allowed", bad),
        ));
    }
    Ok(())
}

fn validate_index_pattern(pattern: &str) -> Result<(), QueryError> {
    if pattern.is_empty() {
        return Err(QueryError::invalid("index_pattern", pattern, "must not be empty"));
    }
    if pattern.chars().any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '/' | '#')) {
        return Err(QueryError::invalid(
            "index_pattern",
            pattern,
            "contains whitespace or a reserved character",
        ));
    }
    Ok(())
}

fn validate_order_id(order_id: &str) -> Result<(), QueryError> {
    if order_id.is_empty() {
        return Err(QueryError::invalid("order_id", order_id, "must not be empty"));
    }
    validate_field("order_id", order_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kibana_harness_core::time_filter::RawTimeFilter;

    use crate::analysis::HeuristicAnalyzer;
    use crate::backend::{BackendError, SearchPage};

    struct NullConnector;
    struct NullConnection;

    #[async_trait::async_trait]
    impl BackendConnection for NullConnection {
        async fn search(&self, _: &QueryDescriptor) -> Result<SearchPage, BackendError> {
            Ok(SearchPage {
                records: vec![],
                total_hits: Some(0),
            })
        }

        async fn discover_indexes(&self) -> Result<Vec<String>, BackendError> {
            Ok(vec![])
        }
    }

    #[async_trait::async_trait]
    impl Connector for NullConnector {
        type Conn = NullConnection;

        async fn connect(&self) -> Result<NullConnection, BackendError> {
            Ok(NullConnection)
        }
    }

    fn service(index: Option<&str>) -> LogService<NullConnector> {
        LogService::new(
            Config::for_host("kibana.test"),
            NullConnector,
            Arc::new(HeuristicAnalyzer),
            Session::new(index.map(str::to_string)),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 56).unwrap()
    }

    fn relative_24h() -> SearchRequest {
        SearchRequest {
            time: TimeParams {
                time_filter: Some(RawTimeFilter::Relative("24h".into())),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_relative_window_ends_at_now_by_default() {
        let svc = service(Some("logs-*"));
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 59).unwrap();

        let window = svc.build_descriptor(&relative_24h(), at).unwrap().window();
        assert_eq!(window.end, at);
        assert_eq!(window.start, at - chrono::Duration::hours(24));
    }

    #[test]
    fn test_relative_requests_share_fingerprint_within_alignment() {
        let mut config = Config::for_host("kibana.test");
        config.query.relative_alignment_secs = 60;
        let svc = LogService::new(
            config,
            NullConnector,
            Arc::new(HeuristicAnalyzer),
            Session::new(Some("logs-*".into())),
        );
        let req = relative_24h();

        let a = svc.build_descriptor(&req, now()).unwrap();
        let b = svc
            .build_descriptor(&req, now() + chrono::Duration::seconds(3))
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.window().end, Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 0).unwrap());
    }

    #[test]
    fn test_no_index_selected() {
        let svc = service(None);
        let err = svc
            .build_descriptor(&SearchRequest::default(), now())
            .unwrap_err();
        assert!(matches!(err, QueryError::NoIndexSelected));
    }

    #[test]
    fn test_request_index_overrides_session() {
        let svc = service(Some("logs-a-*"));
        let req = SearchRequest {
            index_pattern: Some("logs-b-*".into()),
            ..Default::default()
        };
        let d = svc.build_descriptor(&req, now()).unwrap();
        assert_eq!(d.index_pattern(), "logs-b-*");
    }

    #[test]
    fn test_invalid_level_rejected() {
        let svc = service(Some("logs-*"));
        let req = SearchRequest {
            levels: vec!["error".into(), "LOUD".into()],
            ..Default::default()
        };
        let err = svc.build_descriptor(&req, now()).unwrap_err();
        assert!(matches!(err, QueryError::InvalidRequest { field: "levels", .. }));
    }

    #[test]
    fn test_field_names_validated() {
        let svc = service(Some("logs-*"));
        let req = SearchRequest {
            include_fields: vec!["message; drop".into()],
            ..Default::default()
        };
        let err = svc.build_descriptor(&req, now()).unwrap_err();
        assert!(matches!(err, QueryError::InvalidRequest { field: "include_fields", .. }));
    }

    #[test]
    fn test_max_results_bounds() {
        let svc = service(Some("logs-*"));
        let zero = SearchRequest {
            max_results: Some(0),
            ..Default::default()
        };
        assert!(svc.build_descriptor(&zero, now()).is_err());

        let huge = SearchRequest {
            max_results: Some(1_000_000),
            ..Default::default()
        };
        let d = svc.build_descriptor(&huge, now()).unwrap();
        assert_eq!(d.max_results(), svc.config().query.max_results_cap);
    }

    #[test]
    fn test_bad_sort_order() {
        let svc = service(Some("logs-*"));
        let req = SearchRequest {
            sort_by: Some("@timestamp".into()),
            sort_order: Some("sideways".into()),
            ..Default::default()
        };
        let err = svc.build_descriptor(&req, now()).unwrap_err();
        assert!(matches!(err, QueryError::InvalidRequest { field: "sort_order", .. }));
    }

    #[test]
    fn test_oversized_query() {
        let svc = service(Some("logs-*"));
        let req = SearchRequest {
            query: "x".repeat(MAX_QUERY_LEN + 1),
            ..Default::default()
        };
        let err = svc.build_descriptor(&req, now()).unwrap_err();
        assert!(matches!(err, QueryError::InvalidRequest { field: "query", .. }));
    }

    #[test]
    fn test_align() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 56).unwrap();
        assert_eq!(align(t, 0), t);
        assert_eq!(align(t, 60), Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 0).unwrap());
        assert_eq!(align(t, 3600), Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_set_current_index_rejects_blank() {
        let svc = service(None);
        assert!(svc.set_current_index("   ").is_err());
        assert!(svc.session().current_index().is_none());
    }

    #[test]
    fn test_order_id_validated() {
        assert!(validate_order_id("ORD-2024-0001").is_ok());
        assert!(validate_order_id("").is_err());
        assert!(validate_order_id("1 OR *").is_err());
    }
}
