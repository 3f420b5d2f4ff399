//! Search backend collaborator and the Kibana HTTP adapter.
//!
//! The orchestration layer only needs two things from a backend:
//! a [`BackendConnection`] that can run a [`QueryDescriptor`] and list index
//! patterns, and a [`Connector`] that opens such connections for the pool.
//! Failures are reported as a [`BackendError`] carrying one of four kinds:
//!
//! | Kind | Raised for | Handling |
//! |------|-----------|----------|
//! | `Schema` | 400 with an unmapped sort field | one retry without sort |
//! | `Auth` | 401 / 403, missing token | surfaced immediately |
//! | `Transient` | 408, 429, 5xx, connect / timeout / reset, truncated or garbled body | bounded backoff retry |
//! | `Other` | any other status | surfaced immediately |
//!
//! Transport failures, including a body cut off mid-read or a success
//! response whose body is not JSON, also set
//! [`BackendError::connection_fault`] so the pool evicts the connection.
//!
//! # Kibana wire format
//!
//! Searches go to `POST https://{host}{base_path}/internal/search/es` with a
//! `kbn-version` header and the `_pomerium` auth cookie:
//!
//! ```json
//! {
//!   "params": {
//!     "index": "logs-app*",
//!     "body": {
//!       "query": { "bool": { "must": [ ... ] } },
//!       "size": 100,
//!       "sort": [ { "@timestamp": { "order": "desc" } } ],
//!       "_source": { "includes": [ ... ], "excludes": [ ... ] }
//!     }
//!   }
//! }
//! ```
//!
//! Responses may be wrapped in `rawResponse`; both shapes are accepted.
//!
//! # Multiplexing
//!
//! Each [`KibanaConnection`] owns one `reqwest::Client`. Concurrent requests
//! share a single socket only once HTTP/2 has been negotiated; over
//! HTTP/1.1 the client would open a socket per request. Until a response
//! arrives over HTTP/2 the connection reports a
//! [`stream_capacity`](BackendConnection::stream_capacity) of one, so the
//! pool's `max_connections` stays a bound on sockets.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kibana_harness_core::descriptor::QueryDescriptor;
use kibana_harness_core::models::{LogRecord, TIMESTAMP_FIELDS};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::BackendConfig;

// ============ Collaborator interface ============

/// One page of search results.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub records: Vec<LogRecord>,
    /// Total matching documents reported by the backend, if any.
    pub total_hits: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    Schema,
    Auth,
    Transient,
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Schema => "schema",
            Self::Auth => "auth",
            Self::Transient => "transient",
            Self::Other => "other",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} backend error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// The underlying transport failed; the connection must not be reused.
    pub connection_fault: bool,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            connection_fault: false,
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Schema, Some(400), message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Auth, None, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transient, None, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Other, None, message)
    }

    /// Transport-level failure such as a reset or refused connection.
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            connection_fault: true,
            ..Self::transient(message)
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        Self::new(classify_status(status, body), Some(status), truncate(body, 500))
    }

    /// Field name named by a schema error, e.g. `No mapping found for [ts]`.
    pub fn schema_field(&self) -> Option<&str> {
        let start = self.message.find("No mapping found for [")? + "No mapping found for [".len();
        let len = self.message[start..].find(']')?;
        Some(&self.message[start..start + len])
    }
}

/// Map an HTTP status and body to an error kind.
pub fn classify_status(status: u16, body: &str) -> BackendErrorKind {
    match status {
        401 | 403 => BackendErrorKind::Auth,
        400 if is_sort_mapping_error(body) => BackendErrorKind::Schema,
        408 | 429 | 500..=599 => BackendErrorKind::Transient,
        _ => BackendErrorKind::Other,
    }
}

fn is_sort_mapping_error(body: &str) -> bool {
    (body.contains("No mapping found for") && body.contains("in order to sort on"))
        || (body.contains("unknown field") && body.contains("sort"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// A live connection to the search backend.
///
/// Implementations must allow several concurrent calls on one connection.
#[async_trait]
pub trait BackendConnection: Send + Sync + 'static {
    /// Run a search. The sort clause is sent only if the descriptor has one.
    async fn search(&self, descriptor: &QueryDescriptor) -> Result<SearchPage, BackendError>;

    /// List index patterns available for searching.
    async fn discover_indexes(&self) -> Result<Vec<String>, BackendError>;

    /// Concurrent requests this connection can carry right now, when it is
    /// lower than the pool's configured stream count.
    fn stream_capacity(&self) -> Option<usize> {
        None
    }
}

/// Opens new [`BackendConnection`]s for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: BackendConnection;

    async fn connect(&self) -> Result<Self::Conn, BackendError>;
}

// ============ Kibana adapter ============

/// Opens HTTP connections to a Kibana instance.
pub struct KibanaConnector {
    config: BackendConfig,
    auth_token: Option<String>,
}

impl KibanaConnector {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            auth_token: config.resolved_auth_token(),
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Connector for KibanaConnector {
    type Conn = KibanaConnection;

    async fn connect(&self) -> Result<KibanaConnection, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(self.config.request_timeout())
            .connect_timeout(self.config.connect_timeout())
            .pool_max_idle_per_host(1)
            .danger_accept_invalid_certs(!self.config.verify_ssl)
            .build()
            .map_err(|e| BackendError::other(format!("failed to build HTTP client: {}", e)))?;

        debug!(host = %self.config.host, "opened Kibana connection");

        Ok(KibanaConnection {
            client,
            host: self.config.host.clone(),
            base_path: self.config.base_path.trim_end_matches('/').to_string(),
            kibana_version: self.config.kibana_version.clone(),
            auth_cookie: self.auth_token.as_ref().map(|t| format!("_pomerium={}", t)),
            timestamp_field: self.config.timestamp_field.clone(),
            http2: AtomicBool::new(false),
        })
    }
}

/// One HTTP client bound to a single keep-alive connection. Requests are
/// multiplexed over it when the server speaks HTTP/2.
pub struct KibanaConnection {
    client: reqwest::Client,
    host: String,
    base_path: String,
    kibana_version: String,
    auth_cookie: Option<String>,
    timestamp_field: String,
    /// Set once a response has come back over HTTP/2.
    http2: AtomicBool,
}

impl KibanaConnection {
    fn cookie(&self) -> Result<&str, BackendError> {
        self.auth_cookie.as_deref().ok_or_else(|| {
            BackendError::auth("no Kibana auth token configured; set backend.auth_token or KIBANA_AUTH_TOKEN")
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value, BackendError> {
        let response = self
            .client
            .get(url)
            .header("kbn-version", &self.kibana_version)
            .header("Content-Type", "application/json")
            .header("Cookie", self.cookie()?)
            .send()
            .await
            .map_err(from_reqwest)?;
        self.note_version(&response);
        read_json(response).await
    }

    fn note_version(&self, response: &reqwest::Response) {
        if response.version() == reqwest::Version::HTTP_2 && !self.http2.swap(true, Ordering::AcqRel) {
            debug!(host = %self.host, "HTTP/2 negotiated; connection is multiplexed");
        }
    }

    async fn saved_index_patterns(&self) -> Result<Vec<String>, BackendError> {
        let url = format!(
            "https://{}{}/api/saved_objects/_find?type=index-pattern",
            self.host, self.base_path
        );
        let json = self.get_json(&url).await?;
        Ok(parse_saved_objects(&json))
    }

    async fn cat_index_patterns(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("https://{}/_cat/indices?format=json", self.host);
        let json = self.get_json(&url).await?;
        Ok(derive_index_patterns(&json))
    }
}

#[async_trait]
impl BackendConnection for KibanaConnection {
    async fn search(&self, descriptor: &QueryDescriptor) -> Result<SearchPage, BackendError> {
        let url = format!("https://{}{}/internal/search/es", self.host, self.base_path);
        let payload = json!({
            "params": {
                "index": descriptor.index_pattern(),
                "body": build_search_body(descriptor, &self.timestamp_field),
            }
        });

        debug!(
            index = descriptor.index_pattern(),
            size = descriptor.max_results(),
            sorted = descriptor.sort().is_some(),
            "Kibana search"
        );

        let response = self
            .client
            .post(&url)
            .header("kbn-version", &self.kibana_version)
            .header("Content-Type", "application/json")
            .header("Cookie", self.cookie()?)
            .json(&payload)
            .send()
            .await
            .map_err(from_reqwest)?;
        self.note_version(&response);

        let json = read_json(response).await?;
        parse_search_response(&json)
    }

    async fn discover_indexes(&self) -> Result<Vec<String>, BackendError> {
        let saved_err = match self.saved_index_patterns().await {
            Ok(patterns) if !patterns.is_empty() => return Ok(patterns),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "saved-objects index lookup failed; falling back to _cat/indices");
                Some(e)
            }
        };

        match self.cat_index_patterns().await {
            Ok(patterns) => Ok(patterns),
            Err(e) => match saved_err {
                Some(first) if first.kind == BackendErrorKind::Auth => Err(first),
                _ => Err(e),
            },
        }
    }

    fn stream_capacity(&self) -> Option<usize> {
        if self.http2.load(Ordering::Acquire) {
            None
        } else {
            Some(1)
        }
    }
}

fn from_reqwest(e: reqwest::Error) -> BackendError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        BackendError::connection(e.to_string())
    } else {
        BackendError::other(e.to_string())
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, BackendError> {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(from_reqwest)?;
    parse_body(status, &body)
}

/// Classify a status and decode a success body.
///
/// A success response that is not JSON counts as a protocol violation:
/// transient, and the connection is faulty.
pub fn parse_body(status: u16, body: &str) -> Result<Value, BackendError> {
    if !(200..300).contains(&status) {
        return Err(BackendError::from_status(status, body));
    }
    serde_json::from_str(body)
        .map_err(|e| BackendError::connection(format!("invalid JSON from backend: {}", e)))
}

// ============ Query DSL ============

/// Build the Elasticsearch request body for a descriptor.
pub fn build_search_body(descriptor: &QueryDescriptor, timestamp_field: &str) -> Value {
    let mut must = Vec::new();

    if !descriptor.query().is_empty() {
        must.push(json!({ "query_string": { "query": descriptor.query() } }));
    }

    let window = descriptor.window();
    let range = json!({
        "gte": window.start.to_rfc3339(),
        "lte": window.end.to_rfc3339(),
    });
    let mut fields = vec![timestamp_field];
    fields.extend(TIMESTAMP_FIELDS.iter().filter(|f| **f != timestamp_field));
    let should: Vec<Value> = fields
        .iter()
        .map(|f| json!({ "range": { *f: range.clone() } }))
        .collect();
    must.push(json!({ "bool": { "should": should, "minimum_should_match": 1 } }));

    if !descriptor.levels().is_empty() {
        must.push(json!({ "terms": { "level": descriptor.levels() } }));
    }

    let mut body = json!({
        "query": { "bool": { "must": must } },
        "size": descriptor.max_results(),
    });

    if let Some(sort) = descriptor.sort() {
        body["sort"] = json!([{ sort.field.as_str(): { "order": sort.order.as_str() } }]);
    }

    if !descriptor.include_fields().is_empty() || !descriptor.exclude_fields().is_empty() {
        let mut source = serde_json::Map::new();
        if !descriptor.include_fields().is_empty() {
            source.insert("includes".into(), json!(descriptor.include_fields()));
        }
        if !descriptor.exclude_fields().is_empty() {
            source.insert("excludes".into(), json!(descriptor.exclude_fields()));
        }
        body["_source"] = Value::Object(source);
    }

    body
}

/// Extract records and hit count, unwrapping `rawResponse` if present.
pub fn parse_search_response(json: &Value) -> Result<SearchPage, BackendError> {
    let result = json.get("rawResponse").unwrap_or(json);

    let hits = result
        .get("hits")
        .ok_or_else(|| BackendError::other("invalid search response: missing hits"))?;

    let records = hits
        .get("hits")
        .and_then(Value::as_array)
        .map(|docs| {
            docs.iter()
                .filter_map(|doc| doc.get("_source").cloned())
                .map(LogRecord::new)
                .collect()
        })
        .unwrap_or_default();

    let total_hits = match hits.get("total") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(obj) => obj.get("value").and_then(Value::as_u64),
        None => None,
    };

    Ok(SearchPage {
        records,
        total_hits,
    })
}

fn parse_saved_objects(json: &Value) -> Vec<String> {
    json.get("saved_objects")
        .and_then(Value::as_array)
        .map(|objs| {
            objs.iter()
                .filter_map(|o| o.pointer("/attributes/title").and_then(Value::as_str))
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Collapse concrete index names into `first-second*` patterns.
fn derive_index_patterns(json: &Value) -> Vec<String> {
    let mut patterns: Vec<String> = json
        .as_array()
        .map(|indices| {
            indices
                .iter()
                .filter_map(|i| i.get("index").and_then(Value::as_str))
                .filter_map(|name| {
                    let parts: Vec<&str> = name.split('-').collect();
                    (parts.len() >= 2).then(|| format!("{}*", parts[..2].join("-")))
                })
                .collect()
        })
        .unwrap_or_default();
    patterns.sort();
    patterns.dedup();
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kibana_harness_core::descriptor::SortOrder;
    use kibana_harness_core::time_filter::TimeWindow;

    fn descriptor() -> QueryDescriptor {
        QueryDescriptor::new(
            "logs-app*",
            TimeWindow {
                start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            },
        )
        .with_query("status:500")
        .with_levels(["error"])
        .with_max_results(50)
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(401, ""), BackendErrorKind::Auth);
        assert_eq!(classify_status(403, ""), BackendErrorKind::Auth);
        assert_eq!(
            classify_status(400, "No mapping found for [ts] in order to sort on"),
            BackendErrorKind::Schema
        );
        assert_eq!(classify_status(400, "parse_exception"), BackendErrorKind::Other);
        for s in [408, 429, 500, 502, 503, 504] {
            assert_eq!(classify_status(s, ""), BackendErrorKind::Transient);
        }
        assert_eq!(classify_status(404, ""), BackendErrorKind::Other);
    }

    #[test]
    fn test_schema_field_extracted() {
        let err = BackendError::from_status(400, "No mapping found for [start_ts] in order to sort on");
        assert_eq!(err.kind, BackendErrorKind::Schema);
        assert_eq!(err.schema_field(), Some("start_ts"));
        assert_eq!(BackendError::other("x").schema_field(), None);
    }

    #[test]
    fn test_body_without_sort() {
        let body = build_search_body(&descriptor(), "@timestamp");
        assert!(body.get("sort").is_none());
        assert!(body.get("_source").is_none());
        assert_eq!(body["size"], 50);

        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must[0]["query_string"]["query"], "status:500");
        let should = must[1]["bool"]["should"].as_array().unwrap();
        assert_eq!(should.len(), TIMESTAMP_FIELDS.len());
        assert_eq!(
            should[0]["range"]["@timestamp"]["gte"],
            "2024-01-01T00:00:00+00:00"
        );
        assert_eq!(must[2]["terms"]["level"][0], "ERROR");
    }

    #[test]
    fn test_body_with_sort_and_source() {
        let d = descriptor()
            .with_sort(Some("@timestamp"), SortOrder::Asc)
            .with_include_fields(["message"])
            .with_exclude_fields(["stack"]);
        let body = build_search_body(&d, "ts");
        assert_eq!(body["sort"][0]["@timestamp"]["order"], "asc");
        assert_eq!(body["_source"]["includes"][0], "message");
        assert_eq!(body["_source"]["excludes"][0], "stack");

        let should = body["query"]["bool"]["must"][1]["bool"]["should"].as_array().unwrap();
        assert!(should[0]["range"].get("ts").is_some());
        assert_eq!(should.len(), TIMESTAMP_FIELDS.len() + 1);
    }

    #[test]
    fn test_empty_query_skips_query_string() {
        let d = QueryDescriptor::new("x*", descriptor().window());
        let body = build_search_body(&d, "@timestamp");
        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 1);
        assert!(must[0].get("bool").is_some());
    }

    #[test]
    fn test_parse_raw_response_wrapped() {
        let json = json!({
            "rawResponse": {
                "hits": {
                    "total": { "value": 42, "relation": "eq" },
                    "hits": [
                        { "_source": { "message": "a" } },
                        { "_source": { "message": "b" } }
                    ]
                }
            }
        });
        let page = parse_search_response(&json).unwrap();
        assert_eq!(page.total_hits, Some(42));
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[1].message(), Some("b"));
    }

    #[test]
    fn test_parse_plain_response_integer_total() {
        let json = json!({ "hits": { "total": 7, "hits": [] } });
        let page = parse_search_response(&json).unwrap();
        assert_eq!(page.total_hits, Some(7));
        assert!(page.records.is_empty());

        assert!(parse_search_response(&json!({ "error": "x" })).is_err());
    }

    #[test]
    fn test_index_pattern_discovery_parsing() {
        let saved = json!({ "saved_objects": [
            { "attributes": { "title": "breeze-v2*" } },
            { "attributes": { "title": "" } },
            { "attributes": {} }
        ]});
        assert_eq!(parse_saved_objects(&saved), vec!["breeze-v2*"]);

        let cat = json!([
            { "index": "istio-logs-2024.01.01" },
            { "index": "istio-logs-2024.01.02" },
            { "index": "breeze-v2-2023-01-01" },
            { "index": "single" }
        ]);
        assert_eq!(derive_index_patterns(&cat), vec!["breeze-v2*", "istio-logs*"]);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "é".repeat(10);
        let t = truncate(&s, 5);
        assert!(t.ends_with('…'));
    }

    #[test]
    fn test_garbled_success_body_is_connection_fault() {
        let err = parse_body(200, "{\"hits\": {\"hi").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Transient);
        assert!(err.connection_fault);

        let err = parse_body(503, "busy").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Transient);
        assert!(!err.connection_fault);

        assert_eq!(parse_body(200, "{\"ok\": true}").unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_body_cut_mid_read_is_connection_fault() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 512\r\n\r\n{\"hits\":",
                )
                .await
                .unwrap();
        });

        let response = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        assert_eq!(response.version(), reqwest::Version::HTTP_11);
        let err = read_json(response).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Transient);
        assert!(err.connection_fault);
    }
}
