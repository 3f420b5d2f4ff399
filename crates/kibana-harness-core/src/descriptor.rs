//! Canonical query descriptors and their fingerprints.
//!
//! A [`QueryDescriptor`] records every parameter that affects what the
//! backend returns. It is normalized at construction time so that two
//! requests which would produce the same backend call compare equal and
//! hash to the same [`Fingerprint`]:
//!
//! | Field | Normalization |
//! |-------|---------------|
//! | query text | trimmed, internal whitespace runs collapsed to one space |
//! | levels | upper-cased, sorted, de-duplicated |
//! | include / exclude fields | trimmed, sorted, de-duplicated |
//! | sort | dropped entirely when no sort field is given |
//! | window | UTC instants, millisecond precision |
//!
//! The canonical form is a JSON object with sorted keys; its SHA-256 hex
//! digest is the fingerprint.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::time_filter::TimeWindow;

/// Hex SHA-256 digest of a canonical descriptor. Used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest an already-canonical string.
    pub fn of(canonical: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Anything that can be cached under a fingerprint.
pub trait Canonical {
    /// Stable, order-independent representation. Keys are sorted.
    fn canonical_form(&self) -> BTreeMap<&'static str, Value>;

    /// Index pattern the result depends on, if any. Used for scoped
    /// invalidation when the active index changes.
    fn scope(&self) -> Option<&str>;

    fn canonical_string(&self) -> String {
        let object: serde_json::Map<String, Value> = self
            .canonical_form()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Value::Object(object).to_string()
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.canonical_string())
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// Case-insensitive parse of `asc` / `desc`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Requested sort clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

/// Normalized description of a search request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueryDescriptor {
    query: String,
    window: TimeWindow,
    levels: Vec<String>,
    include_fields: Vec<String>,
    exclude_fields: Vec<String>,
    max_results: usize,
    sort: Option<SortSpec>,
    index_pattern: String,
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn sorted_set<I, S, F>(items: I, f: F) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: Fn(&str) -> String,
{
    items
        .into_iter()
        .map(|s| f(s.as_ref().trim()))
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl QueryDescriptor {
    /// Start a descriptor for `index_pattern` over `window` with no query
    /// text, no filters, no sort and a single result.
    pub fn new(index_pattern: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            query: String::new(),
            window,
            levels: Vec::new(),
            include_fields: Vec::new(),
            exclude_fields: Vec::new(),
            max_results: 1,
            sort: None,
            index_pattern: index_pattern.into().trim().to_string(),
        }
    }

    pub fn with_query(mut self, text: &str) -> Self {
        self.query = collapse_whitespace(text);
        self
    }

    pub fn with_levels<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.levels = sorted_set(levels, |s| s.to_ascii_uppercase());
        self
    }

    pub fn with_include_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.include_fields = sorted_set(fields, str::to_string);
        self
    }

    pub fn with_exclude_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exclude_fields = sorted_set(fields, str::to_string);
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    /// Set the sort clause. A blank field clears it.
    pub fn with_sort(mut self, field: Option<&str>, order: SortOrder) -> Self {
        self.sort = field
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(|f| SortSpec {
                field: f.to_string(),
                order,
            });
        self
    }

    /// Same request with the sort clause removed.
    pub fn without_sort(&self) -> Self {
        Self {
            sort: None,
            ..self.clone()
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn include_fields(&self) -> &[String] {
        &self.include_fields
    }

    pub fn exclude_fields(&self) -> &[String] {
        &self.exclude_fields
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    pub fn sort(&self) -> Option<&SortSpec> {
        self.sort.as_ref()
    }

    pub fn index_pattern(&self) -> &str {
        &self.index_pattern
    }
}

fn millis(dt: chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Canonical for QueryDescriptor {
    fn canonical_form(&self) -> BTreeMap<&'static str, Value> {
        let mut form = BTreeMap::new();
        form.insert("kind", Value::from("search"));
        form.insert("query", Value::from(self.query.clone()));
        form.insert("start", Value::from(millis(self.window.start)));
        form.insert("end", Value::from(millis(self.window.end)));
        form.insert("levels", Value::from(self.levels.clone()));
        form.insert("include_fields", Value::from(self.include_fields.clone()));
        form.insert("exclude_fields", Value::from(self.exclude_fields.clone()));
        form.insert("max_results", Value::from(self.max_results));
        form.insert("index_pattern", Value::from(self.index_pattern.clone()));
        match &self.sort {
            Some(sort) => {
                form.insert("sort_field", Value::from(sort.field.clone()));
                form.insert("sort_order", Value::from(sort.order.as_str()));
            }
            None => {
                form.insert("sort_field", Value::Null);
                form.insert("sort_order", Value::Null);
            }
        }
        form
    }

    fn scope(&self) -> Option<&str> {
        Some(&self.index_pattern)
    }
}

/// Descriptor for metadata lookups cached under the schema TTL class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaDescriptor {
    resource: &'static str,
    index_pattern: Option<String>,
}

impl SchemaDescriptor {
    /// The list of index patterns available on the backend.
    pub fn index_patterns() -> Self {
        Self {
            resource: "index_patterns",
            index_pattern: None,
        }
    }

    pub fn resource(&self) -> &str {
        self.resource
    }
}

impl Canonical for SchemaDescriptor {
    fn canonical_form(&self) -> BTreeMap<&'static str, Value> {
        let mut form = BTreeMap::new();
        form.insert("kind", Value::from("schema"));
        form.insert("resource", Value::from(self.resource));
        form.insert(
            "index_pattern",
            self.index_pattern.clone().map(Value::from).unwrap_or(Value::Null),
        );
        form
    }

    fn scope(&self) -> Option<&str> {
        self.index_pattern.as_deref()
    }
}
