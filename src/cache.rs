//! Fingerprint-keyed TTL cache with single-flight fetches.
//!
//! Entries are keyed by the [`Fingerprint`] of a [`Canonical`] descriptor and
//! live in one of two TTL classes with independent lifetimes and size
//! bounds:
//!
//! | Class | Default TTL | Default bound | Holds |
//! |-------|-------------|---------------|-------|
//! | [`TtlClass::Schema`] | 1 h | 100 | index lists and other metadata |
//! | [`TtlClass::Search`] | 5 min | 1000 | search results |
//!
//! # Single flight
//!
//! On a miss, the first caller registers an in-flight entry holding a
//! shared future and runs the fetch through it. Concurrent callers for the
//! same fingerprint join that future instead of fetching again, so the
//! backend sees at most one concurrent fetch per fingerprint. The shared
//! future stores a successful value and removes its own in-flight entry
//! when it completes. A failure is returned to every caller and is not
//! cached; joiners see it wrapped in [`QueryError::CacheStampedeFailure`].
//!
//! The fetch keeps running as long as any caller is still waiting, so a
//! cancelled owner does not fail the others. When the last waiter goes
//! away the in-flight entry is dropped and the fetch is cancelled.
//! [`FingerprintCache::get_or_fetch_within`] bounds one caller's wait
//! without touching the fetch the other callers share; the timeout it
//! returns reports the retry state the shared fetch had reached.
//!
//! # Invalidation
//!
//! Each `(class, scope)` pair has a generation counter that
//! [`FingerprintCache::invalidate_scope`] bumps. A fetch remembers the
//! generation it started under and does not store its result if the scope
//! was invalidated while it ran.
//!
//! # Expiry
//!
//! Expired entries are removed lazily: on lookup of the expired key, and by
//! a sweep of the class on every insert. When a class is full, its oldest
//! entry is evicted.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use kibana_harness_core::descriptor::{Canonical, Fingerprint};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::QueryError;
use crate::retry::StateProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlClass {
    Schema,
    Search,
}

impl std::fmt::Display for TtlClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Schema => "schema",
            Self::Search => "search",
        })
    }
}

/// A cached value and the metadata needed to expire or invalidate it.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub ttl_class: TtlClass,
    /// Index pattern the value depends on.
    pub scope: Option<String>,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() < ttl
    }
}

struct ClassStore<V> {
    class: TtlClass,
    ttl: Duration,
    max_entries: usize,
    entries: DashMap<Fingerprint, CacheEntry<V>>,
}

impl<V: Clone> ClassStore<V> {
    fn new(class: TtlClass, ttl: Duration, max_entries: usize) -> Self {
        Self {
            class,
            ttl,
            max_entries: max_entries.max(1),
            entries: DashMap::new(),
        }
    }

    fn get_fresh(&self, fp: &Fingerprint) -> Option<V> {
        let expired = match self.entries.get(fp) {
            Some(entry) if entry.is_fresh(self.ttl) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(fp, |_, e| !e.is_fresh(self.ttl));
            debug!(class = %self.class, fingerprint = fp.short(), "expired cache entry removed");
        }
        None
    }

    fn insert(&self, fp: Fingerprint, value: V, scope: Option<String>) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.is_fresh(ttl));

        while self.entries.len() >= self.max_entries && !self.entries.contains_key(&fp) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.created_at)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    debug!(class = %self.class, fingerprint = key.short(), "evicted oldest cache entry");
                }
                None => break,
            }
        }

        self.entries.insert(
            fp,
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl_class: self.class,
                scope,
            },
        );
    }

    fn invalidate_scope(&self, scope: &str) -> usize {
        let keys: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|e| e.scope.as_deref() == Some(scope))
            .map(|e| e.key().clone())
            .collect();
        keys.iter()
            .filter(|k| {
                self.entries
                    .remove_if(*k, |_, e| e.scope.as_deref() == Some(scope))
                    .is_some()
            })
            .count()
    }
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, QueryError>>>;

/// Marker for a fetch in progress, shared by every caller waiting on it.
struct InFlight<V> {
    id: u64,
    future: SharedFetch<V>,
    waiters: Arc<AtomicUsize>,
    probe: StateProbe,
}

struct Inner<V> {
    schema: ClassStore<V>,
    search: ClassStore<V>,
    inflight: DashMap<Fingerprint, InFlight<V>>,
    generations: DashMap<(TtlClass, String), u64>,
    next_id: AtomicU64,
}

impl<V: Clone> Inner<V> {
    fn store(&self, class: TtlClass) -> &ClassStore<V> {
        match class {
            TtlClass::Schema => &self.schema,
            TtlClass::Search => &self.search,
        }
    }

    fn generation(&self, class: TtlClass, scope: Option<&str>) -> u64 {
        scope
            .and_then(|s| self.generations.get(&(class, s.to_string())).map(|g| *g))
            .unwrap_or(0)
    }

    fn bump_generation(&self, class: TtlClass, scope: &str) {
        *self
            .generations
            .entry((class, scope.to_string()))
            .or_insert(0) += 1;
    }
}

/// Releases one waiter's claim on an in-flight fetch.
struct WaiterGuard<'a, V> {
    inflight: &'a DashMap<Fingerprint, InFlight<V>>,
    fingerprint: &'a Fingerprint,
    id: u64,
    waiters: Arc<AtomicUsize>,
}

impl<V> Drop for WaiterGuard<'_, V> {
    fn drop(&mut self) {
        if self.waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
            let id = self.id;
            self.inflight.remove_if(self.fingerprint, |_, f| {
                f.id == id && f.waiters.load(Ordering::Acquire) == 0
            });
        }
    }
}

/// Process-wide result cache. Cheap to clone.
pub struct FingerprintCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for FingerprintCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> FingerprintCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                schema: ClassStore::new(
                    TtlClass::Schema,
                    Duration::from_secs(config.schema_ttl_secs),
                    config.schema_max_entries,
                ),
                search: ClassStore::new(
                    TtlClass::Search,
                    Duration::from_secs(config.search_ttl_secs),
                    config.search_max_entries,
                ),
                inflight: DashMap::new(),
                generations: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Return the cached value for `descriptor`, or fetch it.
    ///
    /// `fetch` is only called when this caller starts a new fetch. It
    /// receives the [`StateProbe`] that joiners read when their deadline passes.
    /// The boolean is `true` when the value came from a fresh cache entry.
    pub async fn get_or_fetch<D, F, Fut>(
        &self,
        descriptor: &D,
        class: TtlClass,
        fetch: F,
    ) -> Result<(V, bool), QueryError>
    where
        D: Canonical + ?Sized,
        F: FnOnce(StateProbe) -> Fut,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        self.lookup(descriptor, class, None, fetch).await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), but this caller gives up
    /// after `deadline` with [`QueryError::Timeout`]. A shared fetch keeps
    /// running for the callers still waiting on it.
    pub async fn get_or_fetch_within<D, F, Fut>(
        &self,
        descriptor: &D,
        class: TtlClass,
        deadline: Duration,
        fetch: F,
    ) -> Result<(V, bool), QueryError>
    where
        D: Canonical + ?Sized,
        F: FnOnce(StateProbe) -> Fut,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        self.lookup(descriptor, class, Some(deadline), fetch).await
    }

    async fn lookup<D, F, Fut>(
        &self,
        descriptor: &D,
        class: TtlClass,
        deadline: Option<Duration>,
        fetch: F,
    ) -> Result<(V, bool), QueryError>
    where
        D: Canonical + ?Sized,
        F: FnOnce(StateProbe) -> Fut,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let fingerprint = descriptor.fingerprint();
        let store = self.inner.store(class);

        if let Some(value) = store.get_fresh(&fingerprint) {
            debug!(class = %class, fingerprint = fingerprint.short(), "cache hit");
            return Ok((value, true));
        }

        let (future, waiters, probe, id, owner) = match self.inner.inflight.entry(fingerprint.clone()) {
            Entry::Occupied(e) => {
                let flight = e.get();
                flight.waiters.fetch_add(1, Ordering::AcqRel);
                debug!(class = %class, fingerprint = fingerprint.short(), "joining in-flight fetch");
                (
                    flight.future.clone(),
                    Arc::clone(&flight.waiters),
                    flight.probe.clone(),
                    flight.id,
                    false,
                )
            }
            Entry::Vacant(e) => {
                // A fetch may have completed between the first check and
                // taking the entry lock.
                if let Some(value) = store.get_fresh(&fingerprint) {
                    return Ok((value, true));
                }

                debug!(class = %class, fingerprint = fingerprint.short(), "cache miss; fetching");
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let probe = StateProbe::default();
                let future = self.shared_fetch(
                    fetch(probe.clone()),
                    fingerprint.clone(),
                    class,
                    descriptor.scope().map(str::to_string),
                    id,
                );
                let waiters = Arc::new(AtomicUsize::new(1));
                e.insert(InFlight {
                    id,
                    future: future.clone(),
                    waiters: Arc::clone(&waiters),
                    probe: probe.clone(),
                });
                (future, waiters, probe, id, true)
            }
        };

        let _guard = WaiterGuard {
            inflight: &self.inner.inflight,
            fingerprint: &fingerprint,
            id,
            waiters,
        };

        let result = match deadline {
            None => future.await,
            Some(after) => match tokio::time::timeout(after, future).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(
                        class = %class,
                        fingerprint = fingerprint.short(),
                        owner,
                        "caller deadline reached; leaving in-flight fetch"
                    );
                    return Err(QueryError::Timeout {
                        after,
                        state: probe.get(),
                    });
                }
            },
        };

        match result {
            Ok(value) => Ok((value, false)),
            Err(e) if owner => Err(e),
            Err(e) => Err(QueryError::CacheStampedeFailure {
                fingerprint: fingerprint.to_string(),
                cause: Box::new(e),
            }),
        }
    }

    fn shared_fetch<Fut>(
        &self,
        fetch: Fut,
        fingerprint: Fingerprint,
        class: TtlClass,
        scope: Option<String>,
        id: u64,
    ) -> SharedFetch<V>
    where
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let generation = inner.generation(class, scope.as_deref());
        async move {
            let result = fetch.await;
            if let Ok(value) = &result {
                if inner.generation(class, scope.as_deref()) == generation {
                    let scope_key = scope.clone();
                    inner
                        .store(class)
                        .insert(fingerprint.clone(), value.clone(), scope);
                    // Invalidation may have run between the check and the insert.
                    if inner.generation(class, scope_key.as_deref()) != generation {
                        inner.store(class).entries.remove(&fingerprint);
                    } else {
                        debug!(class = %class, fingerprint = fingerprint.short(), "cached fetch result");
                    }
                } else {
                    debug!(
                        class = %class,
                        fingerprint = fingerprint.short(),
                        "scope invalidated during fetch; result not cached"
                    );
                }
            }
            inner.inflight.remove_if(&fingerprint, |_, f| f.id == id);
            result
        }
        .boxed()
        .shared()
    }

    /// Drop every `class` entry scoped to `scope`. Returns the count removed.
    pub fn invalidate_scope(&self, scope: &str, class: TtlClass) -> usize {
        self.inner.bump_generation(class, scope);
        let removed = self.inner.store(class).invalidate_scope(scope);
        debug!(class = %class, scope, removed, "invalidated cache scope");
        removed
    }

    pub fn clear(&self) {
        self.inner.schema.entries.clear();
        self.inner.search.entries.clear();
    }

    /// Number of stored entries in `class`, including not-yet-swept expired ones.
    pub fn len(&self, class: TtlClass) -> usize {
        self.inner.store(class).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len(TtlClass::Schema) == 0 && self.len(TtlClass::Search) == 0
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }
}
