//! Retry state machine for a single logical query execution.
//!
//! ```text
//!            schema error (sort present, first time)
//!   INITIAL ───────────────────────────────────────▶ SORT_FALLBACK ──┐
//!      │  auth error                                               │
//!      ├──────────────▶ AUTH_REFRESH_PENDING (terminal failure)    │
//!      │  transient error, retries left                            │
//!      ├──────────────▶ TRANSIENT_RETRY ──(backoff, reissue)───────┤
//!      │  transient error, bound reached                           │
//!      ├──────────────▶ EXHAUSTED (terminal failure)               │
//!      │  success                                                  │
//!      └──────────────▶ SUCCEEDED ◀────────────────────────────────┘
//! ```
//!
//! A schema fallback reissues the identical query with the sort clause
//! removed; it never guesses another field. Each recovery path is taken at
//! most once per kind (transient retries are bounded by
//! [`RetryPolicy::max_retries`]). Other errors fail fast.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kibana_harness_core::descriptor::{QueryDescriptor, SchemaDescriptor};
use serde::Serialize;
use tracing::{error, warn};

use crate::backend::{BackendError, BackendErrorKind};
use crate::config::RetryConfig;
use crate::error::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryState {
    Initial,
    SortFallback,
    AuthRefreshPending,
    TransientRetry,
    Exhausted,
    Succeeded,
}

impl RetryState {
    const ALL: [RetryState; 6] = [
        Self::Initial,
        Self::SortFallback,
        Self::AuthRefreshPending,
        Self::TransientRetry,
        Self::Exhausted,
        Self::Succeeded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::SortFallback => "SORT_FALLBACK",
            Self::AuthRefreshPending => "AUTH_REFRESH_PENDING",
            Self::TransientRetry => "TRANSIENT_RETRY",
            Self::Exhausted => "EXHAUSTED",
            Self::Succeeded => "SUCCEEDED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::AuthRefreshPending | Self::Exhausted | Self::Succeeded
        )
    }

    fn index(self) -> u8 {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0) as u8
    }

    fn from_index(i: u8) -> Self {
        Self::ALL.get(i as usize).copied().unwrap_or(Self::Initial)
    }
}

impl std::fmt::Display for RetryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one query execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub state: RetryState,
    pub error_kind: Option<BackendErrorKind>,
    pub attempts_used: u32,
}

/// Shared view of a controller's current state.
///
/// Survives cancellation of the controller's future, so a deadline
/// wrapper can still report where execution stopped.
#[derive(Debug, Clone)]
pub struct StateProbe(Arc<AtomicU8>);

impl Default for StateProbe {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(RetryState::Initial.index())))
    }
}

impl StateProbe {
    pub fn get(&self) -> RetryState {
        RetryState::from_index(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: RetryState) {
        self.0.store(state.index(), Ordering::Release);
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts allowed for transient errors.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added at random, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter_factor > 0.0 {
            capped * (1.0 + rand::random::<f64>() * self.jitter_factor)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }
}

/// A request the controller can reissue without its sort clause.
pub trait Fallback: Clone {
    fn sort_field(&self) -> Option<&str>;

    /// The identical request with the sort clause removed.
    fn without_sort(&self) -> Self;
}

impl Fallback for QueryDescriptor {
    fn sort_field(&self) -> Option<&str> {
        self.sort().map(|s| s.field.as_str())
    }

    fn without_sort(&self) -> Self {
        QueryDescriptor::without_sort(self)
    }
}

impl Fallback for SchemaDescriptor {
    fn sort_field(&self) -> Option<&str> {
        None
    }

    fn without_sort(&self) -> Self {
        self.clone()
    }
}

/// Result of a successful execution.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// False when the sort clause was dropped by a schema fallback or was
    /// never requested; the records then carry no ordering guarantee.
    pub sort_applied: bool,
    pub attempts: u32,
}

/// Drives one query through the retry state machine.
pub struct RetryController {
    policy: RetryPolicy,
    attempt: RetryAttempt,
    probe: StateProbe,
    sort_fallback_used: bool,
    transient_retries: u32,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: RetryAttempt {
                state: RetryState::Initial,
                error_kind: None,
                attempts_used: 0,
            },
            probe: StateProbe::default(),
            sort_fallback_used: false,
            transient_retries: 0,
        }
    }

    /// Controller that publishes its state to a [`StateProbe`] owned elsewhere.
    pub fn with_probe(policy: RetryPolicy, probe: StateProbe) -> Self {
        Self {
            probe,
            ..Self::new(policy)
        }
    }

    pub fn probe(&self) -> StateProbe {
        self.probe.clone()
    }

    pub fn attempt(&self) -> RetryAttempt {
        self.attempt
    }

    fn transition(&mut self, state: RetryState) {
        self.attempt.state = state;
        self.probe.set(state);
    }

    /// Execute `op` until it succeeds or a terminal state is reached.
    ///
    /// `op` receives the request to send on each attempt: the original,
    /// or the same request without sort after a schema fallback.
    pub async fn run<R, T, F, Fut>(
        &mut self,
        request: &R,
        mut op: F,
    ) -> Result<RetryOutcome<T>, QueryError>
    where
        R: Fallback,
        F: FnMut(R) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut current = request.clone();

        loop {
            self.attempt.attempts_used += 1;

            let err = match op(current.clone()).await {
                Ok(value) => {
                    self.transition(RetryState::Succeeded);
                    return Ok(RetryOutcome {
                        value,
                        sort_applied: current.sort_field().is_some(),
                        attempts: self.attempt.attempts_used,
                    });
                }
                Err(err) => err,
            };

            self.attempt.error_kind = Some(err.kind);

            match err.kind {
                BackendErrorKind::Schema if current.sort_field().is_some() && !self.sort_fallback_used => {
                    warn!(
                        field = current.sort_field().unwrap_or_default(),
                        error = %err,
                        "sort field rejected by backend; retrying without sort"
                    );
                    self.sort_fallback_used = true;
                    self.transition(RetryState::SortFallback);
                    current = current.without_sort();
                }
                BackendErrorKind::Schema => {
                    let field = err
                        .schema_field()
                        .map(str::to_string)
                        .or_else(|| request.sort_field().map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    return Err(QueryError::SchemaMismatch {
                        field,
                        state: self.attempt.state,
                    });
                }
                BackendErrorKind::Auth => {
                    self.transition(RetryState::AuthRefreshPending);
                    return Err(QueryError::Auth {
                        message: err.message,
                        state: RetryState::AuthRefreshPending,
                    });
                }
                BackendErrorKind::Transient if self.transient_retries < self.policy.max_retries => {
                    let delay = self.policy.delay_for_attempt(self.transient_retries);
                    self.transient_retries += 1;
                    self.transition(RetryState::TransientRetry);
                    warn!(
                        retry = self.transient_retries,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient backend error; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                BackendErrorKind::Transient => {
                    self.transition(RetryState::Exhausted);
                    error!(
                        attempts = self.attempt.attempts_used,
                        error = %err,
                        "backend unavailable; retries exhausted"
                    );
                    return Err(QueryError::BackendUnavailable {
                        attempts: self.attempt.attempts_used,
                        last_error: err.to_string(),
                        state: RetryState::Exhausted,
                    });
                }
                BackendErrorKind::Other => {
                    return Err(QueryError::Backend {
                        status: err.status,
                        message: err.message,
                        state: self.attempt.state,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kibana_harness_core::descriptor::SortOrder;
    use kibana_harness_core::time_filter::TimeWindow;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn descriptor(sorted: bool) -> QueryDescriptor {
        let d = QueryDescriptor::new(
            "logs*",
            TimeWindow {
                start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            },
        );
        if sorted {
            d.with_sort(Some("no_such_field"), SortOrder::Desc)
        } else {
            d
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Replays scripted results and records the descriptors it was given.
    struct Script {
        results: Mutex<VecDeque<Result<u32, BackendError>>>,
        seen: Mutex<Vec<QueryDescriptor>>,
    }

    impl Script {
        fn new(results: Vec<Result<u32, BackendError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        async fn call(&self, d: QueryDescriptor) -> Result<u32, BackendError> {
            self.seen.lock().unwrap().push(d);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::other("script exhausted")))
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            jitter_factor: 0.3,
            ..fast_policy(3)
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(0);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(1300));
        }
    }

    #[tokio::test]
    async fn test_sort_fallback_exactly_once() {
        let script = Script::new(vec![
            Err(BackendError::from_status(
                400,
                "No mapping found for [no_such_field] in order to sort on",
            )),
            Ok(7),
        ]);
        let mut controller = RetryController::new(fast_policy(2));
        let outcome = controller
            .run(&descriptor(true), |d| script.call(d))
            .await
            .unwrap();

        assert_eq!(outcome.value, 7);
        assert!(!outcome.sort_applied);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(controller.attempt().state, RetryState::Succeeded);

        let seen = script.seen.lock().unwrap();
        assert!(seen[0].sort().is_some());
        assert!(seen[1].sort().is_none());
        assert_eq!(seen[1], descriptor(true).without_sort());
    }

    #[tokio::test]
    async fn test_second_schema_error_surfaces() {
        let schema = || BackendError::from_status(400, "No mapping found for [no_such_field] in order to sort on");
        let script = Script::new(vec![Err(schema()), Err(schema()), Ok(1)]);
        let mut controller = RetryController::new(fast_policy(2));
        let err = controller
            .run(&descriptor(true), |d| script.call(d))
            .await
            .unwrap_err();

        match err {
            QueryError::SchemaMismatch { field, state } => {
                assert_eq!(field, "no_such_field");
                assert_eq!(state, RetryState::SortFallback);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(script.calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_not_retried() {
        let script = Script::new(vec![Err(BackendError::from_status(401, "expired")), Ok(1)]);
        let mut controller = RetryController::new(fast_policy(2));
        let err = controller
            .run(&descriptor(true), |d| script.call(d))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QueryError::Auth { state: RetryState::AuthRefreshPending, .. }
        ));
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_then_exhausted() {
        let script = Script::new(vec![
            Err(BackendError::from_status(503, "busy")),
            Err(BackendError::connection("reset by peer")),
            Err(BackendError::from_status(502, "bad gateway")),
            Ok(1),
        ]);
        let mut controller = RetryController::new(fast_policy(2));
        let probe = controller.probe();
        let err = controller
            .run(&descriptor(false), |d| script.call(d))
            .await
            .unwrap_err();

        match err {
            QueryError::BackendUnavailable { attempts, last_error, state } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("bad gateway"));
                assert_eq!(state, RetryState::Exhausted);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(script.calls(), 3);
        assert_eq!(probe.get(), RetryState::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_recovers() {
        let script = Script::new(vec![Err(BackendError::from_status(500, "oops")), Ok(9)]);
        let mut controller = RetryController::new(fast_policy(2));
        let outcome = controller
            .run(&descriptor(false), |d| script.call(d))
            .await
            .unwrap();
        assert_eq!(outcome.value, 9);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_state_tracks_controller() {
        let script = Script::new(vec![Err(BackendError::from_status(503, "busy")), Ok(2)]);
        let probe = StateProbe::default();
        let mut controller = RetryController::with_probe(fast_policy(1), probe.clone());
        assert_eq!(probe.get(), RetryState::Initial);

        controller
            .run(&descriptor(false), |d| script.call(d))
            .await
            .unwrap();
        assert_eq!(probe.get(), RetryState::Succeeded);
    }

    #[tokio::test]
    async fn test_other_fails_fast() {
        let script = Script::new(vec![Err(BackendError::from_status(404, "no index")), Ok(1)]);
        let mut controller = RetryController::new(fast_policy(2));
        let err = controller
            .run(&descriptor(true), |d| script.call(d))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Backend { status: Some(404), state: RetryState::Initial, .. }
        ));
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test]
    async fn test_schema_error_without_sort_surfaces() {
        let script = Script::new(vec![Err(BackendError::schema("unknown field [x] in sort"))]);
        let mut controller = RetryController::new(fast_policy(2));
        let err = controller
            .run(&descriptor(false), |d| script.call(d))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::SchemaMismatch { state: RetryState::Initial, .. }));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(RetryState::SortFallback.to_string(), "SORT_FALLBACK");
        assert!(RetryState::Exhausted.is_terminal());
        assert!(!RetryState::TransientRetry.is_terminal());
        for s in RetryState::ALL {
            assert_eq!(RetryState::from_index(s.index()), s);
        }
    }
}
