//! # Kibana Harness
//!
//! Time-windowed log queries against Kibana, with a fingerprint-keyed
//! result cache, a retry state machine with sort fallback, and chunked
//! AI summarization of the fetched records.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌──────────────────┐
//! │    CLI    │──▶│ LogService │──▶│ FingerprintCache │
//! │   (kh)    │   │ + Session  │   │ schema / search  │
//! └───────────┘   └─────┬──────┘   └────────┬─────────┘
//!                       │ miss              │
//!                       ▼                   ▼
//!               ┌───────────────┐   ┌────────────────┐   ┌─────────┐
//!               │RetryController│──▶│ ConnectionPool │──▶│ Kibana  │
//!               └───────────────┘   └────────────────┘   └─────────┘
//!                       │ records
//!                       ▼
//!               ┌───────────────┐
//!               │   Analyzer    │  (chunked above the threshold)
//!               └───────────────┘
//! ```
//!
//! Pure types (time filters, descriptors, chunk merging) live in the
//! `kibana-harness-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, validation, overrides |
//! | [`error`] | Query error taxonomy |
//! | [`backend`] | Backend traits and the Kibana HTTP adapter |
//! | [`pool`] | Bounded multiplexed connection pool |
//! | [`retry`] | Retry state machine |
//! | [`cache`] | TTL cache with single-flight fetches |
//! | [`analysis`] | Analysis providers |
//! | [`digest`] | Local record digests: errors, field counts, session ids |
//! | [`session`] | Active index selection |
//! | [`service`] | Request orchestration |

pub mod analysis;
pub mod backend;
pub mod cache;
pub mod config;
pub mod digest;
pub mod error;
pub mod pool;
pub mod retry;
pub mod service;
pub mod session;
