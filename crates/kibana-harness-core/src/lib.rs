//! # Kibana Harness Core
//!
//! Shared, runtime-agnostic logic for Kibana Harness: log and analysis
//! models, time filter parsing, canonical query descriptors with their
//! fingerprints, and the chunk-and-merge summarization algorithm.
//!
//! This crate contains no tokio, reqwest, filesystem I/O, or other
//! native-only dependencies. Everything that talks to a network lives in
//! the `kibana-harness` application crate.

pub mod chunk;
pub mod descriptor;
pub mod models;
pub mod time_filter;
