//! Ingot is a push-model metrics telemetry pipeline. The `ingot-agent`
//! binary samples process and host statistics on independent schedules,
//! merges the streams, and delivers each metric reliably over HTTP with a
//! bounded worker pool. The `ingot-server` binary accumulates what arrives
//! in a pluggable storage backend, snapshots state to disk, and answers
//! queries for current values.
//!
//! Why you might choose to use ingot:
//!
//!  * You need counters that accumulate and gauges that overwrite, and
//!    nothing fancier.
//!  * You want delivery to survive flaky networks without unbounded
//!    concurrency.
//!  * You want server state to survive restarts, with or without a
//!    relational backend.
//!  * You want payloads compressed, integrity-checked and optionally
//!    encrypted on the wire.
#![deny(trivial_numeric_casts, missing_docs, unstable_features, unused_import_braces)]

#[macro_use]
extern crate log;

pub mod config;
pub mod envelope;
pub mod error;
pub mod fanin;
pub mod metric;
pub mod retry;
pub mod server;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod storage;
