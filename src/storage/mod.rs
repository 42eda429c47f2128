//! Storage is where the server keeps the current value of every metric.
//!
//! Two backends implement the same contract: an in-memory map for
//! stand-alone operation and a relational backend for durability across
//! hosts. Handlers and the snapshotter only ever see `dyn Storage`.

use crate::error::Error;
use crate::metric::Metric;
use std::collections::HashMap;

mod mem;
mod migrate;
mod postgres;

pub use self::mem::MemoryStorage;
pub use self::migrate::apply_pending_migrations;
pub use self::postgres::PostgresStorage;

/// The capability contract both backends implement.
///
/// `set` applies the accumulation rules from `metric`: counters add their
/// delta to the stored total, gauges replace it. Implementations must be
/// safe to call from concurrent request-handling threads.
pub trait Storage: Send + Sync {
    /// Fetch the metric stored under `name`.
    fn get(&self, name: &str) -> Result<Metric, Error>;

    /// Merge one metric into the store.
    fn set(&self, metric: Metric) -> Result<(), Error>;

    /// Merge a batch of metrics, atomically where the backend allows it.
    ///
    /// The relational backend runs the whole batch inside one transaction:
    /// either every entry lands or none do. Atomicity holds within the
    /// batch, not across batches.
    fn set_all(&self, metrics: HashMap<String, Metric>) -> Result<(), Error>;

    /// The full name-to-metric mapping at this instant.
    fn get_all(&self) -> Result<HashMap<String, Metric>, Error>;

    /// Remove every entry.
    fn clear(&self) -> Result<(), Error>;

    /// Probe backend connectivity. The in-memory backend is always up.
    fn ping(&self) -> Result<(), Error>;

    /// Release backend resources on shutdown.
    fn close(&self);
}
