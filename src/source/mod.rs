//! Sources produce metric batches on their own schedules.
//!
//! Each source runs on its own thread, writes whole batches to a rendezvous
//! channel and watches the shared shutdown signal. The fan-in stage in
//! `fanin` multiplexes every source onto the single channel the delivery
//! stage drains.

use crate::metric::MetricBatch;
use crossbeam::channel::{Receiver, Sender};

mod host;
mod runtime;

pub use self::host::HostCollector;
pub use self::runtime::RuntimeCollector;

/// Sending half of a source's output channel.
pub type BatchSender = Sender<MetricBatch>;
/// Receiving half of a source's output channel.
pub type BatchReceiver = Receiver<MetricBatch>;

/// A producer of metric batches.
///
/// `run` blocks until the shutdown channel closes, then returns after
/// dropping the output sender so downstream stages observe the close.
pub trait Source {
    /// Produce until shutdown.
    fn run(&mut self, shutdown: Receiver<()>);
}
