//! The delivery stage of the agent pipeline.
//!
//! A `DeliveryPool` drains merged batches on the report interval, flattens
//! them into a bounded job queue, and keeps exactly `rate_limit` worker
//! threads pulling one metric at a time through a `Transport`. The queue
//! bound doubles as backpressure: when every worker is busy and the queue
//! is full, the drain blocks rather than ballooning memory.

mod http;

pub use self::http::HttpTransport;

use crate::error::Error;
use crate::metric::Metric;
use crate::source::BatchReceiver;
use crossbeam::channel::{bounded, tick, Receiver, Sender};
use crossbeam::select;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Something that can push a single metric to the collector.
///
/// Implementations own their reliability story; `HttpTransport` wraps each
/// send in the envelope and the shared retry policy.
pub trait Transport: Send + Sync {
    /// Deliver one metric. An error here means retries are already spent.
    fn deliver(&self, metric: Metric) -> Result<(), Error>;
}

/// Worker pool that reliably empties the merged channel.
pub struct DeliveryPool {
    transport: Arc<dyn Transport>,
    report_interval: Duration,
    rate_limit: usize,
}

impl DeliveryPool {
    /// Create a pool of `rate_limit` workers flushing every
    /// `report_interval`.
    pub fn new(
        transport: Arc<dyn Transport>,
        report_interval: Duration,
        rate_limit: usize,
    ) -> DeliveryPool {
        DeliveryPool {
            transport,
            report_interval,
            rate_limit: rate_limit.max(1),
        }
    }

    /// Run until shutdown. On the way out, anything already queued is
    /// flushed best-effort before the workers are released.
    pub fn run(&self, merged: BatchReceiver, shutdown: Receiver<()>) {
        let (job_tx, job_rx) = bounded::<Metric>(self.rate_limit);
        let workers: Vec<thread::JoinHandle<()>> = (0..self.rate_limit)
            .map(|i| {
                let jobs = job_rx.clone();
                let transport = Arc::clone(&self.transport);
                thread::Builder::new()
                    .name(format!("ingot-deliver-{}", i))
                    .spawn(move || deliver_loop(&jobs, &*transport))
                    .expect("failed to spawn delivery worker")
            })
            .collect();
        drop(job_rx);

        let ticker = tick(self.report_interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    drain(&merged, &job_tx);
                }
                recv(shutdown) -> _ => {
                    drain(&merged, &job_tx);
                    drop(job_tx);
                    for worker in workers {
                        if worker.join().is_err() {
                            error!("delivery worker panicked");
                        }
                    }
                    info!("delivery stage stopped");
                    return;
                }
            }
        }
    }
}

/// Pull jobs until the queue closes and empties.
fn deliver_loop(jobs: &Receiver<Metric>, transport: &dyn Transport) {
    for metric in jobs {
        let name = metric.name.clone();
        if let Err(e) = transport.deliver(metric) {
            // retries are spent; the metric is gone for good
            warn!("dropping metric {}: {}", name, e);
        }
    }
}

/// Move every currently available merged batch into the job queue.
fn drain(merged: &BatchReceiver, job_tx: &Sender<Metric>) {
    while let Ok(batch) = merged.try_recv() {
        for metric in batch {
            if job_tx.send(metric).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricBatch;
    use crossbeam::channel::unbounded;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<Metric>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Recording {
        fn new() -> Recording {
            Recording {
                seen: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    impl Transport for Recording {
        fn deliver(&self, metric: Metric) -> Result<(), Error> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.seen.lock().unwrap().push(metric);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl Transport for Failing {
        fn deliver(&self, _: Metric) -> Result<(), Error> {
            Err(Error::Transient("unreachable".to_string()))
        }
    }

    fn batches(count: usize) -> Vec<MetricBatch> {
        (0..count)
            .map(|i| vec![Metric::counter(format!("m{}", i), 1)])
            .collect()
    }

    #[test]
    fn every_queued_metric_is_delivered_on_shutdown() {
        let transport = Arc::new(Recording::new());
        let pool = DeliveryPool::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Duration::from_secs(60),
            3,
        );
        let (merged_tx, merged_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);

        for batch in batches(20) {
            merged_tx.send(batch).unwrap();
        }

        let runner = thread::spawn(move || pool.run(merged_rx, stop_rx));
        drop(stop_tx);
        runner.join().unwrap();

        let seen = transport.seen.lock().unwrap();
        let names: HashSet<String> = seen.iter().map(|m| m.name.clone()).collect();
        assert_eq!(names.len(), 20, "final flush delivers the whole backlog");
    }

    #[test]
    fn concurrency_never_exceeds_rate_limit() {
        let transport = Arc::new(Recording::new());
        let pool = DeliveryPool::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Duration::from_millis(20),
            2,
        );
        let (merged_tx, merged_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);

        for batch in batches(12) {
            merged_tx.send(batch).unwrap();
        }

        let runner = thread::spawn(move || pool.run(merged_rx, stop_rx));
        thread::sleep(Duration::from_millis(200));
        drop(stop_tx);
        runner.join().unwrap();

        assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(transport.seen.lock().unwrap().len(), 12);
    }

    #[test]
    fn failed_deliveries_are_dropped_not_requeued() {
        let pool = DeliveryPool::new(
            Arc::new(Failing) as Arc<dyn Transport>,
            Duration::from_secs(60),
            2,
        );
        let (merged_tx, merged_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);

        for batch in batches(4) {
            merged_tx.send(batch).unwrap();
        }

        let runner = thread::spawn(move || pool.run(merged_rx, stop_rx));
        drop(stop_tx);
        // a failing transport must not wedge shutdown
        runner.join().unwrap();
    }
}
