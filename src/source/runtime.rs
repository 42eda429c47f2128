//! Process/runtime statistics source.

use crate::metric::{Metric, MetricBatch};
use crate::source::{BatchSender, Source};
use crossbeam::channel::{tick, Receiver};
use crossbeam::select;
use rand::Rng;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Samples this process's runtime statistics every poll interval: memory
/// and CPU gauges, the monotonically increasing `PollCount` counter and
/// one `RandomValue` gauge.
pub struct RuntimeCollector {
    chan: BatchSender,
    interval: Duration,
    sys: System,
    pid: Pid,
}

impl RuntimeCollector {
    /// Create a collector emitting on `chan` every `interval`.
    pub fn new(chan: BatchSender, interval: Duration) -> RuntimeCollector {
        let pid = sysinfo::get_current_pid().expect("could not determine own pid");
        RuntimeCollector {
            chan,
            interval,
            sys: System::new(),
            pid,
        }
    }

    fn sample(&mut self) -> MetricBatch {
        self.sys
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

        let mut batch = MetricBatch::new();
        if let Some(proc_) = self.sys.process(self.pid) {
            batch.push(Metric::gauge("Alloc", proc_.memory() as f64));
            batch.push(Metric::gauge("Sys", proc_.virtual_memory() as f64));
            batch.push(Metric::gauge(
                "CPUFraction",
                f64::from(proc_.cpu_usage()) / 100.0,
            ));
        }

        // each tick contributes one poll; the server accumulates the total
        batch.push(Metric::counter("PollCount", 1));

        let random = rand::thread_rng().gen::<f64>();
        batch.push(Metric::gauge_with_display(
            "RandomValue",
            random,
            format!("{}", random),
        ));
        batch
    }
}

impl Source for RuntimeCollector {
    fn run(&mut self, shutdown: Receiver<()>) {
        let ticker = tick(self.interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    let batch = self.sample();
                    select! {
                        send(self.chan, batch) -> res => {
                            if res.is_err() {
                                // downstream went away; nothing left to feed
                                return;
                            }
                        }
                        recv(shutdown) -> _ => {
                            info!("runtime collector stopped");
                            return;
                        }
                    }
                }
                recv(shutdown) -> _ => {
                    info!("runtime collector stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;
    use crossbeam::channel::bounded;
    use std::thread;

    #[test]
    fn sample_carries_poll_count_and_random_value() {
        let (tx, _rx) = bounded(0);
        let mut collector = RuntimeCollector::new(tx, Duration::from_secs(2));
        let batch = collector.sample();

        let poll = batch.iter().find(|m| m.name == "PollCount").unwrap();
        assert_eq!(poll.kind, MetricKind::Counter);
        assert_eq!(poll.delta, Some(1));

        let random = batch.iter().find(|m| m.name == "RandomValue").unwrap();
        assert_eq!(random.kind, MetricKind::Gauge);
        let value = random.value.unwrap();
        assert!((0.0..1.0).contains(&value));
        // the display literal is the exact sampled value
        assert_eq!(random.display.as_deref().unwrap(), format!("{}", value));
    }

    #[test]
    fn run_stops_on_shutdown() {
        let (tx, rx) = bounded(0);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::spawn(move || {
            RuntimeCollector::new(tx, Duration::from_millis(10)).run(stop_rx);
        });
        // let it emit at least one batch, then signal shutdown
        let first = rx.recv().unwrap();
        assert!(!first.is_empty());
        drop(stop_tx);
        handle.join().unwrap();
    }
}
