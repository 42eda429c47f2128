//! Host-level statistics source.

use crate::metric::{Metric, MetricBatch};
use crate::source::{BatchSender, Source};
use crossbeam::channel::{tick, Receiver};
use crossbeam::select;
use std::time::Duration;
use sysinfo::System;

/// The host sampling cadence is fixed, independent of the poll interval.
const HOST_TICK: Duration = Duration::from_secs(5);

/// Samples host-wide statistics every five seconds: total and free memory
/// plus one utilization gauge per core.
pub struct HostCollector {
    chan: BatchSender,
    sys: System,
}

impl HostCollector {
    /// Create a collector emitting on `chan`.
    pub fn new(chan: BatchSender) -> HostCollector {
        HostCollector {
            chan,
            sys: System::new(),
        }
    }

    fn sample(&mut self) -> MetricBatch {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();

        let mut batch = MetricBatch::new();
        batch.push(Metric::gauge("TotalMemory", self.sys.total_memory() as f64));
        batch.push(Metric::gauge("FreeMemory", self.sys.free_memory() as f64));
        for (i, cpu) in self.sys.cpus().iter().enumerate() {
            batch.push(Metric::gauge(
                format!("CPUutilization{}", i + 1),
                f64::from(cpu.cpu_usage()),
            ));
        }
        batch
    }
}

impl Source for HostCollector {
    fn run(&mut self, shutdown: Receiver<()>) {
        let ticker = tick(HOST_TICK);
        loop {
            select! {
                recv(ticker) -> _ => {
                    let batch = self.sample();
                    select! {
                        send(self.chan, batch) -> res => {
                            if res.is_err() {
                                return;
                            }
                        }
                        recv(shutdown) -> _ => {
                            info!("host collector stopped");
                            return;
                        }
                    }
                }
                recv(shutdown) -> _ => {
                    info!("host collector stopped");
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

    #[test]
    fn sample_reports_memory_and_cores() {
        let (tx, _rx) = bounded(0);
        let mut collector = HostCollector::new(tx);
        // first refresh primes the cpu counters
        collector.sample();
        let batch = collector.sample();

        let total = batch.iter().find(|m| m.name == "TotalMemory").unwrap();
        assert_eq!(total.kind, MetricKind::Gauge);
        assert!(total.value.unwrap() > 0.0);
        assert!(batch.iter().any(|m| m.name == "FreeMemory"));
        assert!(batch.iter().any(|m| m.name == "CPUutilization1"));
    }
}
