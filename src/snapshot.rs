//! Crash-safe snapshots of storage state.
//!
//! The snapshot file is newline-delimited JSON, one metric per line, no
//! header or footer. `restore` replays it into storage at startup, before
//! the listener accepts traffic. `run` persists on a timer: the full state
//! is written to a temporary file which is then renamed directly over the
//! destination, so a crash mid-write leaves the previous snapshot intact.
//! Snapshot I/O failures are logged, never fatal -- the process continues
//! with whatever state its backend holds.

use crate::error::Error;
use crate::metric::Metric;
use crate::storage::Storage;
use crossbeam::channel::{tick, Receiver};
use crossbeam::select;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One snapshot line. The wire format of `Metric` omits the gauge display
/// literal; the snapshot carries it alongside so restored gauges answer
/// with full precision.
#[derive(Serialize, Deserialize)]
struct Record {
    #[serde(flatten)]
    metric: Metric,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    display: Option<String>,
}

/// Periodic persister and startup restorer for a storage backend.
pub struct Snapshotter {
    storage: Arc<dyn Storage>,
    path: PathBuf,
    tmp_dir: PathBuf,
    interval: Duration,
}

impl Snapshotter {
    /// Create a snapshotter writing to `path`, staging temp files in
    /// `tmp_dir` and persisting every `interval`.
    ///
    /// `tmp_dir` should live on the same filesystem as `path` so the final
    /// rename stays atomic.
    pub fn new(
        storage: Arc<dyn Storage>,
        path: PathBuf,
        tmp_dir: PathBuf,
        interval: Duration,
    ) -> Snapshotter {
        Snapshotter {
            storage,
            path,
            tmp_dir,
            interval,
        }
    }

    /// Replay the snapshot file into storage.
    ///
    /// A missing file is created empty and treated as zero metrics. A line
    /// that fails to decode is logged and skipped; the rest of the file
    /// still loads. Returns how many metrics were restored.
    pub fn restore(&self) -> Result<usize, Error> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&self.path)
                    .map_err(|e| Error::Persistence(e.to_string()))?;
                info!("no snapshot at {:?}, starting empty", self.path);
                return Ok(0);
            }
            Err(e) => return Err(Error::Persistence(e.to_string())),
        };

        let mut restored = 0;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| Error::Persistence(e.to_string()))?;
            if line.is_empty() {
                continue;
            }
            let record: Record = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        "skipping undecodable snapshot line {}: {}",
                        lineno + 1,
                        e
                    );
                    continue;
                }
            };
            let mut metric = record.metric;
            metric.display = record.display;
            if let Err(e) = self.storage.set(metric) {
                warn!("failed to restore snapshot line {}: {}", lineno + 1, e);
                continue;
            }
            restored += 1;
        }
        info!("restored {} metrics from {:?}", restored, self.path);
        Ok(restored)
    }

    /// Write the full storage state out, replacing the previous snapshot.
    pub fn persist_once(&self) -> Result<(), Error> {
        let metrics = self.storage.get_all()?;

        let tmp = tempfile::Builder::new()
            .prefix("ingot-snapshot")
            .suffix(".tmp")
            .tempfile_in(&self.tmp_dir)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        {
            let mut writer = BufWriter::new(tmp.as_file());
            for metric in metrics.values() {
                let record = Record {
                    display: metric.display.clone(),
                    metric: {
                        let mut m = metric.clone();
                        m.display = None;
                        m
                    },
                };
                let mut line = serde_json::to_string(&record)
                    .map_err(|e| Error::Persistence(e.to_string()))?;
                line.push('\n');
                writer
                    .write_all(line.as_bytes())
                    .map_err(|e| Error::Persistence(e.to_string()))?;
            }
            writer
                .flush()
                .map_err(|e| Error::Persistence(e.to_string()))?;
        }

        // rename over the destination; no remove first, so there is never a
        // moment with no snapshot on disk
        tmp.persist(&self.path)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        debug!("persisted {} metrics to {:?}", metrics.len(), self.path);
        Ok(())
    }

    /// Timer-driven persist loop. Runs until `shutdown` closes, then takes
    /// one final snapshot.
    pub fn run(&self, shutdown: Receiver<()>) {
        let ticker = tick(self.interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    if let Err(e) = self.persist_once() {
                        warn!("snapshot persist failed: {}", e);
                    }
                }
                recv(shutdown) -> _ => {
                    if let Err(e) = self.persist_once() {
                        warn!("final snapshot persist failed: {}", e);
                    }
                    info!("snapshotter stopped");
                    return;
                }
            }
        }
    }
}
