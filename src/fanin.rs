//! Fan-in merge stage for the agent pipeline.
//!
//! Two producers, one consumer: batches from the runtime and host
//! collectors are forwarded unmodified onto a single merged channel. No
//! ordering is imposed between the producers; each producer's own batches
//! arrive in the order it sent them. The stage ends when both source
//! channels have closed, closing the merged channel in turn.

use crate::metric::MetricBatch;
use crate::source::{BatchReceiver, BatchSender};
use crossbeam::channel::never;
use crossbeam::select;

/// Forward every batch from `a` and `b` onto `out` until both close.
pub fn merge(a: BatchReceiver, b: BatchReceiver, out: BatchSender) {
    let mut a = a;
    let mut b = b;
    let mut a_open = true;
    let mut b_open = true;

    while a_open || b_open {
        let forwarded: Option<MetricBatch> = select! {
            recv(a) -> msg => match msg {
                Ok(batch) => Some(batch),
                Err(_) => {
                    a_open = false;
                    a = never();
                    None
                }
            },
            recv(b) -> msg => match msg {
                Ok(batch) => Some(batch),
                Err(_) => {
                    b_open = false;
                    b = never();
                    None
                }
            },
        };
        if let Some(batch) = forwarded {
            if out.send(batch).is_err() {
                // consumer went away; drain nothing further
                return;
            }
        }
    }
    debug!("merge stage finished, both sources closed");
}
