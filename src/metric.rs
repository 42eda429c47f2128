//! The metric value type and its accumulation rules.
//!
//! A `Metric` is either a `Gauge` -- a point-in-time value where the newest
//! write replaces the old -- or a `Counter`, whose writes carry a delta that
//! is added to the stored total. Exactly one of `value` / `delta` is
//! populated, matching `kind`.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

/// The two metric kinds ingot understands.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Last write wins.
    Gauge,
    /// Writes are deltas, accumulated into the stored total.
    Counter,
}

/// A single named measurement.
///
/// The wire format is `{"id": ..., "type": "gauge"|"counter", "delta"?: ...,
/// "value"?: ...}`. The `display` field never crosses the wire: it holds the
/// exact decimal literal a gauge was first obtained as, preserving trailing
/// zeros and precision that `f64` formatting would lose. It is carried
/// through storage and the snapshot file so `GET /value/...` can answer with
/// the original literal.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct Metric {
    /// Unique key within a storage instance.
    #[serde(rename = "id")]
    pub name: String,
    /// Which of `value` / `delta` is populated.
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// Counter payload: an amount to add, not an absolute value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    /// Gauge payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Exact decimal literal for gauges, when known.
    #[serde(skip)]
    pub display: Option<String>,
}

/// An ordered group of metrics produced by one collection tick or one merge
/// cycle. Ordering within a batch carries no meaning; batch boundaries set
/// message boundaries on the wire.
pub type MetricBatch = Vec<Metric>;

impl Metric {
    /// Make a gauge.
    ///
    /// # Examples
    ///
    /// ```
    /// use ingot::metric::{Metric, MetricKind};
    ///
    /// let m = Metric::gauge("heap", 12.5);
    /// assert_eq!(m.kind, MetricKind::Gauge);
    /// assert_eq!(m.value, Some(12.5));
    /// assert_eq!(m.delta, None);
    /// ```
    pub fn gauge<S>(name: S, value: f64) -> Metric
    where
        S: Into<String>,
    {
        Metric {
            name: name.into(),
            kind: MetricKind::Gauge,
            delta: None,
            value: Some(value),
            display: None,
        }
    }

    /// Make a gauge that remembers the exact literal it was parsed or
    /// sampled from.
    pub fn gauge_with_display<S, D>(name: S, value: f64, display: D) -> Metric
    where
        S: Into<String>,
        D: Into<String>,
    {
        Metric {
            name: name.into(),
            kind: MetricKind::Gauge,
            delta: None,
            value: Some(value),
            display: Some(display.into()),
        }
    }

    /// Make a counter carrying `delta`.
    pub fn counter<S>(name: S, delta: i64) -> Metric
    where
        S: Into<String>,
    {
        Metric {
            name: name.into(),
            kind: MetricKind::Counter,
            delta: Some(delta),
            value: None,
            display: None,
        }
    }

    /// Check the kind/payload invariant.
    ///
    /// A gauge must carry `value`, a counter must carry `delta`. Metrics
    /// bound from client JSON go through here before they touch storage.
    pub fn validate(&self) -> Result<(), Error> {
        match self.kind {
            MetricKind::Gauge if self.value.is_some() => Ok(()),
            MetricKind::Counter if self.delta.is_some() => Ok(()),
            MetricKind::Gauge => {
                Err(Error::InvalidKind(format!("gauge {} has no value", self.name)))
            }
            MetricKind::Counter => {
                Err(Error::InvalidKind(format!("counter {} has no delta", self.name)))
            }
        }
    }

    /// The value as a human-readable string.
    ///
    /// Counters format their total as a decimal integer. Gauges answer with
    /// the preserved literal when one is known, else fall back to fixed
    /// six-decimal formatting -- the fallback exists because naive float
    /// formatting drops trailing zeros the measurement was first obtained
    /// with.
    pub fn display_value(&self) -> Result<String, Error> {
        match self.kind {
            MetricKind::Counter => match self.delta {
                Some(d) => Ok(format!("{}", d)),
                None => Err(Error::InvalidKind(format!(
                    "counter {} has no delta",
                    self.name
                ))),
            },
            MetricKind::Gauge => {
                if let Some(ref full) = self.display {
                    return Ok(full.clone());
                }
                match self.value {
                    Some(v) => Ok(format!("{:.6}", v)),
                    None => Err(Error::InvalidKind(format!(
                        "gauge {} has no value",
                        self.name
                    ))),
                }
            }
        }
    }
}

impl AddAssign for Metric {
    /// Merge an incoming write into the stored metric.
    ///
    /// Counter: the incoming delta is added to the stored delta, treating an
    /// absent stored delta as zero. Gauge: the incoming value and display
    /// literal replace the stored ones.
    fn add_assign(&mut self, rhs: Metric) {
        match rhs.kind {
            MetricKind::Counter => {
                self.kind = MetricKind::Counter;
                self.delta = Some(self.delta.unwrap_or(0) + rhs.delta.unwrap_or(0));
                self.value = None;
                self.display = None;
            }
            MetricKind::Gauge => {
                *self = rhs;
            }
        }
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Metric {{ kind: {:?}, name: {}, delta: {:?}, value: {:?} }}",
            self.kind, self.name, self.delta, self.value
        )
    }
}
