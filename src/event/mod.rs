//! Metric events
//!
//! An event is one submission from a call site. Events sharing a key are
//! merged in the buffer until the next flush, so the transport only ever
//! sees one event per key per flush cycle.
//!
//! | Kind      | Merge                                   | StatsD type |
//! |-----------|-----------------------------------------|-------------|
//! | Increment | sum of deltas                           | `c`         |
//! | Gauge     | latest value wins                       | `g`         |
//! | Absolute  | latest value set wins                   | `a`         |
//! | Total     | latest running total wins               | `t`         |
//! | Timing    | samples accumulated into a distribution | `ms`        |

mod timing;

pub use timing::TimingDistribution;

use std::fmt;
use std::time::Duration;

/// Kind of metric carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Increment,
    Gauge,
    Absolute,
    Total,
    Timing,
}

impl EventKind {
    /// StatsD type suffix for this kind
    pub fn type_code(&self) -> &'static str {
        match self {
            EventKind::Increment => "c",
            EventKind::Gauge => "g",
            EventKind::Absolute => "a",
            EventKind::Total => "t",
            EventKind::Timing => "ms",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Increment => "increment",
            EventKind::Gauge => "gauge",
            EventKind::Absolute => "absolute",
            EventKind::Total => "total",
            EventKind::Timing => "timing",
        };
        f.write_str(name)
    }
}

/// Error raised when two events cannot be merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Same metric name submitted as two different kinds
    KindMismatch {
        key: String,
        existing: EventKind,
        incoming: EventKind,
    },
    /// Merged value no longer fits
    Overflow { key: String },
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::KindMismatch {
                key,
                existing,
                incoming,
            } => write!(
                f,
                "cannot merge {} into {} for metric '{}'",
                incoming, existing, key
            ),
            MergeError::Overflow { key } => write!(f, "overflow merging metric '{}'", key),
        }
    }
}

impl std::error::Error for MergeError {}

/// A single metric event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Counter delta (negative for decrements)
    Increment { name: String, value: i64 },
    /// Point-in-time value
    Gauge { name: String, value: i64 },
    /// Absolute-valued metric, never averaged by the collector
    Absolute { name: String, values: Vec<i64> },
    /// Continuously increasing value, e.g. reads since boot
    Total { name: String, value: i64 },
    /// Duration samples
    Timing {
        name: String,
        distribution: TimingDistribution,
    },
}

impl Event {
    pub fn increment(name: impl Into<String>, value: i64) -> Self {
        Event::Increment {
            name: name.into(),
            value,
        }
    }

    pub fn gauge(name: impl Into<String>, value: i64) -> Self {
        Event::Gauge {
            name: name.into(),
            value,
        }
    }

    pub fn absolute(name: impl Into<String>, value: i64) -> Self {
        Event::Absolute {
            name: name.into(),
            values: vec![value],
        }
    }

    pub fn total(name: impl Into<String>, value: i64) -> Self {
        Event::Total {
            name: name.into(),
            value,
        }
    }

    pub fn timing(name: impl Into<String>, sample: Duration) -> Self {
        Event::Timing {
            name: name.into(),
            distribution: TimingDistribution::new(sample),
        }
    }

    /// Identity key: events with equal keys are merged together
    pub fn key(&self) -> &str {
        match self {
            Event::Increment { name, .. }
            | Event::Gauge { name, .. }
            | Event::Absolute { name, .. }
            | Event::Total { name, .. }
            | Event::Timing { name, .. } => name,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Increment { .. } => EventKind::Increment,
            Event::Gauge { .. } => EventKind::Gauge,
            Event::Absolute { .. } => EventKind::Absolute,
            Event::Total { .. } => EventKind::Total,
            Event::Timing { .. } => EventKind::Timing,
        }
    }

    /// Merge a later event for the same key into this one.
    ///
    /// On error `self` is left as it was before the call.
    pub fn merge(&mut self, other: Event) -> Result<(), MergeError> {
        let existing = self.kind();
        match (self, other) {
            (Event::Increment { name, value }, Event::Increment { value: delta, .. }) => {
                *value = value
                    .checked_add(delta)
                    .ok_or_else(|| MergeError::Overflow { key: name.clone() })?;
            }
            (Event::Gauge { value, .. }, Event::Gauge { value: latest, .. })
            | (Event::Total { value, .. }, Event::Total { value: latest, .. }) => {
                *value = latest;
            }
            (Event::Absolute { values, .. }, Event::Absolute { values: latest, .. }) => {
                *values = latest;
            }
            (
                Event::Timing { name, distribution },
                Event::Timing {
                    distribution: incoming,
                    ..
                },
            ) => {
                if !distribution.merge(incoming) {
                    return Err(MergeError::Overflow { key: name.clone() });
                }
            }
            (current, other) => {
                return Err(MergeError::KindMismatch {
                    key: current.key().to_string(),
                    existing,
                    incoming: other.kind(),
                });
            }
        }
        Ok(())
    }

    /// StatsD lines for this event, without a prefix
    pub fn stats(&self) -> Vec<String> {
        let code = self.kind().type_code();
        match self {
            Event::Increment { name, value } | Event::Total { name, value } => {
                vec![format!("{}:{}|{}", name, value, code)]
            }
            Event::Gauge { name, value } => {
                // A signed gauge is read as a delta, so reset to zero first
                if *value < 0 {
                    vec![
                        format!("{}:0|{}", name, code),
                        format!("{}:{}|{}", name, value, code),
                    ]
                } else {
                    vec![format!("{}:{}|{}", name, value, code)]
                }
            }
            Event::Absolute { name, values } => values
                .iter()
                .map(|v| format!("{}:{}|{}", name, v, code))
                .collect(),
            Event::Timing { name, distribution } => {
                let ms = timing::format_millis;
                vec![
                    format!("{}.count:{}|c", name, distribution.count()),
                    format!("{}.avg:{}|ms", name, ms(distribution.mean())),
                    format!("{}.min:{}|ms", name, ms(distribution.min())),
                    format!("{}.max:{}|ms", name, ms(distribution.max())),
                    format!("{}.p90:{}|ms", name, ms(distribution.percentile(90.0))),
                    format!("{}.p99:{}|ms", name, ms(distribution.percentile(99.0))),
                ]
            }
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stats().join("\n"))
    }
}
