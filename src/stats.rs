//! Run statistics and cost accounting.

use crate::{catalog::PricingEntry, engine::Usage, sink::RunResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Monetary cost of a request or run. `Unknown` when the model has no
/// pricing entry; it absorbs any sum it takes part in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cost {
    Known(f64),
    Unknown,
}

impl Default for Cost {
    fn default() -> Self {
        Cost::Known(0.0)
    }
}

impl Cost {
    pub fn add(self, other: Cost) -> Cost {
        match (self, other) {
            (Cost::Known(a), Cost::Known(b)) => Cost::Known(a + b),
            _ => Cost::Unknown,
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            Cost::Known(v) => Some(v),
            Cost::Unknown => None,
        }
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cost::Known(v) => write!(f, "${v:.4}"),
            Cost::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for Cost {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Cost::Known(v) => s.serialize_f64(*v),
            Cost::Unknown => s.serialize_str("unknown"),
        }
    }
}

impl<'de> Deserialize<'de> for Cost {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Marker(String),
        }
        match Raw::deserialize(d)? {
            Raw::Number(v) => Ok(Cost::Known(v)),
            Raw::Marker(s) if s == "unknown" => Ok(Cost::Unknown),
            Raw::Marker(s) => Err(serde::de::Error::custom(format!(
                "expected number or \"unknown\", got {s:?}"
            ))),
        }
    }
}

/// Prices one request. Cached input tokens use the cached rate when the
/// entry has one, otherwise the plain input rate.
pub fn compute_cost(pricing: Option<&PricingEntry>, usage: &Usage) -> Cost {
    let Some(p) = pricing else {
        return Cost::Unknown;
    };
    let cached = usage.cached_input_tokens.min(usage.input_tokens);
    let uncached = usage.input_tokens - cached;
    let cached_rate = p
        .cached_input_cost_per_million
        .unwrap_or(p.input_cost_per_million);

    let cost = (uncached as f64 / 1_000_000.0) * p.input_cost_per_million
        + (cached as f64 / 1_000_000.0) * cached_rate
        + (usage.output_tokens as f64 / 1_000_000.0) * p.output_cost_per_million;
    Cost::Known(cost)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Admitted and not yet terminal.
    pub in_flight: u64,
    pub peak_in_flight: u64,
    /// Finished calls whose result row could not be written.
    pub unwritten: u64,
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: Cost,
    pub elapsed_seconds: f64,
}

impl StatsSnapshot {
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

#[derive(Debug)]
struct RunStats {
    started: Instant,
    snapshot: StatsSnapshot,
}

/// Shared handle to a run's statistics. Cheap to clone; every read returns a
/// consistent copy.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    inner: Arc<Mutex<RunStats>>,
}

impl Default for StatsHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunStats {
                started: Instant::now(),
                snapshot: StatsSnapshot::default(),
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut RunStats) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard)
    }

    pub fn restart_clock(&self) {
        self.with(|s| s.started = Instant::now());
    }

    pub fn record_admitted(&self) {
        self.with(|s| {
            let snap = &mut s.snapshot;
            snap.admitted += 1;
            snap.in_flight += 1;
            snap.peak_in_flight = snap.peak_in_flight.max(snap.in_flight);
        });
    }

    /// Admitted but stopped by cancellation before the call started.
    pub fn record_cancelled(&self) {
        self.with(|s| {
            s.snapshot.in_flight = s.snapshot.in_flight.saturating_sub(1);
            s.snapshot.cancelled += 1;
        });
    }

    /// Applies a written result. Called from inside the sink's guarded
    /// section so totals always match the sink's rows.
    pub fn record_terminal(&self, result: &RunResult) {
        self.with(|s| {
            let snap = &mut s.snapshot;
            snap.in_flight = snap.in_flight.saturating_sub(1);
            if result.is_success() {
                snap.succeeded += 1;
            } else {
                snap.failed += 1;
            }
            snap.input_tokens += result.input_tokens;
            snap.cached_input_tokens += result.cached_input_tokens;
            snap.output_tokens += result.output_tokens;
            snap.total_cost = snap.total_cost.add(result.cost);
        });
    }

    /// Releases an in-flight slot whose result could not be written.
    pub fn record_unwritten(&self) {
        self.with(|s| {
            s.snapshot.in_flight = s.snapshot.in_flight.saturating_sub(1);
            s.snapshot.unwritten += 1;
        });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.with(|s| {
            let mut snap = s.snapshot.clone();
            snap.elapsed_seconds = s.started.elapsed().as_secs_f64();
            snap
        })
    }
}
