//! Cumulative-counter to per-second-rate conversion
//!
//! The table remembers the previous (timestamp, value) point per metric key
//! and turns cumulative counters into rates on the next observation. Only
//! cumulative counters may flow through here: a value drop is read as a
//! counter reset (container restart) and the rate is computed against a
//! zero baseline.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;

use crate::models::MetricScope;

/// Entries untouched for this long are evicted at cycle start.
const ENTRY_TTL_SECONDS: i64 = 3600;

/// Structured rate-table key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub scope: MetricScope,
    pub name: String,
    /// Owning scope, e.g. `"{namespace}:{pod}"` for container metrics.
    pub parent: String,
    pub entity: String,
}

#[derive(Debug, Clone, Copy)]
struct RatePoint {
    timestamp: DateTime<Utc>,
    value: i64,
}

/// Why a rate was dropped for this observation. The new point is still
/// stored so the next cycle can compute.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateError {
    #[error("no previous value")]
    NoPrevious,
    #[error("timestamp not newer than previous one")]
    NotNewer,
}

/// Mutex-guarded map of previous counter observations.
#[derive(Default)]
pub struct RateTable {
    points: Mutex<HashMap<RateKey, RatePoint>>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes `multiplier * Δvalue / Δt_nanos` against the stored point.
    ///
    /// The observation is stored regardless of the outcome, except that a
    /// stale timestamp never replaces a newer baseline.
    pub fn rate(
        &self,
        key: RateKey,
        timestamp: DateTime<Utc>,
        value: i64,
        multiplier: i64,
    ) -> Result<i64, RateError> {
        let mut points = self.points.lock().expect("rate table mutex poisoned");
        let point = RatePoint { timestamp, value };

        let Some(previous) = points.get(&key).copied() else {
            points.insert(key, point);
            return Err(RateError::NoPrevious);
        };

        let duration_nanos = (timestamp - previous.timestamp)
            .num_nanoseconds()
            .unwrap_or(0);
        if duration_nanos <= 1_000_000_000 {
            if timestamp >= previous.timestamp {
                points.insert(key, point);
            }
            return Err(RateError::NotNewer);
        }

        let baseline = if value < previous.value {
            // Counter reset after a restart.
            0
        } else {
            previous.value
        };
        let rate = (multiplier as i128) * ((value - baseline) as i128) / (duration_nanos as i128);
        points.insert(key, point);
        Ok(rate as i64)
    }

    /// Drops entries older than one hour; called at the start of each cycle.
    pub fn collect_garbage(&self) {
        let cutoff = Utc::now() - ChronoDuration::seconds(ENTRY_TTL_SECONDS);
        self.points
            .lock()
            .expect("rate table mutex poisoned")
            .retain(|_, point| point.timestamp > cutoff);
    }

    pub fn len(&self) -> usize {
        self.points.lock().expect("rate table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
