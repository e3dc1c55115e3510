//! Leaf value comparison.
//!
//! Two flavors: [`equal`] is exact and drives conflict detection;
//! [`Comparator::fuzzy_match`] tolerates float noise and time-of-day
//! differences and drives record matching. Leaves of different kinds never
//! compare equal under either.

use chrono::Utc;

use crate::types::{LeafValue, Temporal};

pub const DEFAULT_FLOAT_TOLERANCE: f64 = 1e-4;

/// Exact comparison: byte-equal strings, numerically equal integers,
/// bit-equal floats and booleans, identical instants.
pub fn equal(a: &LeafValue, b: &LeafValue) -> bool {
    match (a, b) {
        (LeafValue::Text(x), LeafValue::Text(y)) => x == y,
        (LeafValue::Integer(x), LeafValue::Integer(y)) => x == y,
        (LeafValue::Float(x), LeafValue::Float(y)) => x.to_bits() == y.to_bits(),
        (LeafValue::Bool(x), LeafValue::Bool(y)) => x == y,
        (LeafValue::Temporal(x), LeafValue::Temporal(y)) => temporal_equal(x, y),
        _ => false,
    }
}

fn temporal_equal(a: &Temporal, b: &Temporal) -> bool {
    match (a, b) {
        (Temporal::Date(x), Temporal::Date(y)) => x == y,
        // DateTime equality compares the instant, not the offset.
        (Temporal::Instant(x), Temporal::Instant(y)) => x == y,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparator {
    float_tolerance: f64,
}

impl Default for Comparator {
    fn default() -> Self {
        Self::new(DEFAULT_FLOAT_TOLERANCE)
    }
}

impl Comparator {
    pub fn new(float_tolerance: f64) -> Self {
        Self { float_tolerance }
    }

    pub fn float_tolerance(&self) -> f64 {
        self.float_tolerance
    }

    /// Approximate comparison used when deciding whether two resources
    /// describe the same thing.
    pub fn fuzzy_match(&self, a: &LeafValue, b: &LeafValue) -> bool {
        match (a, b) {
            (LeafValue::Float(x), LeafValue::Float(y)) => (x - y).abs() <= self.float_tolerance,
            (LeafValue::Temporal(x), LeafValue::Temporal(y)) => same_day(x, y),
            _ => equal(a, b),
        }
    }
}

/// Same calendar day once both sides are on UTC. A bare date has no time
/// reference to normalize against an instant, so that pairing never matches.
fn same_day(a: &Temporal, b: &Temporal) -> bool {
    match (a, b) {
        (Temporal::Date(x), Temporal::Date(y)) => x == y,
        (Temporal::Instant(x), Temporal::Instant(y)) => {
            x.with_timezone(&Utc).date_naive() == y.with_timezone(&Utc).date_naive()
        }
        _ => false,
    }
}
