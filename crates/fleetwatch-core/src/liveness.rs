use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Seconds without contact after which an agent is considered stale.
pub const STALE_AFTER_SECS: i64 = 5;
/// Seconds without contact after which an agent is considered dead.
pub const DEAD_AFTER_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Active,
    Stale,
    Dead,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Active => "active",
            Liveness::Stale => "stale",
            Liveness::Dead => "dead",
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an agent from the time elapsed since its last contact.
///
/// Intervals are half-open: exactly 5s is Stale and exactly 10s is Dead.
/// A negative elapsed time (clock anomaly) classifies as Active.
pub fn classify(elapsed: Duration) -> Liveness {
    if elapsed >= Duration::seconds(DEAD_AFTER_SECS) {
        Liveness::Dead
    } else if elapsed >= Duration::seconds(STALE_AFTER_SECS) {
        Liveness::Stale
    } else {
        Liveness::Active
    }
}
