use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One inbound telemetry snapshot from an agent. Immutable once received;
/// the `timestamp` is whatever the agent claims and is kept for display only
/// (liveness always uses the server-side arrival time instead).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    pub server_name: String,
    pub timestamp: DateTime<Utc>,
    pub system_stats: SystemStats,
    #[serde(default)]
    pub tmux_panes: Vec<TmuxPane>,
    #[serde(default)]
    pub session_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub memory: MemoryStats,
    pub disk: DiskStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryStats {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskStats {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TmuxPane {
    pub id: String,
    pub window_id: String,
    pub session_id: String,
    pub content: String,
    pub active: bool,
}
