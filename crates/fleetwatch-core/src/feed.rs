//! Subscriber feed contracts: the envelopes streamed to dashboard clients and
//! the canonical-JSON fingerprinting used for change detection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::liveness::Liveness;
use crate::telemetry::TelemetryRecord;

/// Defensive copy of one agent's state as exposed to subscribers and the
/// query surface. Never aliases registry internals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentView {
    pub name: String,
    pub state: Liveness,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub data_history: Vec<TelemetryRecord>,
}

impl AgentView {
    /// Most recent record, if any history has been ingested.
    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.data_history.last()
    }
}

/// Envelopes on the subscriber feed, encoded as `{"type": ..., "payload": ...}`.
///
/// A full sync is streamed as start/item*/complete rather than one message so
/// peak message size stays bounded and clients can render incrementally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FeedMessage {
    FullSyncStart {
        total_servers: usize,
    },
    ServerUpdate {
        server_id: String,
        server_data: AgentView,
    },
    FullSyncComplete {},
    DeltaUpdate {
        changed_servers: BTreeMap<String, AgentView>,
        #[serde(default)]
        removed_servers: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("feed encode failed: {0}")]
    Encode(String),
}

pub fn encode_message(message: &FeedMessage) -> Result<String, FeedError> {
    serde_json::to_string(message).map_err(|err| FeedError::Encode(err.to_string()))
}

/// Content fingerprint of an agent view: SHA-256 over its canonical JSON.
/// Two views that serialize to the same canonical form always hash the same,
/// regardless of map insertion order anywhere in the payload.
pub fn fingerprint(view: &AgentView) -> Result<String, FeedError> {
    Ok(sha256_hex(canonical_json(view)?.as_bytes()))
}

pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, FeedError> {
    let json = serde_json::to_value(value).map_err(|err| FeedError::Encode(err.to_string()))?;
    let canonical = canonicalize_value(json);
    serde_json::to_string(&canonical).map_err(|err| FeedError::Encode(err.to_string()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (key, entry) in entries {
                sorted.insert(key, canonicalize_value(entry));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize_value).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{DiskStats, MemoryStats, SystemStats};

    fn sample_view(name: &str, cpu: f64) -> AgentView {
        AgentView {
            name: name.to_string(),
            state: Liveness::Active,
            last_seen: "2026-08-07T12:00:00Z".parse().expect("timestamp"),
            data_history: vec![TelemetryRecord {
                server_name: name.to_string(),
                timestamp: "2026-08-07T12:00:00Z".parse().expect("timestamp"),
                system_stats: SystemStats {
                    cpu_percent: cpu,
                    memory: MemoryStats {
                        total: 16,
                        available: 8,
                        used: 8,
                        percent: 50.0,
                    },
                    disk: DiskStats {
                        total: 100,
                        free: 50,
                        used: 50,
                        percent: 50.0,
                    },
                },
                tmux_panes: Vec::new(),
                session_name: "main".to_string(),
            }],
        }
    }

    #[test]
    fn envelope_shape_matches_wire_contract() {
        let start = encode_message(&FeedMessage::FullSyncStart { total_servers: 3 }).expect("encode");
        let value: Value = serde_json::from_str(&start).expect("reparse");
        assert_eq!(value["type"], "full_sync_start");
        assert_eq!(value["payload"]["total_servers"], 3);

        let complete = encode_message(&FeedMessage::FullSyncComplete {}).expect("encode");
        let value: Value = serde_json::from_str(&complete).expect("reparse");
        assert_eq!(value["type"], "full_sync_complete");
        assert!(value["payload"].as_object().expect("payload object").is_empty());
    }

    #[test]
    fn delta_round_trips() {
        let mut changed = BTreeMap::new();
        changed.insert("web1".to_string(), sample_view("web1", 12.0));
        let message = FeedMessage::DeltaUpdate {
            changed_servers: changed,
            removed_servers: vec!["old1".to_string()],
            timestamp: "2026-08-07T12:00:05Z".parse().expect("timestamp"),
        };

        let encoded = encode_message(&message).expect("encode");
        let decoded: FeedMessage = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn fingerprint_is_deterministic_and_content_sensitive() {
        let a = sample_view("web1", 12.0);
        let b = sample_view("web1", 12.0);
        assert_eq!(fingerprint(&a).expect("fp"), fingerprint(&b).expect("fp"));

        let changed = sample_view("web1", 99.0);
        assert_ne!(fingerprint(&a).expect("fp"), fingerprint(&changed).expect("fp"));
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let first: Value =
            serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": [3, {"q": 4, "p": 5}]}}"#)
                .expect("parse");
        let second: Value =
            serde_json::from_str(r#"{"a": {"x": [3, {"p": 5, "q": 4}], "y": 2}, "b": 1}"#)
                .expect("parse");

        let left = canonical_json(&first).expect("canonical");
        let right = canonical_json(&second).expect("canonical");
        assert_eq!(left, right);
        assert_eq!(sha256_hex(left.as_bytes()), sha256_hex(right.as_bytes()));
    }

    #[test]
    fn fingerprint_tracks_liveness_changes() {
        let active = sample_view("web1", 12.0);
        let mut stale = active.clone();
        stale.state = Liveness::Stale;
        assert_ne!(
            fingerprint(&active).expect("fp"),
            fingerprint(&stale).expect("fp")
        );
    }
}
