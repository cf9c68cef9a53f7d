//! Concurrent store of per-agent state.
//!
//! Locking discipline: the structural lock guards map membership only and is
//! always released before any per-entry lock is taken; a per-entry critical
//! section never touches the structural lock. Unrelated agents therefore
//! mutate concurrently, and no lock is ever held across I/O or an await.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::info;

use fleetwatch_core::feed::AgentView;
use fleetwatch_core::liveness::{classify, Liveness};
use fleetwatch_core::telemetry::TelemetryRecord;
use fleetwatch_storage::PersistedAgent;

use crate::hub::ChangeSignal;
use crate::persist::PersistHandle;

/// Rolling window of records kept per agent; oldest evicted first.
pub const HISTORY_CAPACITY: usize = 50;

struct AgentEntry {
    name: String,
    inner: RwLock<AgentInner>,
}

struct AgentInner {
    state: Liveness,
    last_seen: DateTime<Utc>,
    history: VecDeque<TelemetryRecord>,
}

impl AgentEntry {
    fn new(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            inner: RwLock::new(AgentInner {
                state: Liveness::Active,
                last_seen: now,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            }),
        }
    }

    fn view(&self) -> AgentView {
        let inner = self.inner.read();
        AgentView {
            name: self.name.clone(),
            state: inner.state,
            last_seen: inner.last_seen,
            data_history: inner.history.iter().cloned().collect(),
        }
    }
}

pub struct Registry {
    agents: RwLock<HashMap<String, Arc<AgentEntry>>>,
    persist: Option<PersistHandle>,
}

impl Registry {
    pub fn new(persist: Option<PersistHandle>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            persist,
        }
    }

    /// Apply one inbound record. Liveness is recomputed from the server-side
    /// arrival time; the agent-supplied timestamp inside the record is kept
    /// only as payload. Persistence is dispatched after the entry lock is
    /// released and can never fail into this path.
    pub fn update(&self, record: TelemetryRecord) {
        self.update_at(record, Utc::now());
    }

    pub fn update_at(&self, record: TelemetryRecord, now: DateTime<Utc>) {
        let entry = self.entry_for(&record.server_name, now);

        let persisted = {
            let mut inner = entry.inner.write();
            inner.history.push_back(record);
            while inner.history.len() > HISTORY_CAPACITY {
                inner.history.pop_front();
            }
            inner.last_seen = now;
            inner.state = classify(now.signed_duration_since(inner.last_seen));
            self.persist.as_ref().map(|_| PersistedAgent {
                server_name: entry.name.clone(),
                last_seen: inner.last_seen,
                data_history: inner.history.iter().cloned().collect(),
            })
        };

        if let (Some(handle), Some(persisted)) = (self.persist.as_ref(), persisted) {
            handle.enqueue(persisted);
        }
    }

    /// Defensively-copied view of every agent, keyed by name. BTreeMap keeps
    /// iteration deterministic for fingerprinting and the feed.
    pub fn snapshot(&self) -> BTreeMap<String, AgentView> {
        let entries: Vec<Arc<AgentEntry>> = self.agents.read().values().cloned().collect();
        entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry.view()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<AgentView> {
        let entry = self.agents.read().get(name).cloned()?;
        Some(entry.view())
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Recompute every agent's liveness from elapsed time. Run by the sweeper
    /// so silent agents are demoted even without new records.
    pub fn reclassify_all(&self) {
        self.reclassify_all_at(Utc::now());
    }

    pub fn reclassify_all_at(&self, now: DateTime<Utc>) {
        let entries: Vec<Arc<AgentEntry>> = self.agents.read().values().cloned().collect();
        for entry in entries {
            let mut inner = entry.inner.write();
            inner.state = classify(now.signed_duration_since(inner.last_seen));
        }
    }

    /// Seed the registry from storage at startup, truncating any over-long
    /// stored history and recomputing liveness from the stored last contact.
    pub fn load_persisted(&self, agents: Vec<PersistedAgent>) {
        self.load_persisted_at(agents, Utc::now());
    }

    pub fn load_persisted_at(&self, agents: Vec<PersistedAgent>, now: DateTime<Utc>) {
        for stored in agents {
            let mut history: VecDeque<TelemetryRecord> = stored.data_history.into();
            while history.len() > HISTORY_CAPACITY {
                history.pop_front();
            }
            let entry = Arc::new(AgentEntry {
                name: stored.server_name.clone(),
                inner: RwLock::new(AgentInner {
                    state: classify(now.signed_duration_since(stored.last_seen)),
                    last_seen: stored.last_seen,
                    history,
                }),
            });
            self.agents.write().insert(stored.server_name, entry);
        }
    }

    fn entry_for(&self, name: &str, now: DateTime<Utc>) -> Arc<AgentEntry> {
        if let Some(entry) = self.agents.read().get(name) {
            return entry.clone();
        }
        let mut agents = self.agents.write();
        agents
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AgentEntry::new(name, now)))
            .clone()
    }
}

/// Periodic liveness sweep: reclassify everything, then nudge the hub so any
/// demotion reaches subscribers even when no agent is sending.
pub fn spawn_liveness_sweeper(
    registry: Arc<Registry>,
    signal: ChangeSignal,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    registry.reclassify_all();
                    signal.notify();
                }
            }
        }
        info!(event = "liveness_sweeper_stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwatch_core::telemetry::{DiskStats, MemoryStats, SystemStats};

    fn record(name: &str, cpu: f64) -> TelemetryRecord {
        TelemetryRecord {
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
        }
    }

    fn t0() -> DateTime<Utc> {
        "2026-08-07T12:00:00Z".parse().expect("timestamp")
    }

    #[test]
    fn history_is_capped_fifo() {
        let registry = Registry::new(None);
        for i in 0..60 {
            registry.update_at(record("web1", i as f64), t0());
        }

        let view = registry.get("web1").expect("present");
        assert_eq!(view.data_history.len(), HISTORY_CAPACITY);
        // records 0..=9 evicted; the window starts at record 10
        assert_eq!(view.data_history[0].system_stats.cpu_percent, 10.0);
        assert_eq!(
            view.data_history.last().expect("last").system_stats.cpu_percent,
            59.0
        );
    }

    #[test]
    fn short_history_keeps_everything() {
        let registry = Registry::new(None);
        for i in 0..3 {
            registry.update_at(record("web1", i as f64), t0());
        }
        let view = registry.get("web1").expect("present");
        assert_eq!(view.data_history.len(), 3);
    }

    #[test]
    fn liveness_follows_arrival_clock() {
        let registry = Registry::new(None);
        let start = t0();

        registry.update_at(record("web1", 1.0), start);
        assert_eq!(registry.get("web1").expect("present").state, Liveness::Active);

        registry.update_at(record("web1", 2.0), start + chrono::Duration::seconds(1));
        assert_eq!(registry.get("web1").expect("present").state, Liveness::Active);

        // last contact was t0+1s, so t0+6s is exactly the 5s stale boundary
        registry.reclassify_all_at(start + chrono::Duration::seconds(6));
        assert_eq!(registry.get("web1").expect("present").state, Liveness::Stale);

        registry.reclassify_all_at(start + chrono::Duration::seconds(11));
        assert_eq!(registry.get("web1").expect("present").state, Liveness::Dead);
    }

    #[test]
    fn snapshot_copies_are_detached() {
        let registry = Registry::new(None);
        registry.update_at(record("web1", 1.0), t0());

        let before = registry.snapshot();
        registry.update_at(record("web1", 2.0), t0());
        let after = registry.snapshot();

        assert_eq!(before["web1"].data_history.len(), 1);
        assert_eq!(after["web1"].data_history.len(), 2);
    }

    #[test]
    fn agents_update_concurrently() {
        let registry = Arc::new(Registry::new(None));
        let mut handles = Vec::new();
        for agent in 0..4 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                let name = format!("agent-{agent}");
                for i in 0..100 {
                    registry.update_at(record(&name, i as f64), t0());
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 4);
        for view in snapshot.values() {
            assert_eq!(view.data_history.len(), HISTORY_CAPACITY);
        }
    }

    #[test]
    fn persisted_agents_reload_with_recomputed_liveness() {
        let registry = Registry::new(None);
        let stored = PersistedAgent {
            server_name: "web1".to_string(),
            last_seen: t0(),
            data_history: vec![record("web1", 1.0)],
        };

        registry.load_persisted_at(vec![stored], t0() + chrono::Duration::seconds(30));
        let view = registry.get("web1").expect("present");
        assert_eq!(view.state, Liveness::Dead);
        assert_eq!(view.data_history.len(), 1);
    }

    #[test]
    fn oversized_persisted_history_is_truncated() {
        let registry = Registry::new(None);
        let stored = PersistedAgent {
            server_name: "web1".to_string(),
            last_seen: t0(),
            data_history: (0..70).map(|i| record("web1", i as f64)).collect(),
        };

        registry.load_persisted_at(vec![stored], t0());
        let view = registry.get("web1").expect("present");
        assert_eq!(view.data_history.len(), HISTORY_CAPACITY);
        assert_eq!(view.data_history[0].system_stats.cpu_percent, 20.0);
    }
}
