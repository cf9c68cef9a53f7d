//! Broadcast hub: tracks subscribers, detects change via content
//! fingerprints, and fans deltas out through bounded per-client queues.
//!
//! The hub is an explicitly constructed component: a single dispatch loop
//! multiplexes register/unregister events, coalesced change signals, and the
//! periodic full resync. Client queues are drained by per-client writer
//! tasks; a queue that stays full costs that client its connection, never the
//! others their latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use fleetwatch_core::feed::{encode_message, fingerprint, AgentView, FeedError, FeedMessage};

use crate::registry::Registry;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub resync_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_timeout: Duration::from_secs(2),
            resync_interval: Duration::from_secs(60),
        }
    }
}

/// Single-slot dirty notification. `notify` never blocks and never fails;
/// when a wake is already pending the extra notification is dropped, which
/// preserves "at least one pending signal" without backpressuring ingestion.
#[derive(Clone)]
pub struct ChangeSignal {
    tx: mpsc::Sender<()>,
}

impl ChangeSignal {
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

pub fn change_signal() -> (ChangeSignal, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (ChangeSignal { tx }, rx)
}

pub enum HubEvent {
    Register(HubClient),
    Unregister(u64),
}

#[derive(Clone)]
pub struct HubClient {
    pub conn_id: u64,
    sender: mpsc::Sender<String>,
}

pub struct Hub {
    config: HubConfig,
    registry: Arc<Registry>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<u64, HubClient>>,
    // name -> hex digest of the view most recently observed by a broadcast-wide
    // operation; replaced wholesale, never patched.
    baseline: Mutex<HashMap<String, String>>,
    events: mpsc::Sender<HubEvent>,
}

impl Hub {
    pub fn new(registry: Arc<Registry>, config: HubConfig, events: mpsc::Sender<HubEvent>) -> Self {
        Self {
            config,
            registry,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            baseline: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Dispatch loop. Runs until the shutdown watch flips or every event
    /// source closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<HubEvent>,
        mut changes: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut resync = tokio::time::interval(self.config.resync_interval);
        // An interval's first tick completes at once; consume it so the first
        // resync lands one full interval after startup.
        resync.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(HubEvent::Register(client)) => self.register(client).await,
                        Some(HubEvent::Unregister(conn_id)) => self.unregister(conn_id).await,
                        None => break,
                    }
                }
                signal = changes.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    self.broadcast_changed().await;
                }
                _ = resync.tick() => {
                    self.full_resync().await;
                }
            }
        }
        info!(event = "hub_stopped");
    }

    async fn register(&self, client: HubClient) {
        self.clients.write().await.insert(client.conn_id, client.clone());
        let total = self.clients.read().await.len();
        info!(event = "subscriber_connected", conn_id = client.conn_id, total);

        // Bring the new client up to date with a streamed full sync. Its own
        // queue is the only one touched; the shared baseline stays as-is.
        let snapshot = self.registry.snapshot();
        let messages = match encode_full_sync(&snapshot) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(event = "full_sync_encode_error", error = %err);
                return;
            }
        };
        for message in messages {
            if client.sender.try_send(message).is_err() {
                self.force_disconnect(client.conn_id, "initial_sync_overflow").await;
                return;
            }
        }
        debug!(event = "full_sync_sent", conn_id = client.conn_id, servers = snapshot.len());
    }

    async fn unregister(&self, conn_id: u64) {
        if self.clients.write().await.remove(&conn_id).is_some() {
            let total = self.clients.read().await.len();
            info!(event = "subscriber_disconnected", conn_id, total);
        }
    }

    async fn force_disconnect(&self, conn_id: u64, reason: &str) {
        if self.clients.write().await.remove(&conn_id).is_some() {
            warn!(event = "subscriber_dropped", conn_id, reason);
        }
    }

    /// Diff the registry against the fingerprint baseline and emit one delta
    /// to every subscriber. Silent when nothing changed.
    async fn broadcast_changed(&self) {
        let clients: Vec<HubClient> = self.clients.read().await.values().cloned().collect();
        if clients.is_empty() {
            return;
        }

        let snapshot = self.registry.snapshot();
        let mut fresh: HashMap<String, String> = HashMap::with_capacity(snapshot.len());
        for (name, view) in &snapshot {
            match fingerprint(view) {
                Ok(digest) => {
                    fresh.insert(name.clone(), digest);
                }
                Err(err) => {
                    warn!(event = "fingerprint_error", server = %name, error = %err);
                    return;
                }
            }
        }

        let mut changed: BTreeMap<String, AgentView> = BTreeMap::new();
        let mut removed: Vec<String>;
        {
            // The swap is atomic relative to message construction: nothing is
            // encoded until the baseline fully reflects this snapshot.
            let mut baseline = self.baseline.lock();
            for (name, view) in &snapshot {
                let current = fresh.get(name).map(String::as_str);
                if baseline.get(name).map(String::as_str) != current {
                    changed.insert(name.clone(), view.clone());
                }
            }
            removed = baseline
                .keys()
                .filter(|name| !snapshot.contains_key(*name))
                .cloned()
                .collect();
            *baseline = fresh;
        }
        removed.sort();

        if changed.is_empty() && removed.is_empty() {
            return;
        }

        let changed_count = changed.len();
        let removed_count = removed.len();
        let message = FeedMessage::DeltaUpdate {
            changed_servers: changed,
            removed_servers: removed,
            timestamp: Utc::now(),
        };
        let encoded = match encode_message(&message) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(event = "delta_encode_error", error = %err);
                return;
            }
        };

        let slow = self.enqueue_to_all(&clients, std::slice::from_ref(&encoded));
        for conn_id in slow {
            self.force_disconnect(conn_id, "queue_full").await;
        }
        debug!(
            event = "delta_broadcast",
            changed = changed_count,
            removed = removed_count,
            subscribers = clients.len()
        );
    }

    /// Re-send the complete state to everyone and reset the baseline. This
    /// heals any delta a client may have missed or corrupted.
    async fn full_resync(&self) {
        let clients: Vec<HubClient> = self.clients.read().await.values().cloned().collect();
        if clients.is_empty() {
            return;
        }

        let snapshot = self.registry.snapshot();
        let mut fresh: HashMap<String, String> = HashMap::with_capacity(snapshot.len());
        for (name, view) in &snapshot {
            match fingerprint(view) {
                Ok(digest) => {
                    fresh.insert(name.clone(), digest);
                }
                Err(err) => {
                    warn!(event = "fingerprint_error", server = %name, error = %err);
                    return;
                }
            }
        }
        let messages = match encode_full_sync(&snapshot) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(event = "resync_encode_error", error = %err);
                return;
            }
        };

        let slow = self.enqueue_to_all(&clients, &messages);
        *self.baseline.lock() = fresh;
        for conn_id in slow {
            self.force_disconnect(conn_id, "resync_overflow").await;
        }
        info!(
            event = "full_resync",
            servers = snapshot.len(),
            subscribers = clients.len()
        );
    }

    /// Non-blocking fan-out. Returns the clients whose queue could not take
    /// the whole sequence; the caller disconnects them.
    fn enqueue_to_all(&self, clients: &[HubClient], messages: &[String]) -> Vec<u64> {
        let mut slow = Vec::new();
        'clients: for client in clients {
            for message in messages {
                match client.sender.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(event = "slow_subscriber", conn_id = client.conn_id);
                        slow.push(client.conn_id);
                        continue 'clients;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        slow.push(client.conn_id);
                        continue 'clients;
                    }
                }
            }
        }
        slow
    }

    /// Serve one upgraded WebSocket: spawn the writer that drains this
    /// client's queue, register with the dispatch loop, then sit on the read
    /// side until the peer goes away. Inbound frames carry no meaning.
    pub async fn attach(self: Arc<Self>, socket: WebSocket) {
        let conn_id = self.next_conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<String>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let send = ws_sender.send(Message::Text(text));
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(event = "subscriber_write_error", conn_id, error = %err);
                        break;
                    }
                    Err(_) => {
                        warn!(event = "subscriber_write_timeout", conn_id);
                        break;
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        let client = HubClient { conn_id, sender: tx };
        if self.events.send(HubEvent::Register(client)).await.is_err() {
            return;
        }

        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(event = "subscriber_read_error", conn_id, error = %err);
                    break;
                }
            }
        }

        let _ = self.events.send(HubEvent::Unregister(conn_id)).await;
        let _ = writer.await;
    }
}

fn encode_full_sync(snapshot: &BTreeMap<String, AgentView>) -> Result<Vec<String>, FeedError> {
    let mut messages = Vec::with_capacity(snapshot.len() + 2);
    messages.push(encode_message(&FeedMessage::FullSyncStart {
        total_servers: snapshot.len(),
    })?);
    for (name, view) in snapshot {
        messages.push(encode_message(&FeedMessage::ServerUpdate {
            server_id: name.clone(),
            server_data: view.clone(),
        })?);
    }
    messages.push(encode_message(&FeedMessage::FullSyncComplete {})?);
    Ok(messages)
}
