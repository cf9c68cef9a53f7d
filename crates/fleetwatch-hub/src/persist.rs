//! Background persistence: a bounded queue feeding a single worker that
//! performs blocking saves off the async runtime. Ingestion never waits on
//! disk; when the queue is full the snapshot is dropped with a warning (the
//! next update for that agent re-enqueues a fresher one anyway).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fleetwatch_storage::{PersistedAgent, Storage};

pub const DEFAULT_PERSIST_QUEUE: usize = 64;

#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<PersistedAgent>,
}

impl PersistHandle {
    pub fn enqueue(&self, agent: PersistedAgent) {
        match self.tx.try_send(agent) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(agent)) => {
                warn!(event = "persist_queue_full", server = %agent.server_name);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event = "persist_worker_gone");
            }
        }
    }
}

pub fn spawn_persist_worker(
    storage: Arc<dyn Storage>,
    capacity: usize,
) -> (PersistHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<PersistedAgent>(capacity);

    let worker = tokio::spawn(async move {
        while let Some(agent) = rx.recv().await {
            let storage = storage.clone();
            let server_name = agent.server_name.clone();
            match tokio::task::spawn_blocking(move || storage.save(&agent)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = "persist_save_error", server = %server_name, error = %err);
                }
                Err(err) => {
                    warn!(event = "persist_join_error", server = %server_name, error = %err);
                }
            }
        }
        debug!(event = "persist_worker_stopped");
    });

    (PersistHandle { tx }, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwatch_storage::StorageError;
    use parking_lot::Mutex;
    use std::io;
    use std::time::Duration;

    struct RecordingStorage {
        saved: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingStorage {
        fn new(fail: bool) -> Self {
            Self {
                saved: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl Storage for RecordingStorage {
        fn save(&self, agent: &PersistedAgent) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Io(io::Error::other("disk on fire")));
            }
            self.saved.lock().push(agent.server_name.clone());
            Ok(())
        }

        fn load_all(&self) -> Result<Vec<PersistedAgent>, StorageError> {
            Ok(Vec::new())
        }
    }

    fn agent(name: &str) -> PersistedAgent {
        PersistedAgent {
            server_name: name.to_string(),
            last_seen: "2026-08-07T12:00:00Z".parse().expect("timestamp"),
            data_history: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_drains_queue_to_storage() {
        let storage = Arc::new(RecordingStorage::new(false));
        let (handle, worker) = spawn_persist_worker(storage.clone(), 8);

        handle.enqueue(agent("web1"));
        handle.enqueue(agent("web2"));
        drop(handle);
        worker.await.expect("worker join");

        let saved = storage.saved.lock().clone();
        assert_eq!(saved, vec!["web1".to_string(), "web2".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn save_errors_do_not_stop_the_worker() {
        let storage = Arc::new(RecordingStorage::new(true));
        let (handle, worker) = spawn_persist_worker(storage, 8);

        handle.enqueue(agent("web1"));
        handle.enqueue(agent("web2"));
        drop(handle);

        // The worker must survive both failed saves and exit cleanly.
        tokio::time::timeout(Duration::from_secs(3), worker)
            .await
            .expect("worker finished")
            .expect("worker join");
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        // No worker draining: build the channel directly so it stays full.
        let (tx, _rx) = mpsc::channel(1);
        let handle = PersistHandle { tx };

        handle.enqueue(agent("web1"));
        // Queue is now full; this must return immediately without error.
        handle.enqueue(agent("web2"));
    }
}
