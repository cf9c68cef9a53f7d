mod hub;
mod ingest;
mod persist;
mod registry;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleetwatch_core::feed::AgentView;
use fleetwatch_core::liveness::Liveness;
use fleetwatch_storage::{JsonFileStorage, Storage};

use crate::hub::{Hub, HubConfig};
use crate::registry::Registry;

#[derive(Parser, Debug)]
#[command(name = "fleetwatch-hub")]
struct Args {
    /// TCP address agents push telemetry to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    ingest_addr: String,
    /// Address for the dashboard feed (/ws) and the REST projections.
    #[arg(long, default_value = "0.0.0.0:8081")]
    http_addr: String,
    /// Directory holding one JSON file per agent.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// Seconds between liveness sweeps.
    #[arg(long, default_value_t = 2)]
    sweep_interval: u64,
    /// Seconds between full resyncs to all subscribers.
    #[arg(long, default_value_t = 60)]
    resync_interval: u64,
    /// Outbound queue capacity per subscriber.
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    /// Seconds allowed for one subscriber socket write.
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    hub: Arc<Hub>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);
    info!(
        event = "fleetwatch_start",
        ingest_addr = %args.ingest_addr,
        http_addr = %args.http_addr,
        data_dir = %args.data_dir.display()
    );

    let storage: Arc<dyn Storage> = Arc::new(JsonFileStorage::new(&args.data_dir));
    let (persist_handle, _persist_worker) =
        persist::spawn_persist_worker(storage.clone(), persist::DEFAULT_PERSIST_QUEUE);
    let registry = Arc::new(Registry::new(Some(persist_handle)));

    match storage.load_all() {
        Ok(agents) => {
            let count = agents.len();
            registry.load_persisted(agents);
            info!(event = "storage_loaded", agents = count);
        }
        Err(err) => {
            warn!(event = "storage_load_error", error = %err);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (signal, changes_rx) = hub::change_signal();
    let (events_tx, events_rx) = mpsc::channel(64);

    let hub = Arc::new(Hub::new(
        registry.clone(),
        HubConfig {
            queue_capacity: args.queue_capacity,
            write_timeout: Duration::from_secs(args.write_timeout),
            resync_interval: Duration::from_secs(args.resync_interval),
        },
        events_tx,
    ));
    tokio::spawn(hub.clone().run(events_rx, changes_rx, shutdown_rx.clone()));

    registry::spawn_liveness_sweeper(
        registry.clone(),
        signal.clone(),
        Duration::from_secs(args.sweep_interval),
        shutdown_rx.clone(),
    );

    // Binding the ingestion listener is the one fatal failure.
    let ingest_listener = match TcpListener::bind(&args.ingest_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "ingest_bind_error", addr = %args.ingest_addr, error = %err);
            return;
        }
    };
    tokio::spawn(ingest::run_with_listener(
        ingest_listener,
        registry.clone(),
        signal.clone(),
        shutdown_rx.clone(),
    ));

    let state = AppState {
        registry: registry.clone(),
        hub,
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/servers", get(list_servers))
        .route("/api/servers/:name", get(get_server))
        .route("/api/health", get(health))
        .with_state(state);

    let http_listener = match TcpListener::bind(&args.http_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "http_bind_error", addr = %args.http_addr, error = %err);
            return;
        }
    };
    info!(event = "http_listening", addr = %args.http_addr);

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_signal");
        let _ = shutdown_tx.send(true);
    };

    if let Err(err) = axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "http_serve_error", error = %err);
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| state.hub.attach(socket))
}

async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    let servers = state.registry.snapshot();
    Json(json!({
        "count": servers.len(),
        "servers": servers,
    }))
}

async fn get_server(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry.get(&name) {
        Some(view) => Json(view).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "server not found"})),
        )
            .into_response(),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    Json(json!({
        "status": "healthy",
        "stats": health_summary(&snapshot),
    }))
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct HealthStats {
    total: usize,
    active: usize,
    stale: usize,
    dead: usize,
}

fn health_summary(views: &BTreeMap<String, AgentView>) -> HealthStats {
    let mut stats = HealthStats {
        total: 0,
        active: 0,
        stale: 0,
        dead: 0,
    };
    for view in views.values() {
        stats.total += 1;
        match view.state {
            Liveness::Active => stats.active += 1,
            Liveness::Stale => stats.stale += 1,
            Liveness::Dead => stats.dead += 1,
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(name: &str, state: Liveness) -> AgentView {
        AgentView {
            name: name.to_string(),
            state,
            last_seen: "2026-08-07T12:00:00Z".parse().expect("timestamp"),
            data_history: Vec::new(),
        }
    }

    #[test]
    fn health_summary_counts_by_liveness() {
        let mut views = BTreeMap::new();
        views.insert("a".to_string(), view("a", Liveness::Active));
        views.insert("b".to_string(), view("b", Liveness::Active));
        views.insert("c".to_string(), view("c", Liveness::Stale));
        views.insert("d".to_string(), view("d", Liveness::Dead));

        assert_eq!(
            health_summary(&views),
            HealthStats {
                total: 4,
                active: 2,
                stale: 1,
                dead: 1,
            }
        );
    }

    #[test]
    fn health_summary_of_empty_fleet() {
        assert_eq!(
            health_summary(&BTreeMap::new()),
            HealthStats {
                total: 0,
                active: 0,
                stale: 0,
                dead: 0,
            }
        );
    }
}
