//! TCP ingestion listener: one long-lived read loop per agent connection,
//! newline-delimited JSON records. A malformed or oversized line is logged
//! and skipped; only a read failure or EOF ends the connection, and
//! reconnecting is the agent's problem, not ours.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetwatch_core::telemetry::TelemetryRecord;
use fleetwatch_core::wire::{decode_line, DEFAULT_MAX_LINE_BYTES};

use crate::hub::ChangeSignal;
use crate::registry::Registry;

pub async fn run_with_listener(
    listener: TcpListener,
    registry: Arc<Registry>,
    signal: ChangeSignal,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let addr = listener.local_addr()?;
    info!(event = "ingest_listening", addr = %addr);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, remote)) => {
                        info!(event = "agent_connected", remote = %remote);
                        let registry = registry.clone();
                        let signal = signal.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, registry, signal).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "ingest_accept_error", error = %err);
                    }
                }
            }
        }
    }

    info!(event = "ingest_stopped");
    Ok(())
}

async fn handle_connection(stream: TcpStream, registry: Arc<Registry>, signal: ChangeSignal) {
    let remote = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(event = "ingest_read_error", remote = %remote, error = %err);
                break;
            }
        }
        if line.iter().all(|byte| byte.is_ascii_whitespace()) {
            continue;
        }

        let record: TelemetryRecord = match decode_line(&line, DEFAULT_MAX_LINE_BYTES) {
            Ok(record) => record,
            Err(err) => {
                warn!(event = "ingest_bad_record", remote = %remote, error = %err);
                continue;
            }
        };

        registry.update(record);
        signal.notify();
    }

    info!(event = "agent_disconnected", remote = %remote);
}
