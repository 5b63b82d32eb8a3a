//! JSON-RPC facade for external UIs: `conductor.request` / `resolve` /
//! `status` / `history` over a Unix domain socket, newline-delimited JSON,
//! any number of concurrent clients. Resolutions go through the same
//! pending store as the messaging path, so whichever side answers first
//! wins and the other is a no-op.

mod message_processor;
pub mod rpc;

use std::io::Result as IoResult;
use std::path::Path;
use std::sync::Arc;

use conductor_core::conductor::Conductor;
use conductor_protocol::protocol::ConductorEvent;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::message_processor::MessageProcessor;
use crate::rpc::JsonRpcMessage;
use crate::rpc::JsonRpcRequest;
use crate::rpc::NOTIFY_REQUESTED;
use crate::rpc::NOTIFY_RESOLVED;

/// Size of the bounded per-client outgoing channel. 128 messages is plenty
/// for an interactive UI.
const CHANNEL_CAPACITY: usize = 128;

/// Bind the gateway socket and serve clients until the task is dropped.
pub async fn serve(conductor: Arc<Conductor>, socket_path: &Path) -> IoResult<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A previous run may have left the socket file behind.
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(socket_path)?;
    info!("gateway listening on {}", socket_path.display());

    let mut next_client_id: u64 = 0;
    loop {
        let (stream, _addr) = listener.accept().await?;
        next_client_id += 1;
        tokio::spawn(handle_client(
            Arc::clone(&conductor),
            stream,
            next_client_id,
        ));
    }
}

async fn handle_client(conductor: Arc<Conductor>, stream: UnixStream, client_id: u64) {
    debug!("gateway client {client_id} connected");
    let (read_half, mut write_half) = stream.into_split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);

    // Writer task: serialize outgoing messages, one JSON object per line.
    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if write_half.write_all(json.as_bytes()).await.is_err() {
                        break;
                    }
                    if write_half.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if write_half.flush().await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to serialize outgoing message: {e}"),
            }
        }
    });

    // Event fan-out: every client sees requested/resolved notifications.
    let events_handle = tokio::spawn({
        let outgoing_tx = outgoing_tx.clone();
        let mut events = conductor.subscribe_events();
        async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if outgoing_tx.send(notification_for(&event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("gateway client {client_id} lagged; dropped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    let processor = MessageProcessor::new(conductor, outgoing_tx, client_id);
    let reader = BufReader::new(read_half);
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcRequest>(&line) {
                    Ok(request) => processor.process_request(request),
                    Err(e) => warn!("gateway client {client_id}: bad frame: {e}"),
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    events_handle.abort();
    drop(processor);
    let _ = writer_handle.await;
    debug!("gateway client {client_id} disconnected");
}

fn notification_for(event: &ConductorEvent) -> JsonRpcMessage {
    match event {
        ConductorEvent::Requested(ev) => JsonRpcMessage::notification(
            NOTIFY_REQUESTED,
            serde_json::to_value(ev).unwrap_or_default(),
        ),
        ConductorEvent::Resolved(ev) => JsonRpcMessage::notification(
            NOTIFY_RESOLVED,
            serde_json::to_value(ev).unwrap_or_default(),
        ),
    }
}
