//! Socket-level tests: two clients racing request and resolve.

#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::conductor::Conductor;
use conductor_core::conductor::ConductorPlanes;
use conductor_core::config::AnalyzerProvider;
use conductor_core::config::Config;
use serde_json::Value as JsonValue;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::unix::OwnedWriteHalf;

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
    /// Messages read while waiting for something else; later lookups scan
    /// this before touching the wire.
    stash: Vec<JsonValue>,
}

impl TestClient {
    async fn connect(path: &Path) -> Self {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("could not connect to gateway socket: {e}"),
            }
        };
        let (read_half, write_half) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            write: write_half,
            stash: Vec::new(),
        }
    }

    async fn send(&mut self, value: JsonValue) {
        let mut line = value.to_string();
        line.push('\n');
        self.write.write_all(line.as_bytes()).await.unwrap();
    }

    async fn next_message(&mut self) -> JsonValue {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a gateway message")
            .unwrap()
            .expect("gateway closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    async fn wait_for(&mut self, matches: impl Fn(&JsonValue) -> bool) -> JsonValue {
        if let Some(pos) = self.stash.iter().position(&matches) {
            return self.stash.remove(pos);
        }
        loop {
            let msg = self.next_message().await;
            if matches(&msg) {
                return msg;
            }
            self.stash.push(msg);
        }
    }

    /// The response (or error) for `id`, stashing unrelated traffic.
    async fn reply_for(&mut self, id: i64) -> JsonValue {
        self.wait_for(|msg| msg.get("id").and_then(JsonValue::as_i64) == Some(id))
            .await
    }

    /// The next notification for `method`, stashing unrelated traffic.
    async fn notification(&mut self, method: &str) -> JsonValue {
        self.wait_for(|msg| msg.get("method").and_then(JsonValue::as_str) == Some(method))
            .await
    }
}

fn test_config() -> Config {
    let mut config = Config {
        enabled: true,
        wrapped_command: "sh".to_string(),
        wrapped_args: vec!["-c".to_string(), "cat >/dev/null".to_string()],
        buffer_flush_interval_ms: 100,
        audit_log: false,
        gateway_socket_path: None,
        ..Config::default()
    };
    config.analyzer.provider = AnalyzerProvider::Regex;
    config
}

async fn start_gateway(dir: &TempDir) -> (Arc<Conductor>, std::path::PathBuf) {
    let conductor = Arc::new(
        Conductor::spawn(test_config(), ConductorPlanes::default(), false).unwrap(),
    );
    let socket_path = dir.path().join("conductor.sock");
    tokio::spawn({
        let conductor = Arc::clone(&conductor);
        let socket_path = socket_path.clone();
        async move {
            let _ = conductor_gateway::serve(conductor, &socket_path).await;
        }
    });
    (conductor, socket_path)
}

#[tokio::test]
async fn request_resolve_and_late_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let (conductor, socket_path) = start_gateway(&dir).await;

    let mut client_a = TestClient::connect(&socket_path).await;
    let mut client_b = TestClient::connect(&socket_path).await;

    // A status round-trip proves client B's connection task (and with it
    // the event subscription) is live before the request fires.
    client_b
        .send(json!({"jsonrpc": "2.0", "id": 100, "method": "conductor.status"}))
        .await;
    client_b.reply_for(100).await;

    client_a
        .send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "conductor.request",
            "params": {"summary": "open portal", "url": "https://x.test", "timeoutMs": 10_000},
        }))
        .await;

    // Client B learns about the request from the broadcast.
    let requested = client_b.notification("conductor.requested").await;
    let request_id = requested["params"]["id"].as_str().unwrap().to_string();
    assert_eq!(requested["params"]["summary"], "open portal");
    assert_eq!(requested["params"]["url"], "https://x.test");

    client_b
        .send(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "conductor.resolve",
            "params": {"id": request_id, "decision": "approve", "instructions": "check the header"},
        }))
        .await;
    let resolve_reply = client_b.reply_for(2).await;
    assert_eq!(resolve_reply["result"]["ok"], true);

    // Client A's blocked request resolves with the decision.
    let request_reply = client_a.reply_for(1).await;
    assert_eq!(request_reply["result"]["decision"], "approve-with-instructions");
    assert_eq!(request_reply["result"]["instructions"], "check the header");
    assert_eq!(request_reply["result"]["resolvedBy"], "gateway:client-2");

    // Both clients also observe the resolved broadcast.
    let resolved = client_a.notification("conductor.resolved").await;
    assert_eq!(resolved["params"]["id"].as_str().unwrap(), request_id);

    // A late duplicate resolve finds nothing pending.
    client_b
        .send(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "conductor.resolve",
            "params": {"id": request_id, "decision": "approve"},
        }))
        .await;
    let late = client_b.reply_for(3).await;
    assert_eq!(late["error"]["code"], -32001);

    conductor.stop();
    conductor.wait().await;
}

#[tokio::test]
async fn status_history_and_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let (conductor, socket_path) = start_gateway(&dir).await;
    let mut client = TestClient::connect(&socket_path).await;

    // A short self-answered round trip to populate history.
    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "conductor.request",
            "params": {"summary": "quick check", "timeoutMs": 200},
        }))
        .await;
    let reply = client.reply_for(1).await;
    assert_eq!(reply["result"]["decision"], "deny");
    assert_eq!(reply["result"]["resolvedBy"], "timeout");

    client
        .send(json!({"jsonrpc": "2.0", "id": 2, "method": "conductor.status"}))
        .await;
    let status = client.reply_for(2).await;
    assert_eq!(status["result"]["pendingCount"], 0);
    assert_eq!(status["result"]["historyCount"], 1);

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "conductor.history",
            "params": {"limit": 10},
        }))
        .await;
    let history = client.reply_for(3).await;
    assert_eq!(history["result"].as_array().unwrap().len(), 1);
    assert_eq!(history["result"][0]["request"]["summary"], "quick check");

    // Validation failures.
    client
        .send(json!({"jsonrpc": "2.0", "id": 4, "method": "conductor.request", "params": {}}))
        .await;
    assert_eq!(client.reply_for(4).await["error"]["code"], -32602);

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "conductor.resolve",
            "params": {"id": "9e0afb9c-7f9b-4a22-a4da-4b6f1a3c3a11", "decision": "maybe"},
        }))
        .await;
    assert_eq!(client.reply_for(5).await["error"]["code"], -32602);

    client
        .send(json!({"jsonrpc": "2.0", "id": 6, "method": "conductor.reboot"}))
        .await;
    assert_eq!(client.reply_for(6).await["error"]["code"], -32601);

    conductor.stop();
    conductor.wait().await;
}
