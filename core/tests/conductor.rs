//! End-to-end tests wrapping a scripted `sh` worker.

#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use conductor_core::conductor::Conductor;
use conductor_core::conductor::ConductorPlanes;
use conductor_core::conductor::GatewayRequestParams;
use conductor_core::config::AnalyzerProvider;
use conductor_core::config::Config;
use conductor_core::error::ConductorErr;
use conductor_core::executor::BrowserCommand;
use conductor_core::executor::BrowserPlane;
use conductor_core::executor::BrowserStatus;
use conductor_core::protocol::ActionResult;
use conductor_core::protocol::BrowserAction;
use conductor_core::protocol::ConductorEvent;
use conductor_core::protocol::Decision;
use conductor_core::protocol::HistoryEntry;
use conductor_core::protocol::InboundMessage;
use conductor_core::protocol::RequestKind;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

fn test_config(script: &str, timeout_ms: u64, dir: &TempDir) -> Config {
    let mut config = Config {
        enabled: true,
        wrapped_command: "sh".to_string(),
        wrapped_args: vec!["-c".to_string(), script.to_string()],
        buffer_flush_interval_ms: 100,
        audit_log: true,
        audit_log_path: dir.path().join("audit.jsonl"),
        gateway_socket_path: None,
        ..Config::default()
    };
    config.analyzer.provider = AnalyzerProvider::Regex;
    config.auth.timeout_ms = timeout_ms;
    config
}

/// A worker that prints one line and then swallows injected stdin until the
/// conductor shuts it down.
fn echo_then_idle(line: &str) -> String {
    format!("echo '{line}'; cat >/dev/null")
}

async fn next_event(
    rx: &mut broadcast::Receiver<ConductorEvent>,
    what: &str,
) -> ConductorEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("event channel closed")
}

async fn wait_for_history(conductor: &Conductor, len: usize) -> Vec<HistoryEntry> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let history = conductor.history(None).await.unwrap();
        if history.len() >= len {
            return history;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "history never reached {len} entries"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn operator(text: &str) -> InboundMessage {
    InboundMessage {
        channel: "telegram".to_string(),
        from: "alice".to_string(),
        text: text.to_string(),
    }
}

/// Automation plane that succeeds on everything.
fn fake_browser_plane() -> BrowserPlane {
    let (tx, mut rx) = mpsc::channel::<BrowserCommand>(16);
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                BrowserCommand::Status { reply } => {
                    let _ = reply.send(BrowserStatus { running: true });
                }
                BrowserCommand::Start { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
                BrowserCommand::Perform { action, reply } => {
                    let result = match &action {
                        BrowserAction::ExtractText { .. } => ActionResult::ok(
                            action.clone(),
                            Some("DATABASE_URL=postgres://db".to_string()),
                            None,
                        ),
                        BrowserAction::Screenshot { .. } => ActionResult::ok(
                            action.clone(),
                            None,
                            Some("/tmp/capture.png".to_string()),
                        ),
                        _ => ActionResult::ok(action.clone(), None, None),
                    };
                    let _ = reply.send(result);
                }
            }
        }
    });
    BrowserPlane::External(tx)
}

#[tokio::test]
async fn detected_request_is_denied_by_operator() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &echo_then_idle("Please go to https://railway.app/dashboard to get the DB URL."),
        60_000,
        &dir,
    );
    let conductor = Conductor::spawn(config, ConductorPlanes::default(), false).unwrap();
    let mut events = conductor.subscribe_events();

    let ConductorEvent::Requested(requested) = next_event(&mut events, "requested").await else {
        panic!("expected a requested event");
    };
    assert_eq!(requested.kind, RequestKind::UrlVisit);
    assert_eq!(requested.url.as_deref(), Some("https://railway.app/dashboard"));

    let auth = conductor.submit_operator_reply(&operator("no")).unwrap();
    assert_eq!(auth.decision, Decision::Deny);
    assert_eq!(auth.resolved_by, "telegram:alice");

    let history = wait_for_history(&conductor, 1).await;
    let entry = &history[0];
    assert_eq!(
        entry.authorization.as_ref().unwrap().decision,
        Decision::Deny
    );
    let injection = entry.injection.as_ref().unwrap();
    assert_eq!(
        injection.payload,
        "[Aether] Request denied: Visit https://railway.app/dashboard — operator denied. Proceeding without external access."
    );
    assert!(!injection.success);

    conductor.stop();
    conductor.wait().await;
}

#[tokio::test]
async fn approved_request_executes_and_injects_results() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &echo_then_idle("Please go to https://railway.app/dashboard to get the DB URL."),
        60_000,
        &dir,
    );
    let planes = ConductorPlanes {
        browser: fake_browser_plane(),
        ..ConductorPlanes::default()
    };
    let conductor = Conductor::spawn(config, planes, false).unwrap();
    let mut events = conductor.subscribe_events();

    next_event(&mut events, "requested").await;
    conductor.submit_operator_reply(&operator("yes")).unwrap();

    let ConductorEvent::Resolved(resolved) = next_event(&mut events, "resolved").await else {
        panic!("expected a resolved event");
    };
    assert_eq!(resolved.decision, Decision::Approve);

    let history = wait_for_history(&conductor, 1).await;
    let injection = history[0].injection.as_ref().unwrap();
    assert!(injection.success);
    assert!(injection.payload.starts_with(
        "[Aether] External access result for: Visit https://railway.app/dashboard"
    ));
    assert!(injection.payload.contains("Navigated to https://railway.app/dashboard"));
    assert!(injection.payload.contains("DATABASE_URL=postgres://db"));
    // navigate + screenshot + extract-text from the suggested actions.
    assert_eq!(injection.action_results.len(), 3);

    conductor.stop();
    conductor.wait().await;
}

#[tokio::test]
async fn unanswered_request_times_out_as_denial() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &echo_then_idle("Please open the Railway dashboard and find the database URL."),
        500,
        &dir,
    );
    let conductor = Conductor::spawn(config, ConductorPlanes::default(), false).unwrap();
    let mut events = conductor.subscribe_events();

    let ConductorEvent::Requested(requested) = next_event(&mut events, "requested").await else {
        panic!("expected a requested event");
    };
    assert_eq!(requested.kind, RequestKind::ServiceAction);

    let ConductorEvent::Resolved(resolved) = next_event(&mut events, "resolved").await else {
        panic!("expected a resolved event");
    };
    assert_eq!(resolved.decision, Decision::Deny);
    assert_eq!(resolved.resolved_by.as_deref(), Some("timeout"));

    let history = wait_for_history(&conductor, 1).await;
    let entry = &history[0];
    let auth = entry.authorization.as_ref().unwrap();
    assert!(auth.is_timeout());
    let waited = auth.resolved_at - entry.request.created_at;
    assert!(waited >= chrono::Duration::milliseconds(500), "waited {waited}");
    assert!(waited < chrono::Duration::milliseconds(3_000), "waited {waited}");
    assert_eq!(
        entry.injection.as_ref().unwrap().payload,
        "[Aether] Authorization timed out for: Open the Railway dashboard. Proceeding without external access."
    );

    conductor.stop();
    conductor.wait().await;
}

#[tokio::test]
async fn ordinary_build_output_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        "printf 'Compiling TypeScript...\\nBuild succeeded in 2.3s\\n42 modules compiled.\\n'; cat >/dev/null",
        60_000,
        &dir,
    );
    let conductor = Conductor::spawn(config, ConductorPlanes::default(), false).unwrap();

    // Give the flush timer a couple of cycles to run the analyzer.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let status = conductor.status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.history_count, 0);

    conductor.stop();
    conductor.wait().await;
}

#[tokio::test]
async fn auto_deny_pattern_short_circuits_the_operator() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(
        &echo_then_idle("Visit https://evil.example/steal"),
        60_000,
        &dir,
    );
    config.auth.auto_deny_patterns = vec!["https://evil.example/*".to_string()];
    // The same URL also auto-approves; deny must win.
    config.auth.auto_approve_patterns = vec!["https://evil.example/*".to_string()];
    let conductor = Conductor::spawn(config, ConductorPlanes::default(), false).unwrap();
    let mut events = conductor.subscribe_events();

    let history = wait_for_history(&conductor, 1).await;
    let entry = &history[0];
    let auth = entry.authorization.as_ref().unwrap();
    assert_eq!(auth.decision, Decision::Deny);
    assert_eq!(auth.resolved_by, "auto-deny");
    assert!(entry.injection.as_ref().unwrap().payload.contains("Request denied"));

    // The fast path never created a pending entry or an operator prompt.
    let status = conductor.status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    conductor.stop();
    conductor.wait().await;
}

#[tokio::test]
async fn gateway_request_resolves_once_and_only_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("cat >/dev/null", 60_000, &dir);
    let conductor = Arc::new(Conductor::spawn(config, ConductorPlanes::default(), false).unwrap());
    let mut events = conductor.subscribe_events();

    let waiter = tokio::spawn({
        let conductor = Arc::clone(&conductor);
        async move {
            conductor
                .request(GatewayRequestParams {
                    summary: Some("open portal".to_string()),
                    url: Some("https://x.test".to_string()),
                    timeout_ms: Some(10_000),
                    ..GatewayRequestParams::default()
                })
                .await
        }
    });

    let ConductorEvent::Requested(requested) = next_event(&mut events, "requested").await else {
        panic!("expected a requested event");
    };
    assert_eq!(requested.summary, "open portal");

    conductor
        .resolve(requested.id, Decision::Approve, None, "gateway:client-2")
        .await
        .unwrap();

    let auth = waiter.await.unwrap().unwrap();
    assert_eq!(auth.decision, Decision::Approve);
    assert_eq!(auth.resolved_by, "gateway:client-2");

    // Late duplicate resolve: the pending entry is gone.
    let err = conductor
        .resolve(requested.id, Decision::Approve, None, "gateway:client-3")
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorErr::UnknownRequestId(_)));

    // Gateway-initiated requests never inject into the worker.
    let history = wait_for_history(&conductor, 1).await;
    assert!(history[0].injection.is_none());
    let status = conductor.status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.history_count, 1);

    conductor.stop();
    conductor.wait().await;
}

#[tokio::test]
async fn gateway_request_requires_summary_or_url() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("cat >/dev/null", 60_000, &dir);
    let conductor = Conductor::spawn(config, ConductorPlanes::default(), false).unwrap();
    let err = conductor
        .request(GatewayRequestParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorErr::InvalidRequest(_)));
    conductor.stop();
    conductor.wait().await;
}

#[tokio::test]
async fn gateway_request_times_out_as_denial() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("cat >/dev/null", 60_000, &dir);
    let conductor = Conductor::spawn(config, ConductorPlanes::default(), false).unwrap();

    let auth = conductor
        .request(GatewayRequestParams {
            summary: Some("open portal".to_string()),
            timeout_ms: Some(300),
            ..GatewayRequestParams::default()
        })
        .await
        .unwrap();
    assert_eq!(auth.decision, Decision::Deny);
    assert!(auth.is_timeout());

    conductor.stop();
    conductor.wait().await;
}

#[tokio::test]
async fn conductor_reports_the_child_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("exit 7", 60_000, &dir);
    let conductor = Conductor::spawn(config, ConductorPlanes::default(), false).unwrap();
    assert_eq!(conductor.wait().await, 7);
}

#[tokio::test]
async fn audit_log_records_the_request_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let config = test_config(
        &echo_then_idle("Please go to https://railway.app/dashboard to get the DB URL."),
        60_000,
        &dir,
    );
    let conductor = Conductor::spawn(config, ConductorPlanes::default(), false).unwrap();
    let mut events = conductor.subscribe_events();
    next_event(&mut events, "requested").await;
    conductor.submit_operator_reply(&operator("no")).unwrap();
    wait_for_history(&conductor, 1).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let events_seen = loop {
        let contents = std::fs::read_to_string(&audit_path).unwrap_or_default();
        let events_seen: Vec<String> = contents
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|v| v["event"].as_str().map(str::to_string))
            .collect();
        if events_seen.len() >= 4 || tokio::time::Instant::now() > deadline {
            break events_seen;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(
        events_seen,
        vec![
            "started".to_string(),
            "request-detected".to_string(),
            "authorization-received".to_string(),
            "injection".to_string(),
        ]
    );

    conductor.stop();
    conductor.wait().await;
}
