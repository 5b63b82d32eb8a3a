//! The orchestrator joining interceptor, analyzer, forwarder, executor, and
//! injector. One task owns the pending map and the history list and consumes
//! a submission queue of ops; every resolution path (operator reply, gateway
//! resolve, auto-rule, timeout) funnels into the same handler, which removes
//! the pending entry before acting so each request resolves at most once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use conductor_protocol::protocol::AccessRequest;
use conductor_protocol::protocol::Authorization;
use conductor_protocol::protocol::ConductorEvent;
use conductor_protocol::protocol::Decision;
use conductor_protocol::protocol::HistoryEntry;
use conductor_protocol::protocol::InboundMessage;
use conductor_protocol::protocol::Injection;
use conductor_protocol::protocol::RequestKind;
use conductor_protocol::protocol::StatusSnapshot;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::analyzer::Analyzer;
use crate::analyzer::DetectedRequest;
use crate::audit::AuditRecorder;
use crate::auto_rules;
use crate::auto_rules::AutoRule;
use crate::config::AuthConfig;
use crate::config::Config;
use crate::error::ConductorErr;
use crate::error::Result;
use crate::executor::BrowserPlane;
use crate::executor::Executor;
use crate::forwarder::DeliveryPlane;
use crate::forwarder::Forwarder;
use crate::injector;
use crate::interceptor::Interceptor;
use crate::interceptor::InterceptorEvent;
use crate::util::ellipsize;
use crate::util::lock;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// External collaborators plugged into the conductor. The defaults are the
/// first-class stubs: a log-only messaging plane and a disabled browser.
pub struct ConductorPlanes {
    pub messaging: DeliveryPlane,
    pub browser: BrowserPlane,
}

impl Default for ConductorPlanes {
    fn default() -> Self {
        Self {
            messaging: DeliveryPlane::Log,
            browser: BrowserPlane::Disabled,
        }
    }
}

/// Parameters of a gateway-initiated (`conductor.request`) authorization.
#[derive(Debug, Default, Clone)]
pub struct GatewayRequestParams {
    pub kind: Option<RequestKind>,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub service: Option<String>,
    pub data_needed: Option<String>,
    pub timeout_ms: Option<u64>,
}

enum Op {
    Flush(String),
    Decision(Authorization),
    GatewayRequest {
        request: AccessRequest,
        reply: oneshot::Sender<Authorization>,
    },
    Resolve {
        id: Uuid,
        decision: Decision,
        instructions: Option<String>,
        resolved_by: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Expire {
        id: Uuid,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    History {
        limit: usize,
        reply: oneshot::Sender<Vec<HistoryEntry>>,
    },
    ChildExit {
        code: i32,
    },
    Shutdown,
}

/// Handle to a running conductor instance. Cheap to share behind an `Arc`;
/// all mutation happens inside the orchestrator task.
pub struct Conductor {
    ops_tx: mpsc::UnboundedSender<Op>,
    events_tx: broadcast::Sender<ConductorEvent>,
    forwarder: Arc<Forwarder>,
    exit_rx: Mutex<Option<oneshot::Receiver<i32>>>,
    default_timeout_ms: u64,
}

impl Conductor {
    /// Spawn the wrapped worker and the orchestrator task. Fails only when
    /// the child cannot be started.
    pub fn spawn(
        config: Config,
        planes: ConductorPlanes,
        forward_host_stdin: bool,
    ) -> Result<Self> {
        let (interceptor_tx, mut interceptor_rx) = mpsc::unbounded_channel();
        let interceptor = Arc::new(Interceptor::spawn(
            &config,
            interceptor_tx,
            forward_host_stdin,
        )?);

        let audit = if config.audit_log {
            match AuditRecorder::new(&config.audit_log_path) {
                Ok(recorder) => recorder,
                Err(e) => {
                    tracing::warn!(
                        "failed to open audit log {}: {e}; continuing without audit",
                        config.audit_log_path.display()
                    );
                    AuditRecorder::disabled()
                }
            }
        } else {
            AuditRecorder::disabled()
        };

        let forwarder = Arc::new(Forwarder::new(&config.auth, planes.messaging));
        let executor = Executor::new(&config.browser, planes.browser);
        let analyzer = Analyzer::from_config(&config.analyzer);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        // Interceptor events feed the submission queue.
        tokio::spawn({
            let ops_tx = ops_tx.clone();
            async move {
                while let Some(event) = interceptor_rx.recv().await {
                    match event {
                        InterceptorEvent::Flush(text) => {
                            if ops_tx.send(Op::Flush(text)).is_err() {
                                break;
                            }
                        }
                        InterceptorEvent::Exit { code, signal } => {
                            tracing::debug!("worker exited (code {code}, signal {signal:?})");
                            let _ = ops_tx.send(Op::ChildExit { code });
                            break;
                        }
                        InterceptorEvent::Error(message) => {
                            tracing::warn!("interceptor: {message}");
                        }
                        InterceptorEvent::Output(_) => {}
                    }
                }
            }
        });

        // Forwarder decisions (operator replies and timeouts) likewise.
        tokio::spawn({
            let ops_tx = ops_tx.clone();
            let mut decisions = forwarder.subscribe();
            async move {
                while let Some(auth) = decisions.recv().await {
                    if ops_tx.send(Op::Decision(auth)).is_err() {
                        break;
                    }
                }
            }
        });

        let orchestrator = Orchestrator {
            analyzer,
            executor,
            forwarder: Arc::clone(&forwarder),
            interceptor: Arc::clone(&interceptor),
            audit,
            events_tx: events_tx.clone(),
            ops_tx: ops_tx.clone(),
            auth_cfg: config.auth.clone(),
            threshold: config.analyzer.confidence_threshold,
            command_line: std::iter::once(config.wrapped_command.clone())
                .chain(config.wrapped_args.iter().cloned())
                .collect(),
            pending: HashMap::new(),
            history: Vec::new(),
            exit_tx: Some(exit_tx),
            stopping: false,
        };
        tokio::spawn(orchestrator.run(ops_rx));

        Ok(Self {
            ops_tx,
            events_tx,
            forwarder,
            exit_rx: Mutex::new(Some(exit_rx)),
            default_timeout_ms: config.auth.timeout_ms,
        })
    }

    /// Feed an inbound operator message to the matching logic. Returns the
    /// resulting authorization, if the message resolved a pending request.
    pub fn submit_operator_reply(&self, msg: &InboundMessage) -> Option<Authorization> {
        self.forwarder.handle_inbound(msg)
    }

    /// Server-initiated authorization: registers a request in the shared
    /// pending store and waits for a `resolve` call or the timeout.
    pub async fn request(&self, params: GatewayRequestParams) -> Result<Authorization> {
        if params.summary.is_none() && params.url.is_none() {
            return Err(ConductorErr::InvalidRequest(
                "at least one of summary or url is required".to_string(),
            ));
        }
        let timeout_ms = params.timeout_ms.unwrap_or(self.default_timeout_ms);
        let created_at = Utc::now();
        let summary = params
            .summary
            .or_else(|| params.url.as_ref().map(|url| format!("Visit {url}")))
            .unwrap_or_default();
        let request = AccessRequest {
            id: Uuid::new_v4(),
            kind: params.kind.unwrap_or_default(),
            summary,
            raw_output: String::new(),
            url: params.url,
            service: params.service,
            data_needed: params.data_needed,
            suggested_actions: Vec::new(),
            created_at,
            expires_at: created_at + chrono::Duration::milliseconds(timeout_ms as i64),
            session: None,
        };
        let (reply, rx) = oneshot::channel();
        self.ops_tx
            .send(Op::GatewayRequest { request, reply })
            .map_err(|_| ConductorErr::LoopTerminated)?;
        rx.await.map_err(|_| ConductorErr::LoopTerminated)
    }

    /// Resolve a pending request by id. Unknown ids are an error; the
    /// decision constructors keep the instructions invariant.
    pub async fn resolve(
        &self,
        id: Uuid,
        decision: Decision,
        instructions: Option<String>,
        resolved_by: impl Into<String>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.ops_tx
            .send(Op::Resolve {
                id,
                decision,
                instructions,
                resolved_by: resolved_by.into(),
                reply,
            })
            .map_err(|_| ConductorErr::LoopTerminated)?;
        rx.await.map_err(|_| ConductorErr::LoopTerminated)?
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.ops_tx
            .send(Op::Status { reply })
            .map_err(|_| ConductorErr::LoopTerminated)?;
        rx.await.map_err(|_| ConductorErr::LoopTerminated)
    }

    /// Last `limit` history entries (default 50).
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let (reply, rx) = oneshot::channel();
        self.ops_tx
            .send(Op::History {
                limit: limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
                reply,
            })
            .map_err(|_| ConductorErr::LoopTerminated)?;
        rx.await.map_err(|_| ConductorErr::LoopTerminated)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConductorEvent> {
        self.events_tx.subscribe()
    }

    /// Request a graceful shutdown: timers are cancelled and the child gets
    /// SIGTERM with a 5-second escalation to a forced kill. The exit code
    /// still arrives through [`Conductor::wait`].
    pub fn stop(&self) {
        let _ = self.ops_tx.send(Op::Shutdown);
    }

    /// Wait for the wrapped child to exit and return its exit code. May be
    /// awaited once; later calls return -1.
    pub async fn wait(&self) -> i32 {
        let rx = lock(&self.exit_rx).take();
        match rx {
            Some(rx) => rx.await.unwrap_or(-1),
            None => -1,
        }
    }
}

struct PendingEntry {
    request: AccessRequest,
    /// Present only for gateway-initiated requests, which resolve without
    /// execution or injection.
    waker: Option<oneshot::Sender<Authorization>>,
}

struct Orchestrator {
    analyzer: Analyzer,
    executor: Executor,
    forwarder: Arc<Forwarder>,
    interceptor: Arc<Interceptor>,
    audit: AuditRecorder,
    events_tx: broadcast::Sender<ConductorEvent>,
    ops_tx: mpsc::UnboundedSender<Op>,
    auth_cfg: AuthConfig,
    threshold: f32,
    command_line: Vec<String>,
    pending: HashMap<Uuid, PendingEntry>,
    history: Vec<HistoryEntry>,
    exit_tx: Option<oneshot::Sender<i32>>,
    stopping: bool,
}

impl Orchestrator {
    async fn run(mut self, mut ops_rx: mpsc::UnboundedReceiver<Op>) {
        self.audit
            .record("started", json!({ "command": self.command_line }))
            .await;

        while let Some(op) = ops_rx.recv().await {
            match op {
                Op::Flush(text) => self.on_flush(text).await,
                Op::Decision(auth) => self.resolve_request(auth).await,
                Op::GatewayRequest { request, reply } => {
                    self.on_gateway_request(request, reply).await;
                }
                Op::Resolve {
                    id,
                    decision,
                    instructions,
                    resolved_by,
                    reply,
                } => {
                    if self.pending.contains_key(&id) {
                        let auth = match decision {
                            Decision::Deny => Authorization::denied(id, resolved_by),
                            Decision::Approve | Decision::ApproveWithInstructions => {
                                Authorization::approved(id, resolved_by, instructions)
                            }
                        };
                        let _ = reply.send(Ok(()));
                        self.resolve_request(auth).await;
                    } else {
                        let _ = reply.send(Err(ConductorErr::UnknownRequestId(id)));
                    }
                }
                Op::Expire { id } => {
                    if self.pending.contains_key(&id) {
                        self.resolve_request(Authorization::timed_out(id)).await;
                    }
                }
                Op::Status { reply } => {
                    let pending: Vec<AccessRequest> =
                        self.pending.values().map(|e| e.request.clone()).collect();
                    let _ = reply.send(StatusSnapshot {
                        pending_count: pending.len(),
                        history_count: self.history.len(),
                        pending,
                    });
                }
                Op::History { limit, reply } => {
                    let start = self.history.len().saturating_sub(limit);
                    let _ = reply.send(self.history[start..].to_vec());
                }
                Op::Shutdown => {
                    if !self.stopping {
                        self.stopping = true;
                        self.forwarder.stop();
                        self.interceptor.stop();
                    }
                }
                Op::ChildExit { code } => {
                    self.finish(code);
                    break;
                }
            }
        }
        tracing::debug!("conductor loop exited");
    }

    async fn on_flush(&mut self, text: String) {
        let analysis = self.analyzer.analyze(&text).await;
        if !analysis.detected || analysis.confidence < self.threshold {
            return;
        }
        let Some(detected) = analysis.request else {
            return;
        };
        let request = self.build_request(detected, text);
        self.audit
            .record(
                "request-detected",
                json!({ "request": &request, "confidence": analysis.confidence }),
            )
            .await;

        if let Some(url) = request.url.clone() {
            match auto_rules::evaluate(&self.auth_cfg, &url) {
                Some(AutoRule::Deny) => {
                    self.audit
                        .record("auto-denied", json!({ "requestId": request.id, "url": url }))
                        .await;
                    let payload = injector::format_denial(&request.summary, "denied by policy");
                    let injection = injector::inject_payload(
                        &self.interceptor,
                        request.id,
                        payload,
                        false,
                        Vec::new(),
                    );
                    let auth = Authorization::denied(request.id, "auto-deny");
                    self.push_history(request, Some(auth), Some(injection)).await;
                    return;
                }
                Some(AutoRule::Approve) => {
                    self.audit
                        .record(
                            "auto-approved",
                            json!({ "requestId": request.id, "url": url }),
                        )
                        .await;
                    let auth = Authorization::approved(request.id, "auto-approve", None);
                    let _ = self
                        .events_tx
                        .send(ConductorEvent::Requested((&request).into()));
                    let _ = self.events_tx.send(ConductorEvent::Resolved((&auth).into()));
                    self.execute_and_inject(request, auth).await;
                    return;
                }
                None => {}
            }
        }

        self.pending.insert(
            request.id,
            PendingEntry {
                request: request.clone(),
                waker: None,
            },
        );
        // Register with the forwarder before broadcasting: a subscriber may
        // reply the moment it sees the event.
        self.forwarder.request_authorization(&request);
        let _ = self
            .events_tx
            .send(ConductorEvent::Requested((&request).into()));
    }

    async fn on_gateway_request(
        &mut self,
        request: AccessRequest,
        reply: oneshot::Sender<Authorization>,
    ) {
        self.audit
            .record(
                "request-detected",
                json!({ "request": &request, "source": "gateway" }),
            )
            .await;
        let timeout = (request.expires_at - request.created_at)
            .to_std()
            .unwrap_or(Duration::from_millis(self.auth_cfg.timeout_ms));
        let id = request.id;
        self.pending.insert(
            id,
            PendingEntry {
                request: request.clone(),
                waker: Some(reply),
            },
        );
        let _ = self
            .events_tx
            .send(ConductorEvent::Requested((&request).into()));
        let ops_tx = self.ops_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = ops_tx.send(Op::Expire { id });
        });
    }

    /// The single resolution point. Removing the pending entry first makes
    /// resolution at-most-once: whichever path loses the race finds nothing
    /// and becomes a no-op.
    async fn resolve_request(&mut self, auth: Authorization) {
        let Some(entry) = self.pending.remove(&auth.request_id) else {
            tracing::debug!(
                "ignoring decision for unknown or already-resolved request {}",
                auth.request_id
            );
            return;
        };
        self.forwarder.settle(auth.request_id);
        self.audit
            .record("authorization-received", json!({ "authorization": &auth }))
            .await;
        let _ = self.events_tx.send(ConductorEvent::Resolved((&auth).into()));

        if let Some(waker) = entry.waker {
            let _ = waker.send(auth.clone());
            self.push_history(entry.request, Some(auth), None).await;
            return;
        }

        if auth.is_approval() {
            self.execute_and_inject(entry.request, auth).await;
        } else {
            let payload = if auth.is_timeout() {
                injector::format_timeout(&entry.request.summary)
            } else {
                injector::format_denial(&entry.request.summary, "operator denied")
            };
            let injection = injector::inject_payload(
                &self.interceptor,
                entry.request.id,
                payload,
                false,
                Vec::new(),
            );
            self.push_history(entry.request, Some(auth), Some(injection))
                .await;
        }
    }

    async fn execute_and_inject(&mut self, request: AccessRequest, auth: Authorization) {
        let results = self.executor.execute(&request, &auth).await;
        let (payload, success) = injector::format_result_payload(&request, &results);
        let injection =
            injector::inject_payload(&self.interceptor, request.id, payload, success, results);
        self.forwarder.notify_result(&request, &injection);
        self.push_history(request, Some(auth), Some(injection)).await;
    }

    async fn push_history(
        &mut self,
        request: AccessRequest,
        authorization: Option<Authorization>,
        injection: Option<Injection>,
    ) {
        if let Some(injection) = &injection {
            self.audit
                .record(
                    "injection",
                    json!({
                        "requestId": injection.request_id,
                        "success": injection.success,
                        "payload": ellipsize(&injection.payload, 200),
                    }),
                )
                .await;
        }
        self.history.push(HistoryEntry {
            request,
            authorization,
            injection,
            completed_at: Utc::now(),
        });
    }

    fn build_request(&self, detected: DetectedRequest, raw_output: String) -> AccessRequest {
        let created_at = Utc::now();
        AccessRequest {
            id: Uuid::new_v4(),
            kind: detected.kind,
            summary: detected.summary,
            raw_output,
            url: detected.url,
            service: detected.service,
            data_needed: detected.data_needed,
            suggested_actions: detected.suggested_actions,
            created_at,
            expires_at: created_at
                + chrono::Duration::milliseconds(self.auth_cfg.timeout_ms as i64),
            session: None,
        }
    }

    fn finish(&mut self, code: i32) {
        self.forwarder.stop();
        // Pending requests are process-local and expire with the child;
        // dropping the wakers lets gateway waiters observe the shutdown.
        self.pending.clear();
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(code);
        }
    }
}
