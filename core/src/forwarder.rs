//! Delivers authorization prompts to operator endpoints and relays the
//! operator's reply. The forwarder owns its own pending set and per-request
//! timers; the orchestrator's pending map is the source of truth for
//! resolution, so a timer firing after another path won is harmless.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use conductor_protocol::protocol::AccessRequest;
use conductor_protocol::protocol::AuthTarget;
use conductor_protocol::protocol::Authorization;
use conductor_protocol::protocol::InboundMessage;
use conductor_protocol::protocol::Injection;
use conductor_protocol::protocol::OutboundMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::util::ellipsize;
use crate::util::lock;

/// How operator messages leave the process. The log-only variant is the
/// stub used when no messaging adapter is attached.
#[derive(Clone)]
pub enum DeliveryPlane {
    Log,
    Channel(mpsc::UnboundedSender<OutboundMessage>),
}

struct PendingForward {
    id: Uuid,
    short_id: String,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct ForwarderState {
    // Insertion order matters: "first matched pending request" is defined
    // against it.
    pending: Vec<PendingForward>,
    subscribers: Vec<mpsc::UnboundedSender<Authorization>>,
}

pub struct Forwarder {
    targets: Vec<AuthTarget>,
    timeout: Duration,
    plane: DeliveryPlane,
    state: Arc<Mutex<ForwarderState>>,
}

impl Forwarder {
    pub fn new(config: &AuthConfig, plane: DeliveryPlane) -> Self {
        Self {
            targets: config.targets.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            plane,
            state: Arc::new(Mutex::new(ForwarderState::default())),
        }
    }

    /// Format and best-effort deliver the authorization prompt to every
    /// target, then register the request and its timeout timer. Delivery
    /// failures are logged and never abort the request.
    pub fn request_authorization(&self, request: &AccessRequest) {
        let body = format_request_message(request, self.timeout);
        self.deliver(&body);

        let timer = tokio::spawn({
            let state = Arc::clone(&self.state);
            let id = request.id;
            let timeout = self.timeout;
            async move {
                tokio::time::sleep(timeout).await;
                let fired = {
                    let mut st = lock(&state);
                    let before = st.pending.len();
                    st.pending.retain(|p| p.id != id);
                    st.pending.len() != before
                };
                if fired {
                    emit(&state, Authorization::timed_out(id));
                }
            }
        });
        let mut st = lock(&self.state);
        st.pending.push(PendingForward {
            id: request.id,
            short_id: request.short_id().to_lowercase(),
            timer,
        });
    }

    /// Match one inbound operator message against the pending set. At most
    /// one pending request resolves per message; the resulting authorization
    /// is broadcast to subscribers and returned.
    pub fn handle_inbound(&self, msg: &InboundMessage) -> Option<Authorization> {
        let text = msg.text.trim().to_lowercase();
        if text.is_empty() {
            return None;
        }
        let is_approval = matches!(text.as_str(), "yes" | "approve" | "go" | "y")
            || text.starts_with("yes ")
            || text.starts_with("approve ");
        let is_denial =
            matches!(text.as_str(), "no" | "deny" | "n") || text.starts_with("no ");

        let (entry, matched_id) = {
            let mut st = lock(&self.state);
            let matched_pos = st.pending.iter().position(|p| text.contains(&p.short_id));
            let pos = match matched_pos {
                Some(pos) => pos,
                None if st.pending.len() == 1 && (is_approval || is_denial) => 0,
                None => return None,
            };
            let entry = st.pending.remove(pos);
            entry.timer.abort();
            (entry, matched_pos.is_some())
        };

        let resolved_by = format!("{}:{}", msg.channel, msg.from);
        let approve = is_approval || (matched_id && !is_denial);
        let auth = if approve {
            // Classification ran on the lowered text; the instructions keep
            // the sender's original casing.
            let instructions = instructions_suffix(msg.text.trim());
            Authorization::approved(entry.id, resolved_by, instructions)
        } else {
            Authorization::denied(entry.id, resolved_by)
        };
        emit(&self.state, auth.clone());
        Some(auth)
    }

    /// Informational outcome message; best-effort, payload preview capped
    /// at 200 characters.
    pub fn notify_result(&self, request: &AccessRequest, injection: &Injection) {
        let status = if injection.success { "SUCCESS" } else { "FAILED" };
        let body = format!(
            "AETHER CONDUCTOR — Result [{}] {}\n\nRequest: {}\n{}",
            request.short_id(),
            status,
            request.summary,
            ellipsize(&injection.payload, 200),
        );
        self.deliver(&body);
    }

    /// Subscribe to authorization decisions (operator replies and
    /// timeouts). Dropping the receiver unsubscribes; closed subscribers
    /// are pruned on the next emit.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Authorization> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).subscribers.push(tx);
        rx
    }

    /// Called by the orchestrator when another path resolved the request;
    /// cancels the timer and forgets the pending entry.
    pub fn settle(&self, id: Uuid) {
        let mut st = lock(&self.state);
        if let Some(pos) = st.pending.iter().position(|p| p.id == id) {
            let entry = st.pending.remove(pos);
            entry.timer.abort();
        }
    }

    /// Cancel all timers and drop all subscribers and pending entries.
    pub fn stop(&self) {
        let mut st = lock(&self.state);
        for entry in st.pending.drain(..) {
            entry.timer.abort();
        }
        st.subscribers.clear();
    }

    fn deliver(&self, body: &str) {
        if self.targets.is_empty() {
            tracing::info!("no auth targets configured; operator message:\n{body}");
            return;
        }
        for target in &self.targets {
            match &self.plane {
                DeliveryPlane::Log => {
                    tracing::info!(
                        channel = %target.channel,
                        to = %target.to,
                        "operator message:\n{body}"
                    );
                }
                DeliveryPlane::Channel(tx) => {
                    if tx
                        .send(OutboundMessage {
                            target: target.clone(),
                            body: body.to_string(),
                        })
                        .is_err()
                    {
                        tracing::warn!(
                            channel = %target.channel,
                            to = %target.to,
                            "failed to deliver operator message"
                        );
                    }
                }
            }
        }
    }
}

fn emit(state: &Mutex<ForwarderState>, auth: Authorization) {
    let mut st = lock(state);
    st.subscribers.retain(|tx| tx.send(auth.clone()).is_ok());
}

/// Instructions are the remainder after a leading `yes ` or `approve `.
fn instructions_suffix(original: &str) -> Option<String> {
    let lowered = original.to_lowercase();
    let rest = if lowered.starts_with("yes ") {
        &original[4..]
    } else if lowered.starts_with("approve ") {
        &original[8..]
    } else {
        return None;
    };
    let rest = rest.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

pub(crate) fn format_request_message(request: &AccessRequest, timeout: Duration) -> String {
    let mut body = format!(
        "AETHER CONDUCTOR — Authorization Request [{}]\n\nClaude needs external access:\n  Kind: {}\n  Summary: {}\n",
        request.short_id(),
        request.kind,
        request.summary,
    );
    if let Some(url) = &request.url {
        body.push_str(&format!("  URL: {url}\n"));
    }
    if let Some(service) = &request.service {
        body.push_str(&format!("  Service: {service}\n"));
    }
    if let Some(data_needed) = &request.data_needed {
        body.push_str(&format!("  Data needed: {data_needed}\n"));
    }
    body.push_str(&format!(
        "\nReply \"YES\" to approve, \"NO\" to deny.\nReply \"YES <instructions>\" to approve with extra guidance.\nExpires in {}s.",
        timeout.as_secs()
    ));
    body
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::Utc;
    use conductor_protocol::protocol::Decision;
    use conductor_protocol::protocol::RequestKind;
    use pretty_assertions::assert_eq;

    fn request() -> AccessRequest {
        let created_at = Utc::now();
        AccessRequest {
            id: Uuid::new_v4(),
            kind: RequestKind::CredentialFetch,
            summary: "Fetch credentials from Vercel".to_string(),
            raw_output: "I need the API_KEY from Vercel to continue.".to_string(),
            url: None,
            service: Some("Vercel".to_string()),
            data_needed: Some("API_KEY".to_string()),
            suggested_actions: Vec::new(),
            created_at,
            expires_at: created_at + chrono::Duration::milliseconds(120_000),
            session: None,
        }
    }

    fn inbound(text: &str) -> InboundMessage {
        InboundMessage {
            channel: "telegram".to_string(),
            from: "alice".to_string(),
            text: text.to_string(),
        }
    }

    fn forwarder(timeout_ms: u64) -> Forwarder {
        Forwarder::new(
            &AuthConfig {
                timeout_ms,
                ..AuthConfig::default()
            },
            DeliveryPlane::Log,
        )
    }

    #[test]
    fn request_message_matches_template() {
        let req = request();
        let body = format_request_message(&req, Duration::from_millis(120_000));
        let expected = format!(
            "AETHER CONDUCTOR — Authorization Request [{}]\n\nClaude needs external access:\n  Kind: credential-fetch\n  Summary: Fetch credentials from Vercel\n  Service: Vercel\n  Data needed: API_KEY\n\nReply \"YES\" to approve, \"NO\" to deny.\nReply \"YES <instructions>\" to approve with extra guidance.\nExpires in 120s.",
            req.short_id()
        );
        assert_eq!(body, expected);
    }

    #[tokio::test]
    async fn single_pending_resolves_on_bare_yes() {
        let fwd = forwarder(60_000);
        let req = request();
        fwd.request_authorization(&req);

        let auth = fwd.handle_inbound(&inbound("YES")).unwrap();
        assert_eq!(auth.request_id, req.id);
        assert_eq!(auth.decision, Decision::Approve);
        assert_eq!(auth.resolved_by, "telegram:alice");
        fwd.stop();
    }

    #[tokio::test]
    async fn yes_with_suffix_carries_instructions() {
        let fwd = forwarder(60_000);
        let req = request();
        fwd.request_authorization(&req);

        let auth = fwd.handle_inbound(&inbound("yes Only Fetch The Key")).unwrap();
        assert_eq!(auth.decision, Decision::ApproveWithInstructions);
        assert_eq!(auth.instructions.as_deref(), Some("Only Fetch The Key"));
        fwd.stop();
    }

    #[tokio::test]
    async fn short_id_match_resolves_among_many() {
        let fwd = forwarder(60_000);
        let first = request();
        let second = request();
        fwd.request_authorization(&first);
        fwd.request_authorization(&second);

        let auth = fwd
            .handle_inbound(&inbound(&format!("approve {}", second.short_id())))
            .unwrap();
        assert_eq!(auth.request_id, second.id);
        assert!(auth.is_approval());

        // With two left... one left now; an unmatched denial still resolves it.
        let auth = fwd.handle_inbound(&inbound("no")).unwrap();
        assert_eq!(auth.request_id, first.id);
        assert_eq!(auth.decision, Decision::Deny);
        fwd.stop();
    }

    #[tokio::test]
    async fn ambiguous_reply_with_multiple_pending_is_ignored() {
        let fwd = forwarder(60_000);
        fwd.request_authorization(&request());
        fwd.request_authorization(&request());
        assert!(fwd.handle_inbound(&inbound("yes")).is_none());
        fwd.stop();
    }

    #[tokio::test]
    async fn unrelated_chatter_is_ignored() {
        let fwd = forwarder(60_000);
        fwd.request_authorization(&request());
        assert!(fwd.handle_inbound(&inbound("how is it going?")).is_none());
        fwd.stop();
    }

    #[tokio::test]
    async fn short_id_match_without_denial_approves() {
        let fwd = forwarder(60_000);
        let req = request();
        fwd.request_authorization(&req);
        let auth = fwd
            .handle_inbound(&inbound(&format!("ok {} sounds fine", req.short_id())))
            .unwrap();
        assert_eq!(auth.decision, Decision::Approve);
        assert_eq!(auth.instructions, None);
        fwd.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_emits_denial_to_subscribers() {
        let fwd = forwarder(500);
        let mut decisions = fwd.subscribe();
        let req = request();
        let started = tokio::time::Instant::now();
        fwd.request_authorization(&req);

        let auth = decisions.recv().await.unwrap();
        let elapsed = started.elapsed();
        assert_eq!(auth.request_id, req.id);
        assert_eq!(auth.decision, Decision::Deny);
        assert!(auth.is_timeout());
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(1_500));

        // The entry is gone; a late reply matches nothing.
        assert!(fwd.handle_inbound(&inbound("yes")).is_none());
        fwd.stop();
    }

    #[tokio::test]
    async fn settle_cancels_the_timer() {
        let fwd = forwarder(50);
        let mut decisions = fwd.subscribe();
        let req = request();
        fwd.request_authorization(&req);
        fwd.settle(req.id);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(decisions.try_recv().is_err());
        fwd.stop();
    }

    #[tokio::test]
    async fn notify_result_truncates_preview() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fwd = Forwarder::new(
            &AuthConfig {
                targets: vec![AuthTarget {
                    channel: "telegram".to_string(),
                    to: "ops".to_string(),
                    account_id: None,
                    thread_id: None,
                }],
                ..AuthConfig::default()
            },
            DeliveryPlane::Channel(tx),
        );
        let req = request();
        let injection = Injection {
            request_id: req.id,
            success: true,
            payload: "p".repeat(400),
            action_results: Vec::new(),
            injected_at: Utc::now(),
        };
        fwd.notify_result(&req, &injection);
        let msg = rx.try_recv().unwrap();
        assert!(msg.body.starts_with(&format!(
            "AETHER CONDUCTOR — Result [{}] SUCCESS",
            req.short_id()
        )));
        assert!(msg.body.contains("Request: Fetch credentials from Vercel"));
        assert!(msg.body.ends_with('…'));
        fwd.stop();
    }
}
