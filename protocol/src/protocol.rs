//! Defines the types exchanged between the conductor's components: detected
//! access requests, operator authorizations, browser actions and their
//! results, stdin injections, and the events broadcast to gateway clients.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use uuid::Uuid;

/// Resolver identity recorded when an authorization expires unanswered.
pub const RESOLVED_BY_TIMEOUT: &str = "timeout";

/// Category of external access the worker asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RequestKind {
    UrlVisit,
    CredentialFetch,
    ApiCheck,
    ServiceAction,
    FileDownload,
    Verification,
    #[default]
    Unknown,
}

/// A single recognised request for external access, extracted from the
/// worker's terminal output (or submitted through the gateway).
///
/// Ids are never reused within a process; `expires_at` is always strictly
/// after `created_at` because it is derived from it at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    pub id: Uuid,
    pub kind: RequestKind,
    /// Short human-readable description, used in operator prompts and
    /// injection payloads.
    pub summary: String,
    /// The terminal output the request was extracted from.
    pub raw_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_needed: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<BrowserAction>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Optional key identifying the worker session this request belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl AccessRequest {
    /// First 8 hex characters of the id, as shown in operator messages and
    /// matched against inbound replies.
    pub fn short_id(&self) -> String {
        let simple = self.id.simple().to_string();
        simple.chars().take(8).collect()
    }
}

/// Operator (or rule) verdict on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Decision {
    Approve,
    Deny,
    ApproveWithInstructions,
}

/// The terminal outcome of a pending request. Exactly one of these is
/// produced per request id, whichever path wins: operator reply, gateway
/// resolve, auto-rule, or timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub request_id: Uuid,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Who resolved it, e.g. `telegram:alice`, `gateway:client-2`,
    /// `auto-approve`, or `timeout`.
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

impl Authorization {
    /// An approval; upgraded to `approve-with-instructions` when a non-empty
    /// instruction string is supplied.
    pub fn approved(
        request_id: Uuid,
        resolved_by: impl Into<String>,
        instructions: Option<String>,
    ) -> Self {
        let instructions = instructions.filter(|s| !s.trim().is_empty());
        let decision = if instructions.is_some() {
            Decision::ApproveWithInstructions
        } else {
            Decision::Approve
        };
        Self {
            request_id,
            decision,
            instructions,
            resolved_by: resolved_by.into(),
            resolved_at: Utc::now(),
        }
    }

    pub fn denied(request_id: Uuid, resolved_by: impl Into<String>) -> Self {
        Self {
            request_id,
            decision: Decision::Deny,
            instructions: None,
            resolved_by: resolved_by.into(),
            resolved_at: Utc::now(),
        }
    }

    pub fn timed_out(request_id: Uuid) -> Self {
        Self::denied(request_id, RESOLVED_BY_TIMEOUT)
    }

    pub fn is_approval(&self) -> bool {
        matches!(
            self.decision,
            Decision::Approve | Decision::ApproveWithInstructions
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.resolved_by == RESOLVED_BY_TIMEOUT
    }
}

/// One step dispatched to the browser automation plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BrowserAction {
    Navigate {
        url: String,
    },
    Screenshot {
        #[serde(skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    ExtractText {
        #[serde(skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    Click {
        selector: String,
    },
    Type {
        selector: String,
        text: String,
    },
    Wait {
        ms: u64,
    },
    Scrape {
        url: String,
        selectors: Vec<String>,
    },
}

impl std::fmt::Display for BrowserAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrowserAction::Navigate { url } => write!(f, "navigate {url}"),
            BrowserAction::Screenshot { selector: Some(sel) } => write!(f, "screenshot {sel}"),
            BrowserAction::Screenshot { selector: None } => write!(f, "screenshot"),
            BrowserAction::ExtractText { selector: Some(sel) } => write!(f, "extract-text {sel}"),
            BrowserAction::ExtractText { selector: None } => write!(f, "extract-text"),
            BrowserAction::Click { selector } => write!(f, "click {selector}"),
            BrowserAction::Type { selector, .. } => write!(f, "type into {selector}"),
            BrowserAction::Wait { ms } => write!(f, "wait {ms}ms"),
            BrowserAction::Scrape { url, .. } => write!(f, "scrape {url}"),
        }
    }
}

/// Outcome of a single browser action. `success == false` iff `error` is
/// set; the constructors below are the only way the executor builds these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action: BrowserAction,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(action: BrowserAction, data: Option<String>, screenshot_path: Option<String>) -> Self {
        Self {
            action,
            success: true,
            data,
            screenshot_path,
            error: None,
        }
    }

    pub fn failed(action: BrowserAction, error: impl Into<String>) -> Self {
        Self {
            action,
            success: false,
            data: None,
            screenshot_path: None,
            error: Some(error.into()),
        }
    }
}

/// One formatted message written into the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Injection {
    pub request_id: Uuid,
    pub success: bool,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_results: Vec<ActionResult>,
    pub injected_at: DateTime<Utc>,
}

/// Completed lifecycle of one request.
///
/// `authorization` is absent only for the auto-deny fast path; `injection`
/// is absent only for gateway-initiated requests, which have no worker to
/// inject into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub request: AccessRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection: Option<Injection>,
    pub completed_at: DateTime<Utc>,
}

/// One operator endpoint the forwarder delivers prompts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTarget {
    pub channel: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// A message received from the messaging plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub channel: String,
    pub from: String,
    pub text: String,
}

/// A message handed to the messaging plane for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub target: AuthTarget,
    pub body: String,
}

/// Snapshot returned by `conductor.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub pending: Vec<AccessRequest>,
    pub pending_count: usize,
    pub history_count: usize,
}

/// Events broadcast to gateway subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConductorEvent {
    Requested(RequestedEvent),
    Resolved(ResolvedEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedEvent {
    pub id: Uuid,
    pub kind: RequestKind,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_needed: Option<String>,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl From<&AccessRequest> for RequestedEvent {
    fn from(request: &AccessRequest) -> Self {
        Self {
            id: request.id,
            kind: request.kind,
            summary: request.summary.clone(),
            url: request.url.clone(),
            service: request.service.clone(),
            data_needed: request.data_needed.clone(),
            created_at_ms: request.created_at.timestamp_millis(),
            expires_at_ms: request.expires_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEvent {
    pub id: Uuid,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    pub ts: i64,
}

impl From<&Authorization> for ResolvedEvent {
    fn from(auth: &Authorization) -> Self {
        Self {
            id: auth.request_id,
            decision: auth.decision,
            instructions: auth.instructions.clone(),
            resolved_by: Some(auth.resolved_by.clone()),
            ts: auth.resolved_at.timestamp_millis(),
        }
    }
}
