//! Turns an approved request into an ordered list of browser actions and
//! runs them against the automation plane.

use std::time::Duration;

use conductor_protocol::protocol::AccessRequest;
use conductor_protocol::protocol::ActionResult;
use conductor_protocol::protocol::Authorization;
use conductor_protocol::protocol::BrowserAction;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::config::BrowserConfig;

/// One command sent to the automation plane. Replies travel back over the
/// embedded oneshot.
#[derive(Debug)]
pub enum BrowserCommand {
    Status {
        reply: oneshot::Sender<BrowserStatus>,
    },
    Start {
        profile: String,
        headless: bool,
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
    Perform {
        action: BrowserAction,
        reply: oneshot::Sender<ActionResult>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserStatus {
    pub running: bool,
}

/// The browser automation plane is an external collaborator. The disabled
/// variant is the stub used when none is attached: every action fails and
/// the failure surfaces in the action results.
#[derive(Clone)]
pub enum BrowserPlane {
    Disabled,
    External(mpsc::Sender<BrowserCommand>),
}

impl BrowserPlane {
    async fn status(&self) -> BrowserStatus {
        match self {
            Self::Disabled => BrowserStatus::default(),
            Self::External(tx) => {
                let (reply, rx) = oneshot::channel();
                if tx.send(BrowserCommand::Status { reply }).await.is_err() {
                    return BrowserStatus::default();
                }
                rx.await.unwrap_or_default()
            }
        }
    }

    async fn start(&self, profile: &str, headless: bool) -> std::result::Result<(), String> {
        match self {
            Self::Disabled => Err("browser plane not attached".to_string()),
            Self::External(tx) => {
                let (reply, rx) = oneshot::channel();
                tx.send(BrowserCommand::Start {
                    profile: profile.to_string(),
                    headless,
                    reply,
                })
                .await
                .map_err(|_| "browser plane unavailable".to_string())?;
                rx.await
                    .map_err(|_| "browser plane dropped the start request".to_string())?
            }
        }
    }

    async fn perform(&self, action: BrowserAction) -> ActionResult {
        match self {
            Self::Disabled => ActionResult::failed(action, "browser plane not attached"),
            Self::External(tx) => {
                let (reply, rx) = oneshot::channel();
                let sent = tx
                    .send(BrowserCommand::Perform {
                        action: action.clone(),
                        reply,
                    })
                    .await;
                if sent.is_err() {
                    return ActionResult::failed(action, "browser plane unavailable");
                }
                rx.await
                    .unwrap_or_else(|_| ActionResult::failed(action, "browser plane unavailable"))
            }
        }
    }
}

/// The composed action list, remembering whether the final screenshot was
/// auto-appended (its failure is ignored rather than reported).
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPlan {
    pub actions: Vec<BrowserAction>,
    pub trailing_screenshot: bool,
}

/// Compose the action list for an approved request:
/// 1. suggested actions, or `navigate + extract-text` when only a URL is
///    known;
/// 2. "only screenshot" / "just screenshot" instructions reduce the plan;
/// 3. "only fetch" / "just fetch" likewise;
/// 4. a trailing screenshot is appended when capture is on and none is
///    planned.
pub fn plan_actions(
    request: &AccessRequest,
    auth: &Authorization,
    capture_screenshots: bool,
) -> ActionPlan {
    let navigate = request.url.as_ref().map(|url| BrowserAction::Navigate {
        url: url.clone(),
    });

    let mut actions = if !request.suggested_actions.is_empty() {
        request.suggested_actions.clone()
    } else if let Some(navigate) = navigate.clone() {
        vec![navigate, BrowserAction::ExtractText { selector: None }]
    } else {
        Vec::new()
    };

    let instructions = auth
        .instructions
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    if instructions.contains("only screenshot") || instructions.contains("just screenshot") {
        actions = navigate
            .into_iter()
            .chain([BrowserAction::Screenshot { selector: None }])
            .collect();
    } else if instructions.contains("only fetch") || instructions.contains("just fetch") {
        actions = navigate
            .into_iter()
            .chain([BrowserAction::ExtractText { selector: None }])
            .collect();
    }

    let mut trailing_screenshot = false;
    if capture_screenshots
        && !actions.is_empty()
        && !actions
            .iter()
            .any(|a| matches!(a, BrowserAction::Screenshot { .. }))
    {
        actions.push(BrowserAction::Screenshot { selector: None });
        trailing_screenshot = true;
    }

    ActionPlan {
        actions,
        trailing_screenshot,
    }
}

pub struct Executor {
    plane: BrowserPlane,
    profile: String,
    headless: bool,
    action_timeout: Duration,
    capture_screenshots: bool,
}

impl Executor {
    pub fn new(config: &BrowserConfig, plane: BrowserPlane) -> Self {
        Self {
            plane,
            profile: config.profile.clone(),
            headless: config.headless,
            action_timeout: Duration::from_millis(config.action_timeout_ms),
            capture_screenshots: config.capture_screenshots,
        }
    }

    /// Run the composed plan. A failed `navigate` short-circuits the rest of
    /// the list; every other failure is recorded but does not abort.
    pub async fn execute(
        &self,
        request: &AccessRequest,
        auth: &Authorization,
    ) -> Vec<ActionResult> {
        let plan = plan_actions(request, auth, self.capture_screenshots);
        if plan.actions.is_empty() {
            return Vec::new();
        }
        self.ensure_browser().await;

        let total = plan.actions.len();
        let mut results = Vec::with_capacity(total);
        for (index, action) in plan.actions.into_iter().enumerate() {
            let result =
                match tokio::time::timeout(self.action_timeout, self.plane.perform(action.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => ActionResult::failed(
                        action,
                        format!("action timed out after {}ms", self.action_timeout.as_millis()),
                    ),
                };
            let navigate_failed =
                !result.success && matches!(result.action, BrowserAction::Navigate { .. });
            let is_trailing = plan.trailing_screenshot && index == total - 1;
            if result.success || !is_trailing {
                results.push(result);
            }
            if navigate_failed {
                break;
            }
        }
        results
    }

    /// Make sure the browser profile is up before the first action.
    /// Transient start failures are tolerated; the individual actions will
    /// surface them.
    async fn ensure_browser(&self) {
        if self.plane.status().await.running {
            return;
        }
        if let Err(e) = self.plane.start(&self.profile, self.headless).await {
            tracing::warn!("browser start failed (continuing): {e}");
        }
    }
}
