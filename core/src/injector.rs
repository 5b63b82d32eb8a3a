//! Formats execution results, denials, and timeouts into the payload
//! written to the worker's stdin. Every injection is exactly three writes:
//! an empty newline, the payload line(s), an empty newline — so the worker
//! sees a cleanly separated message, as if typed by the user.

use chrono::Utc;
use conductor_protocol::protocol::AccessRequest;
use conductor_protocol::protocol::ActionResult;
use conductor_protocol::protocol::BrowserAction;
use conductor_protocol::protocol::Injection;
use uuid::Uuid;

use crate::interceptor::Interceptor;

/// Result payload for an executed request. Returns the payload and whether
/// the outcome counts as a success (at least one action succeeded, or there
/// was nothing to run).
pub fn format_result_payload(request: &AccessRequest, results: &[ActionResult]) -> (String, bool) {
    let mut out = format!("[Aether] External access result for: {}", request.summary);
    if results.is_empty() {
        out.push_str("\nNo actions were performed.");
        return (out, true);
    }

    let (succeeded, failed): (Vec<&ActionResult>, Vec<&ActionResult>) =
        results.iter().partition(|r| r.success);

    if succeeded.is_empty() {
        out.push_str("\nAll actions failed:");
        for result in &failed {
            push_failure_line(&mut out, result);
        }
        return (out, false);
    }

    for result in &succeeded {
        match &result.action {
            BrowserAction::Navigate { url } => out.push_str(&format!("\nNavigated to {url}")),
            BrowserAction::Screenshot { .. } => {
                let path = result
                    .screenshot_path
                    .as_deref()
                    .or(result.data.as_deref())
                    .unwrap_or("(no path reported)");
                out.push_str(&format!("\nScreenshot saved: {path}"));
            }
            BrowserAction::ExtractText { .. } => {
                let text = result.data.as_deref().unwrap_or("");
                out.push_str(&format!("\nExtracted text:\n{text}"));
            }
            BrowserAction::Click { selector } => out.push_str(&format!("\nClicked {selector}")),
            BrowserAction::Type { selector, .. } => {
                out.push_str(&format!("\nTyped into {selector}"));
            }
            BrowserAction::Wait { ms } => out.push_str(&format!("\nWaited {ms}ms")),
            BrowserAction::Scrape { url, .. } => {
                let data = result.data.as_deref().unwrap_or("");
                out.push_str(&format!("\nScraped {url}:\n{data}"));
            }
        }
    }
    if !failed.is_empty() {
        out.push_str("\nFailed actions:");
        for result in &failed {
            push_failure_line(&mut out, result);
        }
    }
    (out, true)
}

fn push_failure_line(out: &mut String, result: &ActionResult) {
    out.push_str(&format!(
        "\n  - {}: {}",
        result.action,
        result.error.as_deref().unwrap_or("unknown error")
    ));
}

pub fn format_denial(summary: &str, reason: &str) -> String {
    format!("[Aether] Request denied: {summary} — {reason}. Proceeding without external access.")
}

pub fn format_timeout(summary: &str) -> String {
    format!("[Aether] Authorization timed out for: {summary}. Proceeding without external access.")
}

/// The three stdin writes making up one injection.
fn envelope_writes(payload: &str) -> [Vec<u8>; 3] {
    let mut line = payload.as_bytes().to_vec();
    line.push(b'\n');
    [b"\n".to_vec(), line, b"\n".to_vec()]
}

/// Write the payload into the worker's stdin and return the `Injection`
/// record. An unwritable stdin is logged and downgrades the injection to a
/// failure; it never escapes the request lifecycle.
pub fn inject_payload(
    interceptor: &Interceptor,
    request_id: Uuid,
    payload: String,
    success: bool,
    action_results: Vec<ActionResult>,
) -> Injection {
    let mut success = success;
    for chunk in envelope_writes(&payload) {
        if let Err(e) = interceptor.inject(chunk) {
            tracing::warn!("failed to inject into worker stdin: {e}");
            success = false;
            break;
        }
    }
    Injection {
        request_id,
        success,
        payload,
        action_results,
        injected_at: Utc::now(),
    }
}
