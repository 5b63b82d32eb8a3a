//! Deterministic, rule-based request detection. This backend is always
//! available and doubles as the fallback for every remote backend.

use std::sync::LazyLock;

use conductor_protocol::protocol::BrowserAction;
use conductor_protocol::protocol::RequestKind;
use regex_lite::Regex;

use super::Analysis;
use super::DetectedRequest;

/// Confidence assigned to every rule match.
const RULE_CONFIDENCE: f32 = 0.8;

/// Ordered detection rules; the first match decides the kind.
const CANONICAL_PATTERNS: &[(&str, RequestKind)] = &[
    (
        r"(?i)\b(?:go to|visit|navigate to|open|browse to|check out)\s+(?:the\s+)?https?://",
        RequestKind::UrlVisit,
    ),
    (
        r"(?i)\b(?:need|get|fetch|grab|retrieve|looking for|find)\b[^.\n]*\b(?:api[\s_-]?key|credentials?|token|secrets?|password|connection string)",
        RequestKind::CredentialFetch,
    ),
    (
        r"(?i)\b(?:check|verify|test|hit|call|query)\b[^.\n]*\b(?:api|endpoint|webhook|health\s?check)\b",
        RequestKind::ApiCheck,
    ),
    (
        r"(?i)\b(?:verify|confirm|check)\b[^.\n]*\b(?:deploy(?:ment|ed)?|is live|is up|went live|succeeded)\b",
        RequestKind::Verification,
    ),
    (
        r"(?i)\b(?:download|save)\b[^.\n]*\b(?:file|archive|zip|tarball|release|artifact|installer|binary)\b",
        RequestKind::FileDownload,
    ),
    (
        r"(?i)\b(?:open|check|log\s?in(?:\s?to)?|sign\s?in(?:\s?to)?|access|go to)\b[^.\n]*\b(?:dashboard|console|portal|settings|project|account)\b",
        RequestKind::ServiceAction,
    ),
    (r"https?://\S+", RequestKind::Unknown),
];

/// Services recognised by the extractor, in canonical casing.
const KNOWN_SERVICES: &[&str] = &[
    "Railway",
    "Vercel",
    "Netlify",
    "Supabase",
    "Firebase",
    "AWS",
    "GCP",
    "Azure",
    "Heroku",
    "Render",
    "Fly",
    "GitHub",
    "GitLab",
    "Bitbucket",
    "Cloudflare",
    "DigitalOcean",
    "MongoDB",
    "Redis",
    "PostgreSQL",
    "MySQL",
    "Stripe",
    "Twilio",
    "SendGrid",
    "Auth0",
    "Okta",
];

static URL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r#"https?://[^\s"'<>)\]]+"#));

static SERVICE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    let names = KNOWN_SERVICES
        .iter()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join("|");
    compile(&format!(r"(?i)\b(?:{names})\b"))
});

static ENV_VAR_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"\b[A-Z][A-Z0-9]*_[A-Z0-9_]*[A-Z0-9]\b"));

static DATA_PHRASE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile(
        r"(?i)\b(?:need|looking for|want)\b\s+(?:the\s+|an\s+|a\s+)?([A-Za-z0-9_][A-Za-z0-9_ -]{2,60}?)(?:\s+(?:from|to|for|in|on)\b|[.!?,\n]|$)",
    )
});

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!("failed to compile detection pattern `{pattern}`: {e}");
            None
        }
    }
}

/// Remove CSI (`ESC [ … final`) and OSC (`ESC ] … BEL | ESC \`) control
/// sequences, plus bare two-character escapes. Idempotent: the output never
/// contains an ESC byte.
pub fn strip_control_sequences(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // Parameter and intermediate bytes run until the final byte
                // in 0x40..=0x7e.
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if ('\u{40}'..='\u{7e}').contains(&next) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\u{07}' {
                        break;
                    }
                    if next == '\u{1b}' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

pub struct RuleAnalyzer {
    rules: Vec<(Regex, RequestKind)>,
}

impl RuleAnalyzer {
    /// Build the ordered rule list: the canonical set first, then any
    /// user-configured patterns (all mapped to `unknown`). Patterns that do
    /// not compile are logged and skipped.
    pub fn new(extra_patterns: &[String]) -> Self {
        let mut rules: Vec<(Regex, RequestKind)> = CANONICAL_PATTERNS
            .iter()
            .filter_map(|(pattern, kind)| compile(pattern).map(|re| (re, *kind)))
            .collect();
        for pattern in extra_patterns {
            if let Some(re) = compile(pattern) {
                rules.push((re, RequestKind::Unknown));
            }
        }
        Self { rules }
    }

    pub fn analyze(&self, text: &str) -> Analysis {
        let clean = strip_control_sequences(text);
        for (re, kind) in &self.rules {
            if !re.is_match(&clean) {
                continue;
            }
            let url = extract_url(&clean);
            let service = extract_service(&clean);
            let data_needed = extract_data_needed(&clean);
            let summary = summarize(*kind, url.as_deref(), service.as_deref());
            let suggested_actions = suggest_actions(*kind, url.as_deref());
            return Analysis::detected(
                DetectedRequest {
                    kind: *kind,
                    summary,
                    url,
                    service,
                    data_needed,
                    suggested_actions,
                },
                RULE_CONFIDENCE,
            );
        }
        Analysis::none()
    }
}

/// First URL in the text, with trailing punctuation stripped.
fn extract_url(text: &str) -> Option<String> {
    let re = URL_RE.as_ref()?;
    let m = re.find(text)?;
    let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
    Some(url.to_string())
}

/// First known service mentioned, returned in canonical casing.
fn extract_service(text: &str) -> Option<String> {
    let re = SERVICE_RE.as_ref()?;
    let m = re.find(text)?;
    let found = m.as_str().to_lowercase();
    KNOWN_SERVICES
        .iter()
        .find(|s| s.to_lowercase() == found)
        .map(|s| s.to_string())
}

/// A well-known env-var name wins over a "need <noun phrase>" extraction
/// because it is the more precise signal.
fn extract_data_needed(text: &str) -> Option<String> {
    if let Some(re) = ENV_VAR_RE.as_ref()
        && let Some(m) = re.find(text)
    {
        return Some(m.as_str().to_string());
    }
    let re = DATA_PHRASE_RE.as_ref()?;
    let caps = re.captures(text)?;
    let phrase = caps.get(1)?.as_str().trim();
    (!phrase.is_empty()).then(|| phrase.to_string())
}

pub(crate) fn summarize(kind: RequestKind, url: Option<&str>, service: Option<&str>) -> String {
    match kind {
        RequestKind::UrlVisit => url
            .map(|u| format!("Visit {u}"))
            .unwrap_or_else(|| "Visit a URL".to_string()),
        RequestKind::CredentialFetch => service
            .map(|s| format!("Fetch credentials from {s}"))
            .unwrap_or_else(|| "Fetch credentials".to_string()),
        RequestKind::ApiCheck => url
            .map(|u| format!("Check API at {u}"))
            .unwrap_or_else(|| "Check an API endpoint".to_string()),
        RequestKind::ServiceAction => service
            .map(|s| format!("Open the {s} dashboard"))
            .unwrap_or_else(|| "Perform a service action".to_string()),
        RequestKind::FileDownload => url
            .map(|u| format!("Download {u}"))
            .unwrap_or_else(|| "Download a file".to_string()),
        RequestKind::Verification => url
            .map(|u| format!("Verify {u}"))
            .unwrap_or_else(|| "Verify a deployment".to_string()),
        RequestKind::Unknown => url
            .map(|u| format!("Access {u}"))
            .unwrap_or_else(|| "External access request".to_string()),
    }
}

/// Default action list for a kind. The list starts with `navigate` iff a URL
/// was extracted.
pub(crate) fn suggest_actions(kind: RequestKind, url: Option<&str>) -> Vec<BrowserAction> {
    let mut actions = Vec::new();
    if let Some(url) = url {
        actions.push(BrowserAction::Navigate {
            url: url.to_string(),
        });
    }
    match kind {
        RequestKind::UrlVisit | RequestKind::Verification => {
            actions.push(BrowserAction::Screenshot { selector: None });
            actions.push(BrowserAction::ExtractText { selector: None });
        }
        RequestKind::CredentialFetch | RequestKind::ApiCheck => {
            actions.push(BrowserAction::ExtractText { selector: None });
        }
        RequestKind::FileDownload => {}
        RequestKind::ServiceAction | RequestKind::Unknown => {
            actions.push(BrowserAction::Screenshot { selector: None });
        }
    }
    actions
}
