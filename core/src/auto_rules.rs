//! URL globs that resolve a request without consulting the operator.
//! Shell-style patterns: `*` matches any run of characters, `?` a single
//! character; everything else is literal. Matching is anchored and
//! case-insensitive, and deny always wins over approve.

use wildmatch::WildMatch;

use crate::config::AuthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AutoRule {
    Deny,
    Approve,
}

pub(crate) fn evaluate(auth: &AuthConfig, url: &str) -> Option<AutoRule> {
    if matches_any(&auth.auto_deny_patterns, url) {
        return Some(AutoRule::Deny);
    }
    if matches_any(&auth.auto_approve_patterns, url) {
        return Some(AutoRule::Approve);
    }
    None
}

fn matches_any(patterns: &[String], url: &str) -> bool {
    let url = url.to_lowercase();
    patterns
        .iter()
        .any(|pattern| WildMatch::new(&pattern.to_lowercase()).matches(&url))
}
