//! Classifies worker terminal output into external-access requests.
//!
//! Two backends exist: a rule-based detector that is always available, and a
//! remote-LLM detector that falls back to the rules on any failure. The
//! backends are plain enum variants rather than trait objects; there are
//! exactly two and the orchestrator owns one of them for its lifetime.

mod remote;
mod rules;

pub use remote::RemoteAnalyzer;
pub use rules::RuleAnalyzer;
pub use rules::strip_control_sequences;

use conductor_protocol::protocol::BrowserAction;
use conductor_protocol::protocol::RequestKind;

use crate::config::AnalyzerConfig;
use crate::config::AnalyzerProvider;

/// Verdict on one flushed chunk of terminal output. At most one request per
/// invocation; the confidence threshold is applied by the orchestrator, not
/// here.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub detected: bool,
    pub confidence: f32,
    pub request: Option<DetectedRequest>,
}

impl Analysis {
    pub fn none() -> Self {
        Self {
            detected: false,
            confidence: 0.0,
            request: None,
        }
    }

    pub(crate) fn detected(request: DetectedRequest, confidence: f32) -> Self {
        Self {
            detected: true,
            confidence,
            request: Some(request),
        }
    }
}

/// What the analyzer extracted; the orchestrator turns this into a full
/// [`conductor_protocol::protocol::AccessRequest`] with id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedRequest {
    pub kind: RequestKind,
    pub summary: String,
    pub url: Option<String>,
    pub service: Option<String>,
    pub data_needed: Option<String>,
    pub suggested_actions: Vec<BrowserAction>,
}

pub enum Analyzer {
    Rules(RuleAnalyzer),
    Remote(Box<RemoteAnalyzer>),
}

impl Analyzer {
    pub fn from_config(config: &AnalyzerConfig) -> Self {
        match config.provider {
            AnalyzerProvider::Regex => Self::Rules(RuleAnalyzer::new(&config.patterns)),
            AnalyzerProvider::Gemini | AnalyzerProvider::OpenAi | AnalyzerProvider::Local => {
                Self::Remote(Box::new(RemoteAnalyzer::from_config(config)))
            }
        }
    }

    pub async fn analyze(&self, text: &str) -> Analysis {
        match self {
            Self::Rules(rules) => rules.analyze(text),
            Self::Remote(remote) => remote.analyze(text).await,
        }
    }
}
