//! Remote-LLM request detection. Supports the Gemini `generateContent` API,
//! OpenAI-style chat completions, and a local Ollama server; every failure
//! path falls back to the embedded rule-based analyzer for the same input,
//! so a broken or unreachable backend is never visible to the orchestrator.

use std::time::Duration;

use conductor_protocol::protocol::BrowserAction;
use conductor_protocol::protocol::RequestKind;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_json::json;

use super::Analysis;
use super::DetectedRequest;
use super::rules;
use super::rules::RuleAnalyzer;
use crate::config::AnalyzerConfig;
use crate::config::AnalyzerProvider;
use crate::error::ConductorErr;
use crate::error::Result;

/// Anything shorter than this (after control stripping and trimming) cannot
/// be a meaningful request and is not worth a network round-trip.
const MIN_VISIBLE_CHARS: usize = 20;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_DEFAULT_MODEL: &str = "gemini-2.0-flash";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
const OLLAMA_DEFAULT_BASE_URL: &str = "http://localhost:11434";
const OLLAMA_DEFAULT_MODEL: &str = "llama3.2";

const SYSTEM_PROMPT: &str = r#"You watch the terminal output of an autonomous coding agent. Decide whether the text asks for external network access (visiting a URL, fetching a credential, checking an API, acting on a service dashboard, downloading a file, verifying a deployment). Respond with strict JSON only, no prose, matching exactly:
{"detected": boolean, "confidence": number between 0 and 1, "kind": "url-visit"|"credential-fetch"|"api-check"|"service-action"|"file-download"|"verification"|"unknown", "summary": string, "url": string or null, "service": string or null, "dataNeeded": string or null, "suggestedActions": [{"type": "navigate", "url": string} | {"type": "screenshot"} | {"type": "extract-text"}]}
Ordinary build, test, or progress output is not a request: answer {"detected": false, "confidence": 0}."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteProvider {
    Gemini,
    OpenAi,
    Ollama,
}

pub struct RemoteAnalyzer {
    provider: RemoteProvider,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    fallback: RuleAnalyzer,
}

impl RemoteAnalyzer {
    pub fn from_config(config: &AnalyzerConfig) -> Self {
        let (provider, base_url, default_model, key_env) = match config.provider {
            AnalyzerProvider::OpenAi => (
                RemoteProvider::OpenAi,
                OPENAI_BASE_URL.to_string(),
                OPENAI_DEFAULT_MODEL,
                Some("OPENAI_API_KEY"),
            ),
            AnalyzerProvider::Local => (
                RemoteProvider::Ollama,
                std::env::var("AETHER_OSS_BASE_URL")
                    .unwrap_or_else(|_| OLLAMA_DEFAULT_BASE_URL.to_string()),
                OLLAMA_DEFAULT_MODEL,
                None,
            ),
            // `Regex` never reaches this constructor; treat anything else as
            // the default provider.
            _ => (
                RemoteProvider::Gemini,
                GEMINI_BASE_URL.to_string(),
                GEMINI_DEFAULT_MODEL,
                Some("GEMINI_API_KEY"),
            ),
        };
        let api_key = config
            .api_key
            .clone()
            .or_else(|| key_env.and_then(|var| std::env::var(var).ok()))
            .filter(|key| !key.is_empty());
        Self {
            provider,
            client: build_client(),
            base_url,
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            fallback: RuleAnalyzer::new(&config.patterns),
        }
    }

    #[cfg(test)]
    fn with_host(provider: RemoteProvider, host: impl Into<String>) -> Self {
        Self {
            provider,
            client: build_client(),
            base_url: host.into(),
            api_key: Some("test-key".to_string()),
            model: "test-model".to_string(),
            fallback: RuleAnalyzer::new(&[]),
        }
    }

    pub async fn analyze(&self, text: &str) -> Analysis {
        let clean = rules::strip_control_sequences(text);
        if clean.trim().chars().count() < MIN_VISIBLE_CHARS {
            return Analysis::none();
        }
        match self.classify(&clean).await {
            Ok(verdict) => verdict.into_analysis(),
            Err(e) => {
                tracing::debug!("remote analyzer failed, falling back to rules: {e}");
                self.fallback.analyze(text)
            }
        }
    }

    async fn classify(&self, clean: &str) -> Result<RemoteVerdict> {
        let content = match self.provider {
            RemoteProvider::Gemini => self.call_gemini(clean).await?,
            RemoteProvider::OpenAi => self.call_openai(clean).await?,
            RemoteProvider::Ollama => self.call_ollama(clean).await?,
        };
        let verdict = serde_json::from_str::<RemoteVerdict>(extract_json_block(&content))?;
        Ok(verdict)
    }

    async fn call_gemini(&self, clean: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let payload = json!({
            "systemInstruction": {"parts": [{"text": SYSTEM_PROMPT}]},
            "contents": [{"role": "user", "parts": [{"text": clean}]}],
            "generationConfig": {"responseMimeType": "application/json"},
        });
        let mut builder = self.client.post(&url);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-goog-api-key", key);
        }
        let value = send_for_json(builder.json(&payload)).await?;
        content_at(&value, "/candidates/0/content/parts/0/text")
    }

    async fn call_openai(&self, clean: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": clean},
            ],
            "response_format": {"type": "json_object"},
        });
        let mut builder = self.client.post(&url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let value = send_for_json(builder.json(&payload)).await?;
        content_at(&value, "/choices/0/message/content")
    }

    async fn call_ollama(&self, clean: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": clean},
            ],
            "stream": false,
            "format": "json",
        });
        let value = send_for_json(self.client.post(&url).json(&payload)).await?;
        content_at(&value, "/message/content")
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

async fn send_for_json(builder: reqwest::RequestBuilder) -> Result<JsonValue> {
    let resp = builder.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ConductorErr::UnexpectedStatus(status, body));
    }
    Ok(resp.json::<JsonValue>().await?)
}

fn content_at(value: &JsonValue, pointer: &str) -> Result<String> {
    value
        .pointer(pointer)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ConductorErr::Io(std::io::Error::other(
                "analyzer response missing message content",
            ))
        })
}

/// Models occasionally wrap their JSON in a markdown fence despite the
/// instructions; strip it before parsing.
fn extract_json_block(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    match rest.rfind("```") {
        Some(idx) => rest[..idx].trim(),
        None => rest.trim(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RemoteVerdict {
    detected: bool,
    confidence: f32,
    kind: Option<String>,
    summary: Option<String>,
    url: Option<String>,
    service: Option<String>,
    data_needed: Option<String>,
    suggested_actions: Option<Vec<BrowserAction>>,
}

impl RemoteVerdict {
    fn into_analysis(self) -> Analysis {
        let confidence = self.confidence.clamp(0.0, 1.0);
        if !self.detected {
            return Analysis {
                detected: false,
                confidence,
                request: None,
            };
        }
        let kind: RequestKind = self
            .kind
            .map(|s| {
                serde_json::from_value::<RequestKind>(JsonValue::String(s.trim().to_lowercase()))
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        let url = self.url.filter(|u| !u.is_empty());
        let service = self.service.filter(|s| !s.is_empty());
        let summary = self
            .summary
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| rules::summarize(kind, url.as_deref(), service.as_deref()));
        let suggested_actions = self
            .suggested_actions
            .filter(|actions| !actions.is_empty())
            .unwrap_or_else(|| rules::suggest_actions(kind, url.as_deref()));
        Analysis::detected(
            DetectedRequest {
                kind,
                summary,
                url,
                service,
                data_needed: self.data_needed.filter(|d| !d.is_empty()),
                suggested_actions,
            },
            confidence,
        )
    }
}
