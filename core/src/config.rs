//! Configuration for the conductor, loaded from `$AETHER_HOME/conductor.toml`
//! (defaulting to `~/.openclaw/conductor.toml`) and merged with programmatic
//! overrides from the CLI.

use std::path::Path;
use std::path::PathBuf;

use conductor_protocol::protocol::AuthTarget;
use dirs::home_dir;
use serde::Deserialize;

use crate::error::ConductorErr;
use crate::error::Result;

const CONFIG_TOML_FILE: &str = "conductor.toml";
const AUDIT_LOG_FILE: &str = "conductor-audit.jsonl";
const GATEWAY_SOCKET_FILE: &str = "conductor.sock";

pub const DEFAULT_WRAPPED_COMMAND: &str = "claude";
pub const DEFAULT_BUFFER_FLUSH_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 8_192;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_BROWSER_PROFILE: &str = "openclaw";
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 30_000;

/// Application configuration after defaults and overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// When `false`, the conductor must be a transparent wrapper: no
    /// interception, no analysis, no messaging.
    pub enabled: bool,

    /// Worker process spawned under the conductor's control.
    pub wrapped_command: String,
    pub wrapped_args: Vec<String>,

    /// Periodic flush of the analysis buffer.
    pub buffer_flush_interval_ms: u64,

    /// Size at which the analysis buffer is force-flushed, in bytes.
    pub max_buffer_size: usize,

    pub analyzer: AnalyzerConfig,
    pub auth: AuthConfig,
    pub browser: BrowserConfig,

    /// Append-only JSONL audit sink.
    pub audit_log: bool,
    pub audit_log_path: PathBuf,

    /// Where the gateway RPC facade listens. `None` disables the facade.
    pub gateway_socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    pub provider: AnalyzerProvider,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Minimum confidence the orchestrator accepts from the analyzer.
    pub confidence_threshold: f32,
    /// Extra detection regexes, all mapped to the `unknown` kind.
    pub patterns: Vec<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            provider: AnalyzerProvider::default(),
            api_key: None,
            model: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnalyzerProvider {
    #[default]
    Gemini,
    OpenAi,
    Regex,
    Local,
}

impl AnalyzerProvider {
    /// Unrecognised provider names fall back to the rule-based backend,
    /// which is always available.
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "gemini" => Self::Gemini,
            "openai" => Self::OpenAi,
            "local" => Self::Local,
            _ => Self::Regex,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthConfig {
    /// Messaging endpoints that receive authorization prompts.
    pub targets: Vec<AuthTarget>,
    pub timeout_ms: u64,
    /// URL globs resolved without the operator. Deny wins over approve.
    pub auto_approve_patterns: Vec<String>,
    pub auto_deny_patterns: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            auto_approve_patterns: Vec::new(),
            auto_deny_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrowserConfig {
    pub profile: String,
    pub headless: bool,
    pub action_timeout_ms: u64,
    /// Append a trailing screenshot to approved action lists that do not
    /// already contain one.
    pub capture_screenshots: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            profile: DEFAULT_BROWSER_PROFILE.to_string(),
            headless: true,
            action_timeout_ms: DEFAULT_ACTION_TIMEOUT_MS,
            capture_screenshots: true,
        }
    }
}

/// Overrides that take precedence over the values loaded from disk.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub enabled: Option<bool>,
    /// Wrapped command and arguments, argv-style.
    pub wrapped_command: Option<Vec<String>>,
    pub gateway: Option<bool>,
}

/// Base config deserialized from `conductor.toml`. All fields are optional
/// so a missing or partial file falls back to defaults.
#[derive(Debug, Default, Deserialize)]
struct ConductorToml {
    enabled: Option<bool>,
    wrapped_command: Option<String>,
    wrapped_args: Option<Vec<String>>,
    buffer_flush_interval_ms: Option<u64>,
    max_buffer_size: Option<usize>,
    analyzer: Option<AnalyzerToml>,
    auth: Option<AuthToml>,
    browser: Option<BrowserToml>,
    audit_log: Option<bool>,
    audit_log_path: Option<PathBuf>,
    gateway: Option<GatewayToml>,
}

#[derive(Debug, Default, Deserialize)]
struct AnalyzerToml {
    provider: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    confidence_threshold: Option<f32>,
    patterns: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthToml {
    targets: Option<Vec<AuthTarget>>,
    timeout_ms: Option<u64>,
    auto_approve_patterns: Option<Vec<String>>,
    auto_deny_patterns: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct BrowserToml {
    profile: Option<String>,
    headless: Option<bool>,
    action_timeout_ms: Option<u64>,
    capture_screenshots: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayToml {
    enabled: Option<bool>,
    socket_path: Option<PathBuf>,
}

/// Returns the directory holding all conductor state. Defaults to
/// `~/.openclaw`, overridable with the `AETHER_HOME` environment variable
/// (useful for tests).
pub fn aether_home() -> std::io::Result<PathBuf> {
    match std::env::var("AETHER_HOME") {
        Ok(val) if !val.is_empty() => Ok(PathBuf::from(val)),
        _ => home_dir()
            .map(|dir| dir.join(".openclaw"))
            .ok_or_else(|| std::io::Error::other("could not find home directory")),
    }
}

impl Config {
    /// Load the config file (if any) and merge the CLI overrides on top.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let home = aether_home()?;
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => home.join(CONFIG_TOML_FILE),
        };
        let toml_cfg = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<ConductorToml>(&contents)
                .map_err(|e| ConductorErr::ConfigInvalid(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConductorToml::default(),
            Err(e) => return Err(e.into()),
        };
        Self::from_parts(toml_cfg, overrides, &home)
    }

    fn from_parts(cfg: ConductorToml, overrides: ConfigOverrides, home: &Path) -> Result<Self> {
        let ConfigOverrides {
            enabled: enabled_override,
            wrapped_command: command_override,
            gateway: gateway_override,
        } = overrides;

        let (wrapped_command, wrapped_args) = match command_override {
            Some(argv) if !argv.is_empty() => {
                let mut iter = argv.into_iter();
                let command = iter.next().unwrap_or_default();
                (command, iter.collect())
            }
            _ => (
                cfg.wrapped_command
                    .unwrap_or_else(|| DEFAULT_WRAPPED_COMMAND.to_string()),
                cfg.wrapped_args.unwrap_or_default(),
            ),
        };

        let analyzer_toml = cfg.analyzer.unwrap_or_default();
        let analyzer = AnalyzerConfig {
            provider: analyzer_toml
                .provider
                .as_deref()
                .map(AnalyzerProvider::parse_lossy)
                .unwrap_or_default(),
            api_key: analyzer_toml.api_key,
            model: analyzer_toml.model,
            confidence_threshold: analyzer_toml
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            patterns: analyzer_toml.patterns.unwrap_or_default(),
        };

        let auth_toml = cfg.auth.unwrap_or_default();
        let auth = AuthConfig {
            targets: auth_toml.targets.unwrap_or_default(),
            timeout_ms: auth_toml.timeout_ms.unwrap_or(DEFAULT_AUTH_TIMEOUT_MS),
            auto_approve_patterns: auth_toml.auto_approve_patterns.unwrap_or_default(),
            auto_deny_patterns: auth_toml.auto_deny_patterns.unwrap_or_default(),
        };

        let browser_toml = cfg.browser.unwrap_or_default();
        let browser = BrowserConfig {
            profile: browser_toml
                .profile
                .unwrap_or_else(|| DEFAULT_BROWSER_PROFILE.to_string()),
            headless: browser_toml.headless.unwrap_or(true),
            action_timeout_ms: browser_toml
                .action_timeout_ms
                .unwrap_or(DEFAULT_ACTION_TIMEOUT_MS),
            capture_screenshots: browser_toml.capture_screenshots.unwrap_or(true),
        };

        let gateway_toml = cfg.gateway.unwrap_or_default();
        let gateway_enabled = gateway_override
            .or(gateway_toml.enabled)
            .unwrap_or(true);
        let gateway_socket_path = gateway_enabled.then(|| {
            gateway_toml
                .socket_path
                .unwrap_or_else(|| home.join(GATEWAY_SOCKET_FILE))
        });

        let config = Self {
            enabled: enabled_override.or(cfg.enabled).unwrap_or(false),
            wrapped_command,
            wrapped_args,
            buffer_flush_interval_ms: cfg
                .buffer_flush_interval_ms
                .unwrap_or(DEFAULT_BUFFER_FLUSH_INTERVAL_MS),
            max_buffer_size: cfg.max_buffer_size.unwrap_or(DEFAULT_MAX_BUFFER_SIZE),
            analyzer,
            auth,
            browser,
            audit_log: cfg.audit_log.unwrap_or(true),
            audit_log_path: cfg
                .audit_log_path
                .unwrap_or_else(|| home.join(AUDIT_LOG_FILE)),
            gateway_socket_path,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.wrapped_command.trim().is_empty() {
            return Err(ConductorErr::ConfigInvalid(
                "wrapped_command must not be empty".to_string(),
            ));
        }
        if self.buffer_flush_interval_ms == 0 {
            return Err(ConductorErr::ConfigInvalid(
                "buffer_flush_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_buffer_size == 0 {
            return Err(ConductorErr::ConfigInvalid(
                "max_buffer_size must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.analyzer.confidence_threshold) {
            return Err(ConductorErr::ConfigInvalid(
                "analyzer.confidence_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.auth.timeout_ms == 0 {
            return Err(ConductorErr::ConfigInvalid(
                "auth.timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_parts(
            ConductorToml::default(),
            ConfigOverrides::default(),
            Path::new("/tmp/.openclaw"),
        )
        .unwrap_or_else(|_| unreachable!("built-in defaults are valid"))
    }
}
