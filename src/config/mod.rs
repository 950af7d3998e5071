//! Central configuration for fluxrev.
//!
//! Loaded from a TOML file with full serde defaults so an empty (or
//! missing) file yields a working local setup. The capability API key
//! may also come from the `FLUXREV_API_KEY` environment variable, which
//! takes priority over the file.

use crate::review::aggregate::{GradeScale, ScoreWeights};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Number of analysis agents in the pipeline (security, performance,
/// style, bug detection). The pool must hold at least this many slots.
pub const ANALYSIS_AGENT_COUNT: usize = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capability: CapabilityConfig,
    pub review: ReviewConfig,
    pub pool: PoolConfig,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
}

// ── Capability backend ───────────────────────────────────────────

/// Which capability backend to construct. Decided once, at startup —
/// never by branching deep in call paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityProvider {
    /// OpenAI-compatible hosted API (bearer key required).
    Hosted,
    /// Local Ollama-style server (no key).
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub provider: CapabilityProvider,
    /// Base URL of the chat-completions API. Defaults depend on the
    /// provider: hosted → api.openai.com, local → 127.0.0.1:11434.
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    /// Per-request HTTP timeout for one capability call.
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            provider: CapabilityProvider::Hosted,
            api_url: None,
            api_key: None,
            model: "gpt-4.1-mini".into(),
            request_timeout_secs: 90,
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

// ── Review pipeline ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Submissions above this many bytes are rejected before dispatch.
    pub max_code_bytes: usize,
    /// Accepted language tags (matched case-insensitively).
    pub languages: Vec<String>,
    /// Per-agent deadline, independent of the adapter's HTTP timeout.
    pub agent_timeout_secs: u64,
    /// Deadline for the whole analysis phase.
    pub global_timeout_secs: u64,
    /// Deadline for the auto-fix call.
    pub fix_timeout_secs: u64,
    /// How many findings to surface as quick wins.
    pub quick_wins: usize,
    pub weights: ScoreWeights,
    pub grades: GradeScale,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_code_bytes: 48 * 1024,
            languages: [
                "python",
                "javascript",
                "typescript",
                "rust",
                "go",
                "java",
                "c",
                "cpp",
                "ruby",
                "php",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            agent_timeout_secs: 60,
            global_timeout_secs: 120,
            fix_timeout_secs: 60,
            quick_wins: 3,
            weights: ScoreWeights::default(),
            grades: GradeScale::default(),
        }
    }
}

impl ReviewConfig {
    pub fn supports_language(&self, language: &str) -> bool {
        self.languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(language))
    }
}

// ── Capability pool ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Total concurrent outbound capability calls, across all submissions.
    pub capacity: usize,
    /// How long a submission may queue for pool admission before failing Busy.
    pub queue_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            queue_timeout_secs: 10,
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Binding to a non-loopback address must be opted into explicitly.
    pub allow_public_bind: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            allow_public_bind: false,
        }
    }
}

// ── Auth / quota ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user: String,
    /// 0 = unlimited.
    #[serde(default)]
    pub reviews_limit: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Static API tokens. Empty list = open anonymous access.
    pub tokens: Vec<TokenEntry>,
}

// ── Storage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("fluxrev.db"),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Load configuration from `path`, or defaults when the file does
    /// not exist. `FLUXREV_API_KEY` overrides the configured key.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var("FLUXREV_API_KEY") {
            let key = key.trim();
            if !key.is_empty() {
                config.capability.api_key = Some(key.to_owned());
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would break pipeline invariants.
    pub fn validate(&self) -> Result<()> {
        self.review.weights.validate()?;
        self.review.grades.validate()?;
        if self.pool.capacity < ANALYSIS_AGENT_COUNT {
            anyhow::bail!(
                "pool.capacity = {} is below the {ANALYSIS_AGENT_COUNT} concurrent analysis agents one submission needs",
                self.pool.capacity
            );
        }
        if self.review.languages.is_empty() {
            anyhow::bail!("review.languages must name at least one supported language");
        }
        if self.review.max_code_bytes == 0 {
            anyhow::bail!("review.max_code_bytes must be positive");
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
