//! Capability adapters — the untrusted model backend behind a trait.
//!
//! A capability is an external analysis/fix function (hosted API or a
//! local model server). The pipeline treats its output as hostile:
//! every response goes through [`parse_structured`], which strips
//! markdown fences and falls back to brace-slicing before giving up
//! with [`CapabilityError::Malformed`].
//!
//! Concrete adapters are chosen once, by configuration, through
//! [`create_capability`] — callers only ever see `Arc<dyn Capability>`.

pub mod hosted;
pub mod local;

use crate::config::{CapabilityConfig, CapabilityProvider};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub use hosted::HostedCapability;
pub use local::LocalCapability;

// ── Request / error model ────────────────────────────────────────

/// One prompt exchange sent to a capability.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// Everything that can go wrong at the capability boundary. Adapters
/// never let any other error shape (or a panic) escape.
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("capability rate limited")]
    RateLimited,
    #[error("capability returned malformed payload: {0}")]
    Malformed(String),
    #[error("capability call timed out")]
    Timeout,
}

impl CapabilityError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::RateLimited => "rate_limited",
            Self::Malformed(_) => "malformed",
            Self::Timeout => "timeout",
        }
    }
}

// ── Capability trait ─────────────────────────────────────────────

/// An external analysis or fix-generation capability.
///
/// Adapters are stateless and safely reusable across concurrent
/// submissions; all per-call state lives in the request.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Short adapter name for logs ("hosted", "local", mocks in tests).
    fn name(&self) -> &str;

    /// Invoke the capability and return its structured payload.
    async fn invoke(&self, req: &CapabilityRequest) -> Result<Value, CapabilityError>;
}

/// Build the configured capability adapter.
pub fn create_capability(config: &CapabilityConfig) -> anyhow::Result<Arc<dyn Capability>> {
    match config.provider {
        CapabilityProvider::Hosted => Ok(Arc::new(HostedCapability::from_config(config)?)),
        CapabilityProvider::Local => Ok(Arc::new(LocalCapability::from_config(config))),
    }
}

// ── Shared parsing helpers ───────────────────────────────────────

/// Map a reqwest transport error onto the capability taxonomy.
pub(crate) fn classify_transport_error(err: &reqwest::Error) -> CapabilityError {
    if err.is_timeout() {
        CapabilityError::Timeout
    } else {
        CapabilityError::Unavailable(err.to_string())
    }
}

/// Pull the assistant text out of a chat-completions response body.
pub(crate) fn completion_text(body: &Value) -> Option<&str> {
    body["choices"][0]["message"]["content"].as_str()
}

/// Best-effort parse of model output into JSON.
///
/// Order of attempts: strip a ```json fence, parse the raw text, slice
/// from the first `{` to the last `}`. Only when none of these yield a
/// JSON value is the payload reported as malformed.
pub fn parse_structured(text: &str) -> Result<Value, CapabilityError> {
    let fenced = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str::<Value>(fenced) {
        return Ok(value);
    }

    if let (Some(start), Some(end)) = (fenced.find('{'), fenced.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&fenced[start..=end]) {
                return Ok(value);
            }
        }
    }

    let sample: String = text.chars().take(200).collect();
    Err(CapabilityError::Malformed(sample))
}

/// Strip a surrounding markdown code fence, if present.
fn strip_code_fence(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let body_start = start + 7;
        if let Some(end) = text[body_start..].find("```") {
            return text[body_start..body_start + end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let body_start = start + 3;
        if let Some(end) = text[body_start..].find("```") {
            let candidate = text[body_start..body_start + end].trim();
            // Skip a language identifier line if present.
            if let Some(nl) = candidate.find('\n') {
                if !candidate[..nl].trim_start().starts_with('{') {
                    return candidate[nl + 1..].trim();
                }
            }
            return candidate;
        }
    }
    text.trim()
}

// ── Tests ────────────────────────────────────────────────────────
