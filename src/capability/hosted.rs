//! Hosted capability — OpenAI-compatible chat-completions API.

use super::{
    classify_transport_error, completion_text, parse_structured, Capability, CapabilityError,
    CapabilityRequest,
};
use crate::config::CapabilityConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_HOSTED_URL: &str = "https://api.openai.com/v1";

pub struct HostedCapability {
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HostedCapability {
    pub fn from_config(config: &CapabilityConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "hosted capability requires an API key — set capability.api_key or FLUXREV_API_KEY"
                )
            })?;

        Ok(Self {
            api_url: config
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_HOSTED_URL.into())
                .trim_end_matches('/')
                .to_owned(),
            api_key: api_key.to_owned(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Capability for HostedCapability {
    fn name(&self) -> &str {
        "hosted"
    }

    async fn invoke(&self, req: &CapabilityRequest) -> Result<Value, CapabilityError> {
        let payload = serde_json::json!({
            "model": self.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "messages": [
                { "role": "system", "content": req.system },
                { "role": "user", "content": req.user },
            ],
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(CapabilityError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let sample: String = body.chars().take(200).collect();
            return Err(CapabilityError::Unavailable(format!("HTTP {status}: {sample}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CapabilityError::Malformed(e.to_string()))?;
        let text = completion_text(&body)
            .ok_or_else(|| CapabilityError::Malformed("response carried no message text".into()))?;

        parse_structured(text)
    }
}

// ── Tests ────────────────────────────────────────────────────────
