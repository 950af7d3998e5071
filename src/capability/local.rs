//! Local capability — Ollama-style server speaking the OpenAI wire shape.
//!
//! Keeps review traffic on the host: no key, no egress. The server is
//! expected at the Ollama default port unless `capability.api_url`
//! points elsewhere.

use super::{
    classify_transport_error, completion_text, parse_structured, Capability, CapabilityError,
    CapabilityRequest,
};
use crate::config::CapabilityConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_LOCAL_URL: &str = "http://127.0.0.1:11434/v1";

pub struct LocalCapability {
    api_url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl LocalCapability {
    pub fn from_config(config: &CapabilityConfig) -> Self {
        Self {
            api_url: config
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_LOCAL_URL.into())
                .trim_end_matches('/')
                .to_owned(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Capability for LocalCapability {
    fn name(&self) -> &str {
        "local"
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
            .json(&payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = resp.status();
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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn local_server_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "{\"bugs\": [], \"reliability_score\": 88}" } }]
            })))
            .mount(&server)
            .await;

        let config = CapabilityConfig {
            api_url: Some(server.uri()),
            model: "qwen3:0.6b".into(),
            request_timeout_secs: 2,
            ..CapabilityConfig::default()
        };
        let capability = LocalCapability::from_config(&config);
        let value = capability.invoke(&CapabilityRequest {
            system: "s".into(),
            user: "u".into(),
            max_tokens: 128,
            temperature: 0.1,
        })
        .await
        .unwrap();
        assert_eq!(value["reliability_score"], 88);
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        // Nothing listens on this port.
        let config = CapabilityConfig {
            api_url: Some("http://127.0.0.1:1".into()),
            request_timeout_secs: 2,
            ..CapabilityConfig::default()
        };
        let capability = LocalCapability::from_config(&config);
        let err = capability
            .invoke(&CapabilityRequest {
                system: String::new(),
                user: String::new(),
                max_tokens: 16,
                temperature: 0.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapabilityError::Unavailable(_) | CapabilityError::Timeout
        ));
    }
}
