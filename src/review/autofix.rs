//! Auto-fix agent — turns merged findings into corrected code.
//!
//! Runs strictly after the analysis phase settles. Clean submissions
//! short-circuit: no capability call, original code back unchanged.

use crate::capability::{Capability, CapabilityError, CapabilityRequest};
use crate::review::types::{CodeSubmission, Finding, FixChange};
use serde_json::Value;
use std::sync::Arc;

const AUTOFIX_PROMPT: &str = r#"You are a senior software engineer who fixes code.
Given the original code AND a list of identified issues, generate the
FIXED version of the code. Apply every fix, keep the original structure
and intent, add error handling where missing.

Return a JSON object with this exact structure:
{
  "fixed_code": "<the complete fixed code>",
  "changes_made": [
    {
      "line": <int>,
      "type": "fix|refactor|optimization|documentation",
      "description": "<what was changed>"
    }
  ],
  "improvement_summary": "<what was improved overall>"
}

Only return valid JSON. No other text."#;

/// Result of one fix pass.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub fixed_code: String,
    pub changes: Vec<FixChange>,
    pub summary: String,
}

impl FixOutcome {
    /// The no-findings (or degraded) outcome: code back untouched.
    pub fn unchanged(code: &str) -> Self {
        Self {
            fixed_code: code.to_owned(),
            changes: Vec::new(),
            summary: String::new(),
        }
    }
}

pub struct AutoFixAgent {
    capability: Arc<dyn Capability>,
    max_tokens: u32,
    temperature: f64,
}

impl AutoFixAgent {
    pub fn new(capability: Arc<dyn Capability>, max_tokens: u32, temperature: f64) -> Self {
        Self {
            capability,
            max_tokens,
            temperature,
        }
    }

    /// Generate corrected code for the merged findings.
    ///
    /// Empty findings return immediately with the original code and no
    /// capability call — re-reviewing clean code must be free and
    /// byte-stable.
    pub async fn fix(
        &self,
        submission: &CodeSubmission,
        findings: &[Finding],
    ) -> Result<FixOutcome, CapabilityError> {
        if findings.is_empty() {
            return Ok(FixOutcome::unchanged(&submission.code));
        }

        let request = CapabilityRequest {
            system: AUTOFIX_PROMPT.to_owned(),
            user: format!(
                "Language: {lang}\n\nOriginal code:\n```{lang}\n{code}\n```\n\n\
                 Issues found by the analysis agents:\n{digest}\n\n\
                 Generate the fixed version of this code addressing ALL issues above.",
                lang = submission.language,
                code = submission.code,
                digest = findings_digest(findings),
            ),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let payload = self.capability.invoke(&request).await?;
        Ok(parse_outcome(&payload, &submission.code))
    }
}

/// One line per finding, the shape the fix prompt expects.
fn findings_digest(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| {
            format!(
                "[{}] Line {}: {} → Fix: {}",
                f.category.to_uppercase(),
                f.line,
                f.description,
                f.suggestion,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_outcome(payload: &Value, original: &str) -> FixOutcome {
    let fixed_code = payload["fixed_code"].as_str().unwrap_or_default();
    if fixed_code.trim().is_empty() {
        // No usable code came back; degrade rather than ship an empty file.
        tracing::warn!("fix payload carried no usable fixed_code; keeping original");
        return FixOutcome::unchanged(original);
    }

    let changes = payload["changes_made"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(FixChange {
                        line: item["line"].as_u64().unwrap_or(0).min(u64::from(u32::MAX)) as u32,
                        kind: item["type"].as_str().unwrap_or("fix").to_owned(),
                        description: item["description"].as_str()?.to_owned(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    FixOutcome {
        fixed_code: fixed_code.to_owned(),
        changes,
        summary: payload["improvement_summary"]
            .as_str()
            .unwrap_or_default()
            .to_owned(),
    }
}

// ── Tests ────────────────────────────────────────────────────────
