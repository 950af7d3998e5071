//! Analysis agents — one domain expert per [`AgentKind`].
//!
//! Every agent wraps the same capability adapter with a domain prompt
//! and normalizes that domain's historical wire schema (security
//! reports `vulnerabilities`, performance and style report `issues`,
//! bug detection reports `bugs`) into the internal model. `analyze`
//! is infallible: capability failures and timeouts become a `Failed`
//! run so sibling agents keep going.

use crate::capability::{Capability, CapabilityRequest};
use crate::review::types::{
    AgentAnalysis, AgentKind, AgentRun, CodeSubmission, FailureKind, Finding, Severity,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Domain profiles ──────────────────────────────────────────────

struct DomainProfile {
    findings_key: &'static str,
    score_key: &'static str,
    suggestion_key: &'static str,
    system_prompt: &'static str,
}

const SECURITY_PROMPT: &str = r#"You are a senior security engineer auditing code for vulnerabilities:
SQL injection, XSS, command injection, path traversal, hardcoded secrets,
insecure cryptography, missing input validation, auth flaws, insecure
deserialization, SSRF.

Return a JSON object with this exact structure:
{
  "vulnerabilities": [
    {
      "line": <int>,
      "severity": "critical|high|medium|low",
      "description": "<clear description>",
      "impact": "<what could happen>",
      "fix": "<how to fix it>"
    }
  ],
  "security_score": <0-100, higher is more secure>,
  "summary": "<brief security assessment>"
}

Only return valid JSON. No other text."#;

const PERFORMANCE_PROMPT: &str = r#"You are a senior performance engineer hunting bottlenecks:
inefficient algorithms, excessive allocation, redundant work, N+1 query
patterns, missing caching, blocking calls in async contexts, resource
leaks, wrong data structures.

Return a JSON object with this exact structure:
{
  "issues": [
    {
      "line": <int>,
      "severity": "critical|high|medium|low",
      "description": "<description of the bottleneck>",
      "optimization": "<specific optimization>",
      "impact": "<estimated effect>"
    }
  ],
  "performance_score": <0-100, higher is better performing>,
  "summary": "<brief performance assessment>"
}

Only return valid JSON. No other text."#;

const STYLE_PROMPT: &str = r#"You are a senior code quality engineer enforcing standards:
naming, formatting and spacing, documentation, duplication, function
design, error handling patterns, magic numbers, dead code.

Return a JSON object with this exact structure:
{
  "issues": [
    {
      "line": <int>,
      "severity": "critical|high|medium|low",
      "description": "<clear description>",
      "suggestion": "<specific improvement>"
    }
  ],
  "style_score": <0-100, higher is better>,
  "summary": "<brief style assessment>"
}

Only return valid JSON. No other text."#;

const BUGS_PROMPT: &str = r#"You are a senior QA engineer hunting logic errors:
incorrect conditionals, off-by-one errors, null/undefined access, race
conditions, unhandled edge cases, type mismatches, wrong return values,
infinite loops, overflow.

Return a JSON object with this exact structure:
{
  "bugs": [
    {
      "line": <int>,
      "severity": "critical|high|medium|low",
      "description": "<description of the bug>",
      "impact": "<what could go wrong>",
      "fix": "<how to fix it>"
    }
  ],
  "reliability_score": <0-100, higher means fewer bugs>,
  "summary": "<brief bug assessment>"
}

Only return valid JSON. No other text."#;

fn profile(kind: AgentKind) -> DomainProfile {
    match kind {
        AgentKind::Security => DomainProfile {
            findings_key: "vulnerabilities",
            score_key: "security_score",
            suggestion_key: "fix",
            system_prompt: SECURITY_PROMPT,
        },
        AgentKind::Performance => DomainProfile {
            findings_key: "issues",
            score_key: "performance_score",
            suggestion_key: "optimization",
            system_prompt: PERFORMANCE_PROMPT,
        },
        AgentKind::Style => DomainProfile {
            findings_key: "issues",
            score_key: "style_score",
            suggestion_key: "suggestion",
            system_prompt: STYLE_PROMPT,
        },
        AgentKind::Bugs => DomainProfile {
            findings_key: "bugs",
            score_key: "reliability_score",
            suggestion_key: "fix",
            system_prompt: BUGS_PROMPT,
        },
    }
}

// ── Analysis agent ───────────────────────────────────────────────

pub struct AnalysisAgent {
    kind: AgentKind,
    capability: Arc<dyn Capability>,
    timeout: Duration,
    max_tokens: u32,
    temperature: f64,
}

impl AnalysisAgent {
    pub fn new(
        kind: AgentKind,
        capability: Arc<dyn Capability>,
        timeout: Duration,
        max_tokens: u32,
        temperature: f64,
    ) -> Self {
        Self {
            kind,
            capability,
            timeout,
            max_tokens,
            temperature,
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    fn build_request(&self, submission: &CodeSubmission) -> CapabilityRequest {
        CapabilityRequest {
            system: profile(self.kind).system_prompt.to_owned(),
            user: format!(
                "Language: {lang}\n\nAnalyze this code:\n```{lang}\n{code}\n```",
                lang = submission.language,
                code = submission.code,
            ),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    /// Run the analysis. Never fails: any capability error or deadline
    /// miss produces a `Failed` run carrying the reason.
    pub async fn analyze(&self, submission: &CodeSubmission) -> AgentRun {
        let mut run = AgentRun::new(self.kind);
        run.start();

        let request = self.build_request(submission);
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, self.capability.invoke(&request)).await {
            Ok(Ok(payload)) => {
                let analysis = normalize(self.kind, &payload);
                tracing::debug!(
                    agent = self.kind.id(),
                    findings = analysis.findings.len(),
                    score = analysis.score,
                    "analysis completed"
                );
                run.complete(analysis, elapsed_ms(started));
            }
            Ok(Err(err)) => {
                tracing::warn!(agent = self.kind.id(), error = %err, "analysis failed");
                run.fail(FailureKind::from(&err), elapsed_ms(started));
            }
            Err(_) => {
                // Dropping the invoke future cancels the in-flight call.
                tracing::warn!(
                    agent = self.kind.id(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "analysis exceeded per-agent timeout"
                );
                run.fail(FailureKind::Timeout, elapsed_ms(started));
            }
        }

        run
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ── Payload normalization ────────────────────────────────────────

/// Normalize a domain payload into [`AgentAnalysis`]. Tolerant of
/// partial structures: missing arrays mean no findings, a missing
/// score means a clean 100, unknown severities take the domain default.
fn normalize(kind: AgentKind, payload: &Value) -> AgentAnalysis {
    let schema = profile(kind);

    let findings = payload[schema.findings_key]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| normalize_finding(kind, &schema, item))
                .collect()
        })
        .unwrap_or_default();

    let score = payload[schema.score_key]
        .as_u64()
        .or_else(|| payload[schema.score_key].as_f64().map(|f| f.round() as u64))
        .unwrap_or(100)
        .min(100) as u8;

    AgentAnalysis {
        findings,
        score,
        summary: payload["summary"].as_str().unwrap_or_default().to_owned(),
    }
}

fn normalize_finding(kind: AgentKind, schema: &DomainProfile, item: &Value) -> Option<Finding> {
    let description = item["description"].as_str()?.trim();
    if description.is_empty() {
        return None;
    }

    let suggestion = item[schema.suggestion_key]
        .as_str()
        .or_else(|| item["suggestion"].as_str())
        .unwrap_or_default();

    Some(Finding {
        line: item["line"].as_u64().unwrap_or(0).min(u64::from(u32::MAX)) as u32,
        severity: item["severity"]
            .as_str()
            .map(|s| Severity::parse_or(s, kind.default_severity()))
            .unwrap_or_else(|| kind.default_severity()),
        category: kind.category().to_owned(),
        description: description.to_owned(),
        suggestion: suggestion.to_owned(),
        impact: item["impact"].as_str().map(str::to_owned),
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityError;
    use async_trait::async_trait;
    use serde_json::json;

    struct CannedCapability {
        response: Result<Value, CapabilityError>,
        delay: Duration,
    }

    impl CannedCapability {
        fn ok(value: Value) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(value),
                delay: Duration::ZERO,
            })
        }

        fn err(err: CapabilityError) -> Arc<Self> {
            Arc::new(Self {
                response: Err(err),
                delay: Duration::ZERO,
            })
        }

        fn slow(value: Value, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(value),
                delay,
            })
        }
    }

    #[async_trait]
    impl Capability for CannedCapability {
        fn name(&self) -> &str {
            "canned"
        }

        async fn invoke(&self, _req: &CapabilityRequest) -> Result<Value, CapabilityError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response.clone()
        }
    }

    fn agent(kind: AgentKind, capability: Arc<dyn Capability>) -> AnalysisAgent {
        AnalysisAgent::new(kind, capability, Duration::from_secs(5), 1024, 0.2)
    }

    fn submission() -> CodeSubmission {
        CodeSubmission::new("demo.py", "python", "def add(a,b): return a+b")
    }

    #[tokio::test]
    async fn security_payload_normalizes_into_findings() {
        let capability = CannedCapability::ok(json!({
            "vulnerabilities": [{
                "line": 4,
                "severity": "critical",
                "description": "SQL built by string concatenation",
                "impact": "full table read",
                "fix": "use parameterized queries"
            }],
            "security_score": 35,
            "summary": "injection risk"
        }));

        let run = agent(AgentKind::Security, capability).analyze(&submission()).await;
        assert!(run.is_completed());
        let analysis = run.analysis.unwrap();
        assert_eq!(analysis.score, 35);
        assert_eq!(analysis.findings.len(), 1);
        let finding = &analysis.findings[0];
        assert_eq!(finding.category, "security");
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(finding.suggestion, "use parameterized queries");
        assert_eq!(finding.impact.as_deref(), Some("full table read"));
    }

    #[tokio::test]
    async fn missing_fields_take_defaults() {
        let capability = CannedCapability::ok(json!({
            "issues": [
                { "description": "inconsistent spacing" },
                { "description": "   " },
                "not an object"
            ]
        }));

        let run = agent(AgentKind::Style, capability).analyze(&submission()).await;
        let analysis = run.analysis.unwrap();
        // Blank and non-object entries are dropped.
        assert_eq!(analysis.findings.len(), 1);
        assert_eq!(analysis.findings[0].severity, Severity::Low);
        assert_eq!(analysis.findings[0].line, 0);
        assert_eq!(analysis.score, 100);
    }

    #[tokio::test]
    async fn out_of_range_score_is_clamped() {
        let capability = CannedCapability::ok(json!({ "bugs": [], "reliability_score": 250 }));
        let run = agent(AgentKind::Bugs, capability).analyze(&submission()).await;
        assert_eq!(run.analysis.unwrap().score, 100);
    }

    #[tokio::test]
    async fn capability_error_becomes_failed_run() {
        let capability = CannedCapability::err(CapabilityError::RateLimited);
        let run = agent(AgentKind::Performance, capability).analyze(&submission()).await;
        assert_eq!(run.status, crate::review::types::AgentStatus::Failed);
        assert_eq!(run.failure, Some(FailureKind::RateLimited));
        assert!(run.analysis.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_capability_hits_per_agent_timeout() {
        let capability = CannedCapability::slow(json!({"issues": []}), Duration::from_secs(120));
        let agent = AnalysisAgent::new(
            AgentKind::Performance,
            capability,
            Duration::from_secs(1),
            1024,
            0.2,
        );
        let run = agent.analyze(&submission()).await;
        assert_eq!(run.failure, Some(FailureKind::Timeout));
    }

    #[test]
    fn prompts_request_domain_schemas() {
        assert!(profile(AgentKind::Security).system_prompt.contains("vulnerabilities"));
        assert!(profile(AgentKind::Bugs).system_prompt.contains("reliability_score"));
    }
}
