//! Data model for the review pipeline.
//!
//! Value objects flow one way: a [`CodeSubmission`] produces one
//! [`AgentRun`] per analysis agent, the runs merge into exactly one
//! [`ReviewReport`], and [`ProgressEvent`]s narrate the transitions.

use crate::capability::CapabilityError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

// ── Severity ─────────────────────────────────────────────────────

/// Severity level for a finding. Declaration order gives the ranking:
/// `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational suggestion, not a blocker.
    Low,
    /// Should be addressed but not urgent.
    Medium,
    /// Important issue that should be fixed soon.
    High,
    /// Must-fix: correctness or security violation.
    Critical,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse a capability-supplied severity, falling back to the
    /// agent's domain default for anything out of schema.
    pub fn parse_or(value: &str, default: Severity) -> Severity {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            _ => default,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Agent identity ───────────────────────────────────────────────

/// The four analysis domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Security,
    Performance,
    Style,
    Bugs,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [Self::Security, Self::Performance, Self::Style, Self::Bugs];

    /// Stable identifier used in events, report keys, and weights.
    pub fn id(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Style => "style",
            Self::Bugs => "bugs",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Security => "Security Agent",
            Self::Performance => "Performance Agent",
            Self::Style => "Style Agent",
            Self::Bugs => "Bug Detector Agent",
        }
    }

    /// Finding category this agent emits.
    pub fn category(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Style => "style",
            Self::Bugs => "bug",
        }
    }

    /// Severity assumed when a capability reports something out of schema.
    pub fn default_severity(self) -> Severity {
        match self {
            Self::Security => Severity::High,
            Self::Performance => Severity::Medium,
            Self::Style => Severity::Low,
            Self::Bugs => Severity::High,
        }
    }
}

/// Agent id used for fix-phase progress events.
pub const AUTOFIX_ID: &str = "autofix";

// ── Finding ──────────────────────────────────────────────────────

/// A single issue found during review. Two findings are duplicates
/// when their `(line, category, description)` tuples match exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// 1-based line number; 0 means file-level.
    pub line: u32,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    pub suggestion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
}

impl Finding {
    pub fn dedup_key(&self) -> (u32, &str, &str) {
        (self.line, self.category.as_str(), self.description.as_str())
    }
}

// ── Submission ───────────────────────────────────────────────────

/// Caller's fault: rejected before any agent is dispatched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("code cannot be empty")]
    EmptyCode,
    #[error("code is {actual} bytes; the limit is {limit}")]
    TooLarge { actual: usize, limit: usize },
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}

/// One unit of source code under review. Immutable once validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSubmission {
    pub id: Uuid,
    pub filename: String,
    pub language: String,
    pub code: String,
}

impl CodeSubmission {
    pub fn new(filename: impl Into<String>, language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            language: language.into(),
            code: code.into(),
        }
    }

    pub fn validate(&self, config: &crate::config::ReviewConfig) -> Result<(), InputError> {
        if self.code.trim().is_empty() {
            return Err(InputError::EmptyCode);
        }
        if self.code.len() > config.max_code_bytes {
            return Err(InputError::TooLarge {
                actual: self.code.len(),
                limit: config.max_code_bytes,
            });
        }
        if !config.supports_language(&self.language) {
            return Err(InputError::UnsupportedLanguage(self.language.clone()));
        }
        Ok(())
    }
}

// ── Agent run ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why an agent run failed. Mirrors the capability taxonomy plus
/// pipeline-side cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unavailable,
    RateLimited,
    Malformed,
    Timeout,
    Cancelled,
}

impl From<&CapabilityError> for FailureKind {
    fn from(err: &CapabilityError) -> Self {
        match err {
            CapabilityError::Unavailable(_) => Self::Unavailable,
            CapabilityError::RateLimited => Self::RateLimited,
            CapabilityError::Malformed(_) => Self::Malformed,
            CapabilityError::Timeout => Self::Timeout,
        }
    }
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::RateLimited => "rate_limited",
            Self::Malformed => "malformed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Successful payload of one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAnalysis {
    pub findings: Vec<Finding>,
    /// 0–100, higher is better.
    pub score: u8,
    pub summary: String,
}

/// The record of one agent's execution for one submission.
///
/// Status transitions are monotonic: `Pending → Running →
/// {Completed | Failed}`. The transition methods ignore any attempt
/// to move backwards or past a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub agent: AgentKind,
    pub status: AgentStatus,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub duration_ms: u64,
    pub analysis: Option<AgentAnalysis>,
    pub failure: Option<FailureKind>,
}

impl AgentRun {
    pub fn new(agent: AgentKind) -> Self {
        Self {
            agent,
            status: AgentStatus::Pending,
            started_at_ms: None,
            finished_at_ms: None,
            duration_ms: 0,
            analysis: None,
            failure: None,
        }
    }

    pub fn start(&mut self) {
        if self.status == AgentStatus::Pending {
            self.status = AgentStatus::Running;
            self.started_at_ms = Some(now_ms());
        }
    }

    pub fn complete(&mut self, analysis: AgentAnalysis, duration_ms: u64) {
        if !self.status.is_terminal() {
            self.status = AgentStatus::Completed;
            self.analysis = Some(analysis);
            self.duration_ms = duration_ms;
            self.finished_at_ms = Some(now_ms());
        }
    }

    pub fn fail(&mut self, reason: FailureKind, duration_ms: u64) {
        if !self.status.is_terminal() {
            self.status = AgentStatus::Failed;
            self.failure = Some(reason);
            self.duration_ms = duration_ms;
            self.finished_at_ms = Some(now_ms());
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == AgentStatus::Completed
    }
}

// ── Report ───────────────────────────────────────────────────────

/// One change the fix agent made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixChange {
    pub line: u32,
    /// fix | refactor | optimization | documentation
    pub kind: String,
    pub description: String,
}

/// Per-agent roll-up for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub score: u8,
    pub finding_count: usize,
    pub summary: String,
    pub duration_ms: u64,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub total_findings: usize,
    pub critical_count: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
    pub processing_time_ms: u64,
    pub agents_used: usize,
    /// Analysis agents excluded from scoring (failed or timed out).
    pub degraded_agents: Vec<String>,
    /// The fix phase fell back to the original code.
    pub degraded_fix: bool,
}

/// The single terminal artifact of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewReport {
    pub findings: Vec<Finding>,
    /// Sub-scores of completed agents only, keyed by agent id.
    pub category_scores: BTreeMap<String, u8>,
    /// Weighted overall score, 0–100.
    pub score: u8,
    pub grade: String,
    pub summary: String,
    /// Equal to the submitted code when there was nothing to fix.
    pub fixed_code: String,
    pub changes: Vec<FixChange>,
    pub quick_wins: Vec<Finding>,
    pub agent_results: BTreeMap<String, AgentResult>,
    pub metadata: ReportMetadata,
}

// ── Progress events ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Completed,
    Failed,
}

/// One orchestrator state transition, pushed to the caller in
/// emission order and consumed at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub agent: String,
    pub status: ProgressStatus,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub timestamp_ms: i64,
}

impl ProgressEvent {
    pub fn new(agent: impl Into<String>, status: ProgressStatus, detail: serde_json::Value) -> Self {
        Self {
            agent: agent.into(),
            status,
            detail,
            timestamp_ms: now_ms(),
        }
    }
}

// ── Pipeline errors ──────────────────────────────────────────────

/// Terminal failure of a whole review request.
#[derive(Debug, Clone, Error)]
pub enum ReviewError {
    #[error(transparent)]
    RejectedInput(#[from] InputError),
    #[error("every analysis agent failed; no quality signal available")]
    AllAgentsFailed,
    #[error("review exceeded the global timeout")]
    GlobalTimeout,
    #[error("capability pool saturated; try again later")]
    Busy,
    #[error("review cancelled")]
    Cancelled,
}

impl ReviewError {
    pub fn status_id(&self) -> &'static str {
        match self {
            Self::RejectedInput(_) => "invalid_input",
            Self::AllAgentsFailed => "all_agents_failed",
            Self::GlobalTimeout => "global_timeout",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReviewConfig;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn severity_parse_falls_back_to_domain_default() {
        assert_eq!(Severity::parse_or("CRITICAL", Severity::Low), Severity::Critical);
        assert_eq!(Severity::parse_or("blocker", Severity::Medium), Severity::Medium);
    }

    #[test]
    fn submission_validation() {
        let config = ReviewConfig::default();

        let empty = CodeSubmission::new("a.py", "python", "   \n");
        assert_eq!(empty.validate(&config), Err(InputError::EmptyCode));

        let huge = CodeSubmission::new("a.py", "python", "x".repeat(config.max_code_bytes + 1));
        assert!(matches!(huge.validate(&config), Err(InputError::TooLarge { .. })));

        let cobol = CodeSubmission::new("a.cob", "cobol", "MOVE A TO B.");
        assert!(matches!(
            cobol.validate(&config),
            Err(InputError::UnsupportedLanguage(_))
        ));

        let ok = CodeSubmission::new("a.py", "Python", "print('hi')");
        assert_eq!(ok.validate(&config), Ok(()));
    }

    #[test]
    fn agent_run_transitions_are_monotonic() {
        let mut run = AgentRun::new(AgentKind::Security);
        assert_eq!(run.status, AgentStatus::Pending);

        run.start();
        assert_eq!(run.status, AgentStatus::Running);

        run.complete(
            AgentAnalysis {
                findings: vec![],
                score: 90,
                summary: "ok".into(),
            },
            12,
        );
        assert_eq!(run.status, AgentStatus::Completed);

        // A terminal run cannot regress or flip.
        run.fail(FailureKind::Timeout, 99);
        assert_eq!(run.status, AgentStatus::Completed);
        assert!(run.failure.is_none());
        assert_eq!(run.duration_ms, 12);
    }

    #[test]
    fn failed_run_keeps_its_reason() {
        let mut run = AgentRun::new(AgentKind::Bugs);
        run.start();
        run.fail(FailureKind::RateLimited, 5);
        assert_eq!(run.status, AgentStatus::Failed);
        assert_eq!(run.failure, Some(FailureKind::RateLimited));

        run.complete(
            AgentAnalysis {
                findings: vec![],
                score: 100,
                summary: String::new(),
            },
            1,
        );
        assert_eq!(run.status, AgentStatus::Failed);
    }

    #[test]
    fn failure_kind_from_capability_error() {
        assert_eq!(
            FailureKind::from(&CapabilityError::RateLimited),
            FailureKind::RateLimited
        );
        assert_eq!(
            FailureKind::from(&CapabilityError::Timeout),
            FailureKind::Timeout
        );
    }

    #[test]
    fn finding_dedup_key_is_line_category_description() {
        let a = Finding {
            line: 3,
            severity: Severity::High,
            category: "security".into(),
            description: "SQL injection".into(),
            suggestion: "use parameters".into(),
            impact: None,
        };
        let b = Finding {
            severity: Severity::Critical,
            suggestion: "different".into(),
            ..a.clone()
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
