//! Aggregation — merge per-agent findings into one scored result.
//!
//! Scoring is a pure function of the *completed* runs: the weights of
//! completed categories are renormalized to sum to 1 and failed or
//! timed-out agents contribute nothing, so partial failure degrades
//! confidence instead of skewing the score.

use crate::review::types::{AgentKind, AgentRun, Finding, Severity};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

// ── Score weights ────────────────────────────────────────────────

/// Per-category weight of each agent's sub-score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub security: f64,
    pub performance: f64,
    pub style: f64,
    pub bugs: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            security: 0.30,
            performance: 0.20,
            style: 0.15,
            bugs: 0.35,
        }
    }
}

impl ScoreWeights {
    pub fn for_kind(&self, kind: AgentKind) -> f64 {
        match kind {
            AgentKind::Security => self.security,
            AgentKind::Performance => self.performance,
            AgentKind::Style => self.style,
            AgentKind::Bugs => self.bugs,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let weights = [self.security, self.performance, self.style, self.bugs];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            anyhow::bail!("score weights must be finite and non-negative");
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            anyhow::bail!("score weights must sum to a positive value");
        }
        Ok(())
    }
}

// ── Grade scale ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeBand {
    pub min: u8,
    pub grade: String,
}

/// Ordered score cutpoints mapping to letter grades. Total (the last
/// band floors at 0) and monotonic, both enforced by [`validate`].
///
/// [`validate`]: GradeScale::validate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GradeScale {
    bands: Vec<GradeBand>,
}

impl Default for GradeScale {
    fn default() -> Self {
        let bands = [
            (95, "A+"),
            (88, "A"),
            (80, "A-"),
            (75, "B+"),
            (70, "B"),
            (65, "B-"),
            (60, "C+"),
            (55, "C"),
            (50, "C-"),
            (40, "D"),
            (0, "F"),
        ];
        Self {
            bands: bands
                .into_iter()
                .map(|(min, grade)| GradeBand {
                    min,
                    grade: grade.into(),
                })
                .collect(),
        }
    }
}

impl GradeScale {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bands.is_empty() {
            anyhow::bail!("grade scale must have at least one band");
        }
        for pair in self.bands.windows(2) {
            if pair[0].min <= pair[1].min {
                anyhow::bail!(
                    "grade bands must be strictly descending (found {} then {})",
                    pair[0].min,
                    pair[1].min
                );
            }
        }
        match self.bands.last() {
            Some(floor) if floor.min == 0 => Ok(()),
            _ => anyhow::bail!("grade scale must end with a band at score 0"),
        }
    }

    /// Map a score to its letter grade. Total over 0–100 for any
    /// validated scale.
    pub fn grade(&self, score: u8) -> &str {
        self.bands
            .iter()
            .find(|band| score >= band.min)
            .or(self.bands.last())
            .map(|band| band.grade.as_str())
            .unwrap_or("F")
    }
}

// ── Aggregate ────────────────────────────────────────────────────

/// Merged output of the analysis phase.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub findings: Vec<Finding>,
    pub category_scores: BTreeMap<String, u8>,
    pub score: u8,
    pub grade: String,
    pub quick_wins: Vec<Finding>,
    pub summary: String,
}

/// Merge, deduplicate, score, and grade the terminal runs.
///
/// Callers guarantee at least one completed run (the orchestrator
/// terminates with `AllAgentsFailed` before reaching this point
/// otherwise); with zero completed runs the score degenerates to 0.
pub fn aggregate(
    runs: &[AgentRun],
    weights: &ScoreWeights,
    grades: &GradeScale,
    quick_win_count: usize,
) -> Aggregate {
    let findings = merge_findings(runs);
    let category_scores: BTreeMap<String, u8> = runs
        .iter()
        .filter_map(|run| {
            run.analysis
                .as_ref()
                .map(|a| (run.agent.id().to_owned(), a.score))
        })
        .collect();

    let score = overall_score(runs, weights);
    let grade = grades.grade(score).to_owned();
    let quick_wins = quick_wins(&findings, quick_win_count);
    let summary = build_summary(runs, &findings, score, &grade);

    Aggregate {
        findings,
        category_scores,
        score,
        grade,
        quick_wins,
        summary,
    }
}

/// Collapse duplicate findings across agents, first occurrence wins,
/// then order by severity (critical first) and line.
fn merge_findings(runs: &[AgentRun]) -> Vec<Finding> {
    let mut seen: HashSet<(u32, String, String)> = HashSet::new();
    let mut merged: Vec<Finding> = Vec::new();

    for run in runs {
        let Some(analysis) = &run.analysis else {
            continue;
        };
        for finding in &analysis.findings {
            let key = (
                finding.line,
                finding.category.clone(),
                finding.description.clone(),
            );
            if seen.insert(key) {
                merged.push(finding.clone());
            }
        }
    }

    merged.sort_by_key(|f| (Reverse(f.severity), f.line));
    merged
}

/// Renormalized weights over the completed runs. Empty when nothing
/// completed or the surviving weights sum to zero.
pub fn renormalized_weights(runs: &[AgentRun], weights: &ScoreWeights) -> Vec<(AgentKind, f64)> {
    let completed: Vec<AgentKind> = runs
        .iter()
        .filter(|r| r.is_completed())
        .map(|r| r.agent)
        .collect();

    let total: f64 = completed.iter().map(|k| weights.for_kind(*k)).sum();
    if total <= 0.0 {
        return Vec::new();
    }

    completed
        .into_iter()
        .map(|kind| (kind, weights.for_kind(kind) / total))
        .collect()
}

fn overall_score(runs: &[AgentRun], weights: &ScoreWeights) -> u8 {
    let renormalized = renormalized_weights(runs, weights);
    if renormalized.is_empty() {
        return 0;
    }

    let weighted: f64 = renormalized
        .iter()
        .map(|(kind, weight)| {
            let score = runs
                .iter()
                .find(|r| r.agent == *kind)
                .and_then(|r| r.analysis.as_ref())
                .map_or(0.0, |a| f64::from(a.score));
            score * weight
        })
        .sum();

    weighted.round().clamp(0.0, 100.0) as u8
}

/// Top findings worth fixing first: highest severity, then the
/// shortest suggestion (cheapest to act on).
fn quick_wins(findings: &[Finding], count: usize) -> Vec<Finding> {
    let mut ranked: Vec<&Finding> = findings.iter().collect();
    ranked.sort_by_key(|f| (Reverse(f.severity), f.suggestion.len()));
    ranked.into_iter().take(count).cloned().collect()
}

fn build_summary(runs: &[AgentRun], findings: &[Finding], score: u8, grade: &str) -> String {
    let mut parts: Vec<String> = Vec::new();

    if findings.is_empty() {
        parts.push("No issues detected across all analysis domains.".into());
    } else {
        let total = findings.len();
        parts.push(format!(
            "Found {total} issue{} across security, performance, style, and bug detection.",
            if total == 1 { "" } else { "s" }
        ));
        let critical = findings.iter().filter(|f| f.severity == Severity::Critical).count();
        let high = findings.iter().filter(|f| f.severity == Severity::High).count();
        if critical > 0 {
            parts.push(format!(
                "{critical} critical issue{} require immediate attention.",
                if critical == 1 { "" } else { "s" }
            ));
        }
        if high > 0 {
            parts.push(format!(
                "{high} high-severity issue{} should be addressed soon.",
                if high == 1 { "" } else { "s" }
            ));
        }
    }

    for run in runs {
        if let Some(analysis) = &run.analysis {
            if !analysis.summary.trim().is_empty() {
                parts.push(format!("{}: {}", run.agent.label(), analysis.summary.trim()));
            }
        }
    }

    let excluded: Vec<&str> = runs
        .iter()
        .filter(|r| !r.is_completed())
        .map(|r| r.agent.id())
        .collect();
    if !excluded.is_empty() {
        parts.push(format!(
            "Excluded from scoring after failure: {}.",
            excluded.join(", ")
        ));
    }

    parts.push(format!("Overall quality score: {score}/100 (grade {grade})."));
    parts.join(" ")
}

// ── Tests ────────────────────────────────────────────────────────
