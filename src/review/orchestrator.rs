//! Pipeline orchestration — two phases, one report.
//!
//! `Accepted → Analyzing → Merging → Fixing → Done`, with terminal
//! failures `RejectedInput`, `AllAgentsFailed`, `GlobalTimeout`, and
//! `Busy` at admission. All four analysis agents race concurrently;
//! the fix agent strictly follows the merge. Each run is scoped to
//! one submission — the only shared state is the capability pool and
//! the stateless adapter.

use crate::capability::Capability;
use crate::config::Config;
use crate::review::agents::AnalysisAgent;
use crate::review::aggregate::{aggregate, Aggregate};
use crate::review::autofix::{AutoFixAgent, FixOutcome};
use crate::review::pool::CapabilityPool;
use crate::review::types::{
    AgentKind, AgentResult, AgentRun, CodeSubmission, FailureKind, ProgressEvent, ProgressStatus,
    ReportMetadata, ReviewError, ReviewReport, Severity, AUTOFIX_ID,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

// ── Pipeline events ──────────────────────────────────────────────

/// Frames pushed to the progress channel. Exactly one terminal frame
/// (`Result`, `Error`, or `Timeout`) is emitted per request — or none
/// at all when the request is cancelled.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Agent(ProgressEvent),
    Merging,
    Result(Box<ReviewReport>),
    Error {
        status: &'static str,
        message: String,
    },
    Timeout,
}

impl PipelineEvent {
    /// Wire name of the SSE frame carrying this event.
    pub fn frame_name(&self) -> &'static str {
        match self {
            Self::Agent(_) => "agent",
            Self::Merging => "merging",
            Self::Result(_) => "result",
            Self::Error { .. } => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error { .. } | Self::Timeout)
    }
}

// ── Event sink ───────────────────────────────────────────────────

/// Where progress goes. The synchronous path uses a silent sink; the
/// streaming path wires in an mpsc sender. A dropped receiver (client
/// disconnect) turns into cancellation: the send fails, the token
/// trips, and the pipeline stops without emitting anything further.
pub(crate) struct EventSink {
    tx: Option<mpsc::Sender<PipelineEvent>>,
    cancel: CancellationToken,
}

impl EventSink {
    pub(crate) fn silent(cancel: CancellationToken) -> Self {
        Self { tx: None, cancel }
    }

    pub(crate) fn channel(tx: mpsc::Sender<PipelineEvent>, cancel: CancellationToken) -> Self {
        Self { tx: Some(tx), cancel }
    }

    fn has_listener(&self) -> bool {
        self.tx.is_some()
    }

    async fn emit(&self, event: PipelineEvent) -> Result<(), ReviewError> {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                tracing::debug!("progress consumer gone; cancelling pipeline");
                self.cancel.cancel();
                return Err(ReviewError::Cancelled);
            }
        }
        Ok(())
    }
}

// ── Review service ───────────────────────────────────────────────

/// Process-wide entry point of the pipeline. Holds the capability
/// adapter and the bounded pool; each `review`/`stream` call runs a
/// single-use pipeline scoped to one submission.
pub struct ReviewService {
    capability: Arc<dyn Capability>,
    pool: Arc<CapabilityPool>,
    review: crate::config::ReviewConfig,
    max_tokens: u32,
    temperature: f64,
}

impl ReviewService {
    pub fn new(capability: Arc<dyn Capability>, pool: Arc<CapabilityPool>, config: &Config) -> Self {
        Self {
            capability,
            pool,
            review: config.review.clone(),
            max_tokens: config.capability.max_tokens,
            temperature: config.capability.temperature,
        }
    }

    pub fn review_config(&self) -> &crate::config::ReviewConfig {
        &self.review
    }

    /// Synchronous request: run the full pipeline and return the
    /// completed report or the terminal failure.
    pub async fn review(&self, submission: CodeSubmission) -> Result<ReviewReport, ReviewError> {
        let cancel = CancellationToken::new();
        let sink = EventSink::silent(cancel.clone());
        self.run(submission, &sink, &cancel).await
    }

    /// Streaming request: spawn the pipeline and return the frame
    /// receiver. Dropping the receiver cancels the run.
    pub fn stream(
        self: Arc<Self>,
        submission: CodeSubmission,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel(64);
        let service = self;
        tokio::spawn(async move {
            let sink = EventSink::channel(tx, cancel.clone());
            if let Err(err) = service.run(submission, &sink, &cancel).await {
                tracing::debug!(status = err.status_id(), "streaming review ended: {err}");
            }
        });
        rx
    }

    async fn run(
        &self,
        submission: CodeSubmission,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ReviewReport, ReviewError> {
        let result = self.run_inner(&submission, sink, cancel).await;
        match &result {
            Ok(report) => {
                if sink.has_listener() {
                    let _ = sink.emit(PipelineEvent::Result(Box::new(report.clone()))).await;
                }
            }
            Err(err) => Self::emit_failure(sink, err).await,
        }
        result
    }

    async fn emit_failure(sink: &EventSink, err: &ReviewError) {
        let event = match err {
            // Cancellation suppresses all further emission.
            ReviewError::Cancelled => return,
            ReviewError::GlobalTimeout => PipelineEvent::Timeout,
            other => PipelineEvent::Error {
                status: other.status_id(),
                message: other.to_string(),
            },
        };
        let _ = sink.emit(event).await;
    }

    async fn run_inner(
        &self,
        submission: &CodeSubmission,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ReviewReport, ReviewError> {
        let started = Instant::now();
        submission.validate(&self.review)?;

        // Admission: all analysis slots at once, FIFO-fair, or Busy.
        let agent_count = AgentKind::ALL.len();
        let analysis_permits = tokio::select! {
            permits = self.pool.admit(agent_count as u32) => permits?,
            () = cancel.cancelled() => return Err(ReviewError::Cancelled),
        };

        tracing::info!(
            submission = %submission.id,
            filename = %submission.filename,
            language = %submission.language,
            "analysis phase started"
        );

        // ── Phase 1: analysis agents in parallel ─────────────────
        let mut join: JoinSet<AgentRun> = JoinSet::new();
        for kind in AgentKind::ALL {
            let agent = AnalysisAgent::new(
                kind,
                Arc::clone(&self.capability),
                Duration::from_secs(self.review.agent_timeout_secs),
                self.max_tokens,
                self.temperature,
            );
            let task_submission = submission.clone();
            sink.emit(PipelineEvent::Agent(ProgressEvent::new(
                kind.id(),
                ProgressStatus::Started,
                json!({ "label": kind.label() }),
            )))
            .await?;
            join.spawn(async move { agent.analyze(&task_submission).await });
        }

        let deadline = tokio::time::sleep(Duration::from_secs(self.review.global_timeout_secs));
        tokio::pin!(deadline);

        let mut runs: Vec<AgentRun> = Vec::with_capacity(agent_count);
        let mut timed_out = false;

        while runs.len() < agent_count {
            tokio::select! {
                () = cancel.cancelled() => return Err(ReviewError::Cancelled),
                () = &mut deadline => {
                    timed_out = true;
                    break;
                }
                next = join.join_next() => match next {
                    None => break,
                    Some(Ok(run)) => {
                        sink.emit(PipelineEvent::Agent(terminal_event(&run))).await?;
                        runs.push(run);
                    }
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "analysis task died unexpectedly");
                    }
                },
            }
        }

        join.abort_all();

        // Force-mark anything still running so every dispatched agent
        // reaches exactly one terminal state.
        let force_reason = if timed_out {
            FailureKind::Timeout
        } else {
            FailureKind::Unavailable
        };
        for kind in AgentKind::ALL {
            if runs.iter().all(|r| r.agent != kind) {
                let mut run = AgentRun::new(kind);
                run.start();
                run.fail(force_reason, elapsed_ms(started));
                sink.emit(PipelineEvent::Agent(terminal_event(&run))).await?;
                runs.push(run);
            }
        }

        let completed = runs.iter().filter(|r| r.is_completed()).count();
        if timed_out {
            tracing::warn!(
                submission = %submission.id,
                completed,
                "global timeout elapsed during analysis"
            );
            if completed == 0 {
                return Err(ReviewError::GlobalTimeout);
            }
        }

        // Analysis slots free up before the fix call queues for one.
        drop(analysis_permits);

        // ── Phase 2: merge ───────────────────────────────────────
        sink.emit(PipelineEvent::Merging).await?;
        if completed == 0 {
            return Err(ReviewError::AllAgentsFailed);
        }

        let agg = aggregate(
            &runs,
            &self.review.weights,
            &self.review.grades,
            self.review.quick_wins,
        );

        // ── Phase 3: fix ─────────────────────────────────────────
        sink.emit(PipelineEvent::Agent(ProgressEvent::new(
            AUTOFIX_ID,
            ProgressStatus::Started,
            json!({ "label": "Auto-Fix Agent" }),
        )))
        .await?;

        let fix_started = Instant::now();
        let (outcome, degraded_fix) = self.run_fix(submission, &agg, cancel).await?;

        sink.emit(PipelineEvent::Agent(ProgressEvent::new(
            AUTOFIX_ID,
            if degraded_fix {
                ProgressStatus::Failed
            } else {
                ProgressStatus::Completed
            },
            json!({
                "changes": outcome.changes.len(),
                "duration_ms": elapsed_ms(fix_started),
            }),
        )))
        .await?;

        // ── Phase 4: assemble ────────────────────────────────────
        let report = build_report(&runs, agg, outcome, ReportContext {
            processing_time_ms: elapsed_ms(started),
            degraded_fix,
        });

        tracing::info!(
            submission = %submission.id,
            score = report.score,
            grade = %report.grade,
            findings = report.findings.len(),
            degraded = report.metadata.degraded_agents.len(),
            "review completed"
        );

        Ok(report)
    }

    /// Fix phase. Only cancellation is fatal here: pool saturation,
    /// capability errors, and the fix deadline all degrade to the
    /// original code with the degraded flag set.
    async fn run_fix(
        &self,
        submission: &CodeSubmission,
        agg: &Aggregate,
        cancel: &CancellationToken,
    ) -> Result<(FixOutcome, bool), ReviewError> {
        if agg.findings.is_empty() {
            // Clean code: no capability call at all.
            return Ok((FixOutcome::unchanged(&submission.code), false));
        }

        let permit = tokio::select! {
            permit = self.pool.admit(1) => permit,
            () = cancel.cancelled() => return Err(ReviewError::Cancelled),
        };
        let _permit = match permit {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!("pool saturated for fix phase; keeping original code");
                return Ok((FixOutcome::unchanged(&submission.code), true));
            }
        };

        let autofix = AutoFixAgent::new(Arc::clone(&self.capability), self.max_tokens, self.temperature);
        let fix_deadline = Duration::from_secs(self.review.fix_timeout_secs);
        tokio::select! {
            () = cancel.cancelled() => Err(ReviewError::Cancelled),
            result = tokio::time::timeout(fix_deadline, autofix.fix(submission, &agg.findings)) => {
                match result {
                    Ok(Ok(outcome)) => Ok((outcome, false)),
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "fix capability failed; keeping original code");
                        Ok((FixOutcome::unchanged(&submission.code), true))
                    }
                    Err(_) => {
                        tracing::warn!("fix phase exceeded its deadline; keeping original code");
                        Ok((FixOutcome::unchanged(&submission.code), true))
                    }
                }
            }
        }
    }
}

// ── Report assembly ──────────────────────────────────────────────

struct ReportContext {
    processing_time_ms: u64,
    degraded_fix: bool,
}

fn build_report(
    runs: &[AgentRun],
    agg: Aggregate,
    outcome: FixOutcome,
    ctx: ReportContext,
) -> ReviewReport {
    let agent_results: BTreeMap<String, AgentResult> = runs
        .iter()
        .map(|run| {
            let result = match &run.analysis {
                Some(analysis) => AgentResult {
                    score: analysis.score,
                    finding_count: analysis.findings.len(),
                    summary: analysis.summary.clone(),
                    duration_ms: run.duration_ms,
                    failed: false,
                },
                None => AgentResult {
                    score: 0,
                    finding_count: 0,
                    summary: run
                        .failure
                        .map(|f| format!("failed: {}", f.label()))
                        .unwrap_or_default(),
                    duration_ms: run.duration_ms,
                    failed: true,
                },
            };
            (run.agent.id().to_owned(), result)
        })
        .collect();

    let count_of = |severity: Severity| {
        agg.findings.iter().filter(|f| f.severity == severity).count()
    };

    let metadata = ReportMetadata {
        total_findings: agg.findings.len(),
        critical_count: count_of(Severity::Critical),
        high_count: count_of(Severity::High),
        medium_count: count_of(Severity::Medium),
        low_count: count_of(Severity::Low),
        processing_time_ms: ctx.processing_time_ms,
        agents_used: runs.len() + 1,
        degraded_agents: runs
            .iter()
            .filter(|r| !r.is_completed())
            .map(|r| r.agent.id().to_owned())
            .collect(),
        degraded_fix: ctx.degraded_fix,
    };

    ReviewReport {
        findings: agg.findings,
        category_scores: agg.category_scores,
        score: agg.score,
        grade: agg.grade,
        summary: agg.summary,
        fixed_code: outcome.fixed_code,
        changes: outcome.changes,
        quick_wins: agg.quick_wins,
        agent_results,
        metadata,
    }
}

fn terminal_event(run: &AgentRun) -> ProgressEvent {
    match &run.analysis {
        Some(analysis) => ProgressEvent::new(
            run.agent.id(),
            ProgressStatus::Completed,
            json!({
                "label": run.agent.label(),
                "duration_ms": run.duration_ms,
                "findings": analysis.findings.len(),
                "score": analysis.score,
            }),
        ),
        None => ProgressEvent::new(
            run.agent.id(),
            ProgressStatus::Failed,
            json!({
                "label": run.agent.label(),
                "reason": run.failure.map(FailureKind::label),
            }),
        ),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ── Tests ────────────────────────────────────────────────────────
