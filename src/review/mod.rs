//! Multi-agent code review pipeline.
//!
//! One submission fans out to four domain analysis agents running
//! concurrently, their findings merge into a weighted, graded report,
//! and an auto-fix agent produces corrected code from the merged
//! findings:
//!
//! ```text
//!             ┌─▸ SecurityAgent ────┐
//!             ├─▸ PerformanceAgent ─┤
//! submission ─┼─▸ StyleAgent ───────┼─▸ aggregate ─▸ AutoFixAgent ─▸ ReviewReport
//!             └─▸ BugDetectorAgent ─┘      │
//!                                          └─ dedup + renormalized weights + grade
//! ```
//!
//! Failure isolation is the core property: one agent failing (or
//! timing out) never aborts its siblings or the pipeline — it is
//! excluded from scoring and recorded as degraded. Only zero
//! surviving agents aborts the request.
//!
//! ## Extension
//!
//! Analysis domains are closed over [`types::AgentKind`]; adding one
//! means a new kind, a domain profile in [`agents`], and a weight in
//! [`aggregate::ScoreWeights`].

pub mod agents;
pub mod aggregate;
pub mod autofix;
pub mod orchestrator;
pub mod pool;
pub mod types;

pub use orchestrator::{PipelineEvent, ReviewService};
pub use pool::CapabilityPool;
pub use types::{
    AgentKind, AgentRun, AgentStatus, CodeSubmission, Finding, InputError, ProgressEvent,
    ProgressStatus, ReviewError, ReviewReport, Severity,
};
