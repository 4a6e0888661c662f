//! Structured lifecycle events of an evaluation run.
//!
//! Every event carries an `event` field (`orchestrator.state`, `task.recorded`, ...) so log pipelines
//! can filter on it regardless of the message text.

use tracing::{info, warn};

use crate::report::EvaluationReport;
use crate::task::{EvaluationResult, EvaluationTask};

/// Span wrapping a whole orchestrator run.
pub fn run_span(run_id: &uuid::Uuid) -> tracing::Span {
    tracing::info_span!("leaderboard.run", run_id = %run_id)
}

/// Span wrapping one attempt at one task.
pub fn task_span(task: &EvaluationTask, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "leaderboard.task",
        route = %task.route_id,
        repetition = task.repetition,
        attempt = attempt
    )
}

/// Orchestrator state transition.
pub fn emit_state(state: &str) {
    info!(event = "orchestrator.state", state = %state);
}

pub fn emit_preflight_ok(endpoint: &str, server_version: &str) {
    info!(event = "run.preflight", endpoint = %endpoint, server_version = %server_version);
}

/// Planned vs. already-recorded work at the start of a run.
pub fn emit_plan(total_tasks: usize, resumed: usize) {
    info!(
        event = "run.plan",
        total_tasks = total_tasks,
        resumed = resumed,
        remaining = total_tasks.saturating_sub(resumed),
    );
}

pub fn emit_task_started(index: usize, total: usize, task: &EvaluationTask) {
    info!(
        event = "task.started",
        index = index,
        total = total,
        route = %task.route_id,
        repetition = task.repetition,
    );
}

pub fn emit_task_recorded(result: &EvaluationResult) {
    info!(
        event = "task.recorded",
        route = %result.task.route_id,
        repetition = result.task.repetition,
        status = %result.status,
        driving_score = result.scores.driving_score,
        route_completion = result.scores.route_completion,
        infractions = result.infraction_count,
        duration_ms = result.duration_ms,
    );
}

pub fn emit_task_retry(task: &EvaluationTask, attempt: u32, delay_ms: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "task.retry",
        route = %task.route_id,
        repetition = task.repetition,
        attempt = attempt,
        delay_ms = delay_ms,
        error = %error,
    );
}

pub fn emit_report(report: &EvaluationReport) {
    info!(
        event = "run.report",
        completed = report.completed_tasks,
        total = report.total_tasks,
        driving_score = report.global.mean_driving_score,
        route_completion = report.global.mean_route_completion,
    );
}
