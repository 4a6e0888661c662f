//! Evaluation tasks, outcomes and score components.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unit of scheduling: one attempt at one route.
///
/// Identity is the full `(route_id, repetition)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvaluationTask {
    pub route_id: String,
    pub repetition: u32,
}

impl EvaluationTask {
    pub fn new(route_id: impl Into<String>, repetition: u32) -> Self {
        Self {
            route_id: route_id.into(),
            repetition,
        }
    }
}

impl fmt::Display for EvaluationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route {} rep {}", self.route_id, self.repetition)
    }
}

/// Terminal status of one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    /// The agent reached the end of the route.
    Success,
    /// A terminal infraction ended the episode.
    Failure,
    /// The episode or a single tick exceeded its time budget.
    Timeout,
    /// The agent or the scenario broke down.
    Crashed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "SUCCESS",
            OutcomeStatus::Failure => "FAILURE",
            OutcomeStatus::Timeout => "TIMEOUT",
            OutcomeStatus::Crashed => "CRASHED",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infractions the simulator can report during an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfractionKind {
    CollisionPedestrian,
    CollisionVehicle,
    CollisionStatic,
    RedLight,
    StopSign,
    OutsideRouteLanes,
    RouteDeviation,
    AgentBlocked,
}

impl InfractionKind {
    /// Multiplicative driving-score penalty applied per occurrence.
    pub fn penalty(&self) -> f64 {
        match self {
            InfractionKind::CollisionPedestrian => 0.50,
            InfractionKind::CollisionVehicle => 0.60,
            InfractionKind::CollisionStatic => 0.65,
            InfractionKind::RedLight => 0.70,
            InfractionKind::StopSign => 0.80,
            InfractionKind::OutsideRouteLanes
            | InfractionKind::RouteDeviation
            | InfractionKind::AgentBlocked => 1.0,
        }
    }

    /// Whether an occurrence ends the episode as a failure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InfractionKind::CollisionPedestrian
                | InfractionKind::CollisionVehicle
                | InfractionKind::CollisionStatic
                | InfractionKind::RedLight
                | InfractionKind::RouteDeviation
                | InfractionKind::AgentBlocked
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InfractionKind::CollisionPedestrian => "collision_pedestrian",
            InfractionKind::CollisionVehicle => "collision_vehicle",
            InfractionKind::CollisionStatic => "collision_static",
            InfractionKind::RedLight => "red_light",
            InfractionKind::StopSign => "stop_sign",
            InfractionKind::OutsideRouteLanes => "outside_route_lanes",
            InfractionKind::RouteDeviation => "route_deviation",
            InfractionKind::AgentBlocked => "agent_blocked",
        }
    }
}

impl fmt::Display for InfractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric score components of one episode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Percentage of the route covered, 0..=100.
    pub route_completion: f64,
    /// Product of per-infraction penalties, 0..=1.
    pub infraction_penalty: f64,
    /// `route_completion * infraction_penalty`.
    pub driving_score: f64,
}

impl ScoreBreakdown {
    pub fn compute(route_completion: f64, infractions: &BTreeMap<InfractionKind, u32>) -> Self {
        let route_completion = route_completion.clamp(0.0, 100.0);
        let infraction_penalty = infractions
            .iter()
            .map(|(kind, count)| kind.penalty().powi(*count as i32))
            .product::<f64>();
        Self {
            route_completion,
            infraction_penalty,
            driving_score: route_completion * infraction_penalty,
        }
    }
}

/// Outcome of one task, appended once to the checkpoint and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub task: EvaluationTask,
    pub status: OutcomeStatus,
    pub scores: ScoreBreakdown,
    /// Occurrences per infraction kind.
    #[serde(default)]
    pub infractions: BTreeMap<InfractionKind, u32>,
    pub infraction_count: u32,
    /// Wall-clock duration of the episode in milliseconds.
    pub duration_ms: u64,
    /// Simulated time at the last observed tick.
    pub sim_time_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<PathBuf>,
    /// Infrastructure attempts used, including the successful one.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub run_id: Uuid,
}

impl EvaluationResult {
    pub fn passed(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}
