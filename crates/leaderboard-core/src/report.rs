//! Aggregate report folded over every result in a checkpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::{EvaluationResult, InfractionKind, OutcomeStatus};

/// Mean scores and tallies over a set of results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub episodes: u32,
    pub mean_route_completion: f64,
    pub mean_infraction_penalty: f64,
    pub mean_driving_score: f64,
    pub outcomes: BTreeMap<OutcomeStatus, u32>,
    pub infractions: BTreeMap<InfractionKind, u32>,
}

impl ScoreSummary {
    fn add(&mut self, result: &EvaluationResult) {
        self.episodes += 1;
        self.mean_route_completion += result.scores.route_completion;
        self.mean_infraction_penalty += result.scores.infraction_penalty;
        self.mean_driving_score += result.scores.driving_score;
        *self.outcomes.entry(result.status).or_default() += 1;
        for (kind, count) in &result.infractions {
            *self.infractions.entry(*kind).or_default() += count;
        }
    }

    fn finish(&mut self) {
        if self.episodes > 0 {
            let n = f64::from(self.episodes);
            self.mean_route_completion /= n;
            self.mean_infraction_penalty /= n;
            self.mean_driving_score /= n;
        }
    }

    pub fn count(&self, status: OutcomeStatus) -> u32 {
        self.outcomes.get(&status).copied().unwrap_or(0)
    }
}

/// Per-route slice of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub route_id: String,
    pub summary: ScoreSummary,
}

/// Final aggregate over all recorded results, resumed ones included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Tasks in the plan.
    pub total_tasks: usize,
    /// Tasks with a recorded result.
    pub completed_tasks: usize,
    /// Routes in order of first appearance.
    pub routes: Vec<RouteRecord>,
    pub global: ScoreSummary,
}

impl EvaluationReport {
    /// Fold results into per-route and overall summaries.
    pub fn fold<'a>(
        results: impl IntoIterator<Item = &'a EvaluationResult>,
        total_tasks: usize,
    ) -> Self {
        let mut routes: Vec<RouteRecord> = Vec::new();
        let mut global = ScoreSummary::default();

        for result in results {
            global.add(result);
            let pos = match routes
                .iter()
                .position(|r| r.route_id == result.task.route_id)
            {
                Some(pos) => pos,
                None => {
                    routes.push(RouteRecord {
                        route_id: result.task.route_id.clone(),
                        summary: ScoreSummary::default(),
                    });
                    routes.len() - 1
                }
            };
            routes[pos].summary.add(result);
        }

        global.finish();
        for route in &mut routes {
            route.summary.finish();
        }

        Self {
            total_tasks,
            completed_tasks: global.episodes as usize,
            routes,
            global,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_tasks >= self.total_tasks
    }

    /// Human-readable summary printed at the end of a run.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Evaluation summary: {}/{} task(s) recorded\n",
            self.completed_tasks, self.total_tasks
        ));
        out.push_str(&format!(
            "  driving score {:.2}  route completion {:.2}  infraction penalty {:.3}\n",
            self.global.mean_driving_score,
            self.global.mean_route_completion,
            self.global.mean_infraction_penalty
        ));
        out.push_str(&format!(
            "  outcomes: {}\n",
            render_outcomes(&self.global.outcomes)
        ));
        if !self.global.infractions.is_empty() {
            let infractions: Vec<String> = self
                .global
                .infractions
                .iter()
                .map(|(kind, n)| format!("{kind}={n}"))
                .collect();
            out.push_str(&format!("  infractions: {}\n", infractions.join(" ")));
        }
        for route in &self.routes {
            out.push_str(&format!(
                "  route {:<8} reps {:<3} score {:>6.2}  completion {:>6.2}  {}\n",
                route.route_id,
                route.summary.episodes,
                route.summary.mean_driving_score,
                route.summary.mean_route_completion,
                render_outcomes(&route.summary.outcomes)
            ));
        }
        out
    }
}

fn render_outcomes(outcomes: &BTreeMap<OutcomeStatus, u32>) -> String {
    if outcomes.is_empty() {
        return "none".to_string();
    }
    outcomes
        .iter()
        .map(|(status, n)| format!("{status}={n}"))
        .collect::<Vec<_>>()
        .join(" ")
}
