//! Task scheduling: expand routes into tasks and skip what the checkpoint already holds.

use sha2::{Digest, Sha256};

use crate::catalog::{RouteCatalog, ScenarioType};
use crate::checkpoint::CheckpointStore;
use crate::config::Track;
use crate::error::ConfigError;
use crate::task::EvaluationTask;

/// Expand every route into `repetitions` tasks, ordered by route then repetition.
pub fn build(catalog: &RouteCatalog, repetitions: u32) -> Vec<EvaluationTask> {
    catalog
        .routes()
        .iter()
        .flat_map(|route| (0..repetitions).map(move |rep| EvaluationTask::new(route.id.clone(), rep)))
        .collect()
}

/// Keep only tasks whose route carries a trigger of `scenario_type`.
pub fn filter_by_scenario(
    tasks: Vec<EvaluationTask>,
    catalog: &RouteCatalog,
    scenario_type: ScenarioType,
) -> Result<Vec<EvaluationTask>, ConfigError> {
    let kept: Vec<_> = tasks
        .into_iter()
        .filter(|task| {
            catalog
                .get(&task.route_id)
                .is_some_and(|route| route.has_scenario(scenario_type))
        })
        .collect();
    if kept.is_empty() {
        return Err(ConfigError::NoRoutesMatched(scenario_type.to_string()));
    }
    Ok(kept)
}

/// Tasks not yet recorded in `store`, with their index in the plan, in plan order.
pub fn remaining<'a>(
    tasks: &'a [EvaluationTask],
    store: &'a CheckpointStore,
) -> impl Iterator<Item = (usize, &'a EvaluationTask)> + 'a {
    tasks
        .iter()
        .enumerate()
        .filter(move |(_, task)| !store.has(task))
}

/// Fingerprint of the plan a checkpoint belongs to.
pub fn plan_digest(catalog: &RouteCatalog, repetitions: u32, track: Track) -> String {
    let mut hasher = Sha256::new();
    for route in catalog.routes() {
        hasher.update(route.id.as_bytes());
        hasher.update(b"\0");
        hasher.update(route.town.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(repetitions.to_le_bytes());
    hasher.update(track.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{RouteDescriptor, ScenarioTrigger, TriggerLocation, Waypoint};
    use crate::config::ExistingCheckpointPolicy;
    use crate::checkpoint::CheckpointHeader;
    use crate::task::{EvaluationResult, OutcomeStatus, ScoreBreakdown};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn route(id: &str, scenario: Option<ScenarioType>) -> RouteDescriptor {
        RouteDescriptor {
            id: id.into(),
            town: "Town01".into(),
            waypoints: vec![Waypoint::default()],
            weather: None,
            triggers: scenario
                .map(|scenario_type| ScenarioTrigger {
                    scenario_type,
                    location: TriggerLocation::default(),
                    parameters: serde_json::Map::new(),
                })
                .into_iter()
                .collect(),
        }
    }

    fn catalog() -> RouteCatalog {
        RouteCatalog::new(vec![
            route("r0", Some(ScenarioType::Scenario3)),
            route("r1", None),
        ])
        .unwrap()
    }

    #[test]
    fn test_build_orders_by_route_then_repetition() {
        let tasks = build(&catalog(), 2);
        assert_eq!(
            tasks,
            vec![
                EvaluationTask::new("r0", 0),
                EvaluationTask::new("r0", 1),
                EvaluationTask::new("r1", 0),
                EvaluationTask::new("r1", 1),
            ]
        );
    }

    #[test]
    fn test_filter_by_scenario() {
        let catalog = catalog();
        let tasks = filter_by_scenario(build(&catalog, 1), &catalog, ScenarioType::Scenario3).unwrap();
        assert_eq!(tasks, vec![EvaluationTask::new("r0", 0)]);

        let err = filter_by_scenario(build(&catalog, 1), &catalog, ScenarioType::Scenario9)
            .unwrap_err();
        assert!(err.to_string().contains("Scenario9"));
    }

    #[test]
    fn test_remaining_skips_recorded_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog();
        let tasks = build(&catalog, 2);
        let header = CheckpointHeader {
            plan_digest: plan_digest(&catalog, 2, Track::Sensors),
            track: Track::Sensors,
            repetitions: 2,
            total_tasks: tasks.len(),
        };
        let mut store = CheckpointStore::open(
            &dir.path().join("results.json"),
            &header,
            false,
            ExistingCheckpointPolicy::Reject,
            Uuid::new_v4(),
        )
        .unwrap();
        store
            .append(EvaluationResult {
                task: EvaluationTask::new("r0", 1),
                status: OutcomeStatus::Crashed,
                scores: ScoreBreakdown::compute(0.0, &BTreeMap::new()),
                infractions: BTreeMap::new(),
                infraction_count: 0,
                duration_ms: 0,
                sim_time_s: 0.0,
                failure_reason: Some("agent raised".into()),
                recording: None,
                attempts: 1,
                started_at: chrono::Utc::now(),
                run_id: Uuid::nil(),
            })
            .unwrap();

        let left: Vec<_> = remaining(&tasks, &store).map(|(i, t)| (i, t.clone())).collect();
        assert_eq!(
            left,
            vec![
                (0, EvaluationTask::new("r0", 0)),
                (2, EvaluationTask::new("r1", 0)),
                (3, EvaluationTask::new("r1", 1)),
            ]
        );
    }

    #[test]
    fn test_plan_digest_tracks_inputs() {
        let catalog = catalog();
        let base = plan_digest(&catalog, 2, Track::Sensors);
        assert_eq!(base, plan_digest(&catalog, 2, Track::Sensors));
        assert_ne!(base, plan_digest(&catalog, 3, Track::Sensors));
        assert_ne!(base, plan_digest(&catalog, 2, Track::Map));
        assert_eq!(base.len(), 64);
    }
}
