//! Checkpoint store and scheduler working together across evaluator restarts.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use leaderboard_core::checkpoint::{self, CheckpointLock};
use leaderboard_core::{
    scheduler, CheckpointError, CheckpointHeader, CheckpointStore, EvaluationReport,
    EvaluationResult, EvaluationTask, ExistingCheckpointPolicy, InfractionKind, OutcomeStatus,
    RouteCatalog, ScoreBreakdown, Track, CHECKPOINT_SCHEMA,
};
use uuid::Uuid;

const ROUTES: &str = r#"<routes>
  <route id="10" town="Town02">
    <waypoint x="1.0" y="2.0" z="0.0"/>
    <waypoint x="40.0" y="2.0" z="0.0"/>
  </route>
  <route id="11" town="Town02">
    <waypoint x="-5.0" y="0.0" z="0.0"/>
  </route>
  <route id="12" town="Town03">
    <waypoint x="7.0" y="7.0" z="0.0"/>
  </route>
</routes>"#;

fn catalog(dir: &Path) -> RouteCatalog {
    std::fs::write(dir.join("routes.xml"), ROUTES).unwrap();
    std::fs::write(dir.join("scenarios.json"), r#"{"available_scenarios": []}"#).unwrap();
    RouteCatalog::load(&dir.join("routes.xml"), &dir.join("scenarios.json")).unwrap()
}

fn header(catalog: &RouteCatalog, repetitions: u32) -> CheckpointHeader {
    CheckpointHeader {
        plan_digest: scheduler::plan_digest(catalog, repetitions, Track::Sensors),
        track: Track::Sensors,
        repetitions,
        total_tasks: catalog.len() * repetitions as usize,
    }
}

fn result(task: &EvaluationTask, status: OutcomeStatus, completion: f64) -> EvaluationResult {
    let mut infractions = BTreeMap::new();
    if status == OutcomeStatus::Failure {
        infractions.insert(InfractionKind::CollisionStatic, 1);
    }
    EvaluationResult {
        task: task.clone(),
        status,
        scores: ScoreBreakdown::compute(completion, &infractions),
        infraction_count: infractions.values().sum(),
        infractions,
        duration_ms: 4000,
        sim_time_s: 12.5,
        failure_reason: None,
        recording: None,
        attempts: 1,
        started_at: Utc::now(),
        run_id: Uuid::nil(),
    }
}

fn open(
    path: &Path,
    header: &CheckpointHeader,
    resume: bool,
) -> Result<CheckpointStore, CheckpointError> {
    CheckpointStore::open(
        path,
        header,
        resume,
        ExistingCheckpointPolicy::Reject,
        Uuid::new_v4(),
    )
}

#[test]
fn test_restart_resumes_at_first_unrecorded_task() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog(dir.path());
    let header = header(&catalog, 2);
    let tasks = scheduler::build(&catalog, 2);
    let path = dir.path().join("results.json");

    {
        let mut store = open(&path, &header, false).unwrap();
        store.flush().unwrap();
        for (index, task) in tasks.iter().take(3).enumerate() {
            store.set_progress(index + 1);
            assert!(store
                .append(result(task, OutcomeStatus::Success, 100.0))
                .unwrap());
        }
    }
    assert!(!CheckpointLock::path_for(&path).exists());

    let store = open(&path, &header, true).unwrap();
    assert_eq!(store.resumed_count(), 3);
    assert_eq!(store.file().progress.next_task_index, 3);
    let pending: Vec<_> = scheduler::remaining(&tasks, &store)
        .map(|(index, task)| (index, task.clone()))
        .collect();
    assert_eq!(
        pending,
        vec![
            (3, EvaluationTask::new("11", 1)),
            (4, EvaluationTask::new("12", 0)),
            (5, EvaluationTask::new("12", 1)),
        ]
    );
}

#[test]
fn test_reloaded_result_appends_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog(dir.path());
    let header = header(&catalog, 1);
    let path = dir.path().join("results.json");
    let task = EvaluationTask::new("10", 0);

    {
        let mut store = open(&path, &header, false).unwrap();
        store
            .append(result(&task, OutcomeStatus::Failure, 80.0))
            .unwrap();
    }

    let mut store = open(&path, &header, true).unwrap();
    let recorded = store.entries()[0].result.clone();
    assert!((recorded.scores.driving_score - 52.0).abs() < 1e-9);
    assert!(!store.append(recorded.clone()).unwrap());

    let mut different = recorded;
    different.status = OutcomeStatus::Crashed;
    assert!(matches!(
        store.append(different),
        Err(CheckpointError::DuplicateTask { .. })
    ));
    assert_eq!(checkpoint::load(&path).unwrap().unwrap().entries.len(), 1);
}

#[test]
fn test_changed_plan_refuses_resume() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog(dir.path());
    let path = dir.path().join("results.json");
    {
        let mut store = open(&path, &header(&catalog, 2), false).unwrap();
        store
            .append(result(&EvaluationTask::new("10", 0), OutcomeStatus::Success, 100.0))
            .unwrap();
    }

    let err = open(&path, &header(&catalog, 3), true).unwrap_err();
    assert!(matches!(err, CheckpointError::PlanMismatch { .. }));
    assert_eq!(checkpoint::load(&path).unwrap().unwrap().repetitions, 2);
}

#[test]
fn test_second_evaluator_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog(dir.path());
    let header = header(&catalog, 1);
    let path = dir.path().join("results.json");

    let _first = open(&path, &header, false).unwrap();
    match open(&path, &header, true) {
        Err(CheckpointError::Locked { lock_path, holder }) => {
            assert_eq!(lock_path, CheckpointLock::path_for(&path));
            assert!(holder.contains("pid="));
        }
        other => panic!("expected Locked, got {other:?}"),
    }
}

#[test]
fn test_foreign_schema_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog(dir.path());
    let path = dir.path().join("results.json");
    std::fs::write(
        &path,
        r#"{"schema_version": "leaderboard.checkpoint.v0", "entries": []}"#,
    )
    .unwrap();

    let err = open(&path, &header(&catalog, 1), true).unwrap_err();
    match err {
        CheckpointError::IncompatibleSchema { found, expected, .. } => {
            assert_eq!(found, "leaderboard.checkpoint.v0");
            assert_eq!(expected, CHECKPOINT_SCHEMA);
        }
        other => panic!("expected IncompatibleSchema, got {other:?}"),
    }
}

#[test]
fn test_empty_file_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog(dir.path());
    let path = dir.path().join("results.json");
    std::fs::write(&path, "").unwrap();

    let mut store = open(&path, &header(&catalog, 1), false).unwrap();
    store.flush().unwrap();
    let file = checkpoint::load(&path).unwrap().unwrap();
    assert_eq!(file.schema_version, CHECKPOINT_SCHEMA);
    assert_eq!(file.total_tasks, 3);
    assert!(file.entries.is_empty());
}

#[test]
fn test_report_over_reloaded_results() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog(dir.path());
    let header = header(&catalog, 1);
    let path = dir.path().join("results.json");
    {
        let mut store = open(&path, &header, false).unwrap();
        store
            .append(result(&EvaluationTask::new("10", 0), OutcomeStatus::Success, 100.0))
            .unwrap();
        store
            .append(result(&EvaluationTask::new("11", 0), OutcomeStatus::Failure, 50.0))
            .unwrap();
    }

    let file = checkpoint::load(&path).unwrap().unwrap();
    let report = EvaluationReport::fold(file.results(), header.total_tasks);
    assert_eq!(report.completed_tasks, 2);
    assert!(!report.is_complete());
    assert_eq!(report.global.mean_route_completion, 75.0);
    assert_eq!(report.global.count(OutcomeStatus::Failure), 1);
    assert_eq!(report.routes.len(), 2);
    assert!(report.render_summary().contains("2/3 task(s) recorded"));
}
