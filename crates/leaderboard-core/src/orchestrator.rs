//! Evaluation orchestrator.
//!
//! Drives the run through `INIT -> SCHEDULING -> RUNNING(task) -> RECORDING -> ... -> DONE`,
//! with `FATAL` reachable from anywhere. Episodes run strictly one after another and the
//! checkpoint is flushed after every one of them.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::AgentLauncher;
use crate::catalog::{RouteCatalog, RouteDescriptor};
use crate::checkpoint::{CheckpointHeader, CheckpointStore};
use crate::config::EvaluatorConfig;
use crate::error::{
    CatalogError, ConfigError, OrchestratorError, Result, SessionError, SimulatorError,
};
use crate::obs;
use crate::report::EvaluationReport;
use crate::scheduler;
use crate::session::{cancelled, SessionOutcome, SessionRunner, SessionSettings};
use crate::simulator::SimulatorBackend;
use crate::task::EvaluationTask;

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    Scheduling,
    Running(EvaluationTask),
    Recording(EvaluationTask),
    Done,
    Fatal,
}

impl OrchestratorState {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorState::Init => "INIT",
            OrchestratorState::Scheduling => "SCHEDULING",
            OrchestratorState::Running(_) => "RUNNING",
            OrchestratorState::Recording(_) => "RECORDING",
            OrchestratorState::Done => "DONE",
            OrchestratorState::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Running(task) | OrchestratorState::Recording(task) => {
                write!(f, "{}({task})", self.name())
            }
            other => f.write_str(other.name()),
        }
    }
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub checkpoint: PathBuf,
    /// Episodes executed by this run.
    pub executed: usize,
    /// Plan tasks skipped because the checkpoint already held them.
    pub resumed: usize,
    pub report: EvaluationReport,
}

/// Runs every task of the plan against one simulator and one agent.
pub struct Orchestrator {
    config: EvaluatorConfig,
    backend: Arc<dyn SimulatorBackend>,
    launcher: Arc<dyn AgentLauncher>,
    shutdown: watch::Receiver<bool>,
    run_id: Uuid,
    state: OrchestratorState,
}

impl Orchestrator {
    pub fn new(
        config: EvaluatorConfig,
        backend: Arc<dyn SimulatorBackend>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Self {
        // Without a sender the receiver never reports a shutdown.
        let (_, shutdown) = watch::channel(false);
        Self {
            config,
            backend,
            launcher,
            shutdown,
            run_id: Uuid::new_v4(),
            state: OrchestratorState::Init,
        }
    }

    /// Observe `shutdown`; a `true` value interrupts the run.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    /// Execute the whole plan.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let span = obs::run_span(&self.run_id);
        let outcome = self.execute().instrument(span.clone()).await;
        if let Err(e) = &outcome {
            let _guard = span.enter();
            self.transition(OrchestratorState::Fatal);
            tracing::error!(event = "run.fatal", exit_code = e.exit_code(), error = %e);
        }
        outcome
    }

    fn transition(&mut self, next: OrchestratorState) {
        obs::emit_state(&next.to_string());
        self.state = next;
    }

    async fn execute(&mut self) -> Result<RunSummary> {
        self.transition(OrchestratorState::Init);
        let config = self.config.clone();
        config.validate()?;

        let catalog = RouteCatalog::load(&config.routes, &config.scenarios)?;
        let mut tasks = scheduler::build(&catalog, config.repetitions);
        if let Some(scenario_type) = config.scenario_type {
            tasks = scheduler::filter_by_scenario(tasks, &catalog, scenario_type)?;
        }

        let header = CheckpointHeader {
            plan_digest: scheduler::plan_digest(&catalog, config.repetitions, config.track),
            track: config.track,
            repetitions: config.repetitions,
            total_tasks: tasks.len(),
        };
        let mut store = CheckpointStore::open(
            &config.checkpoint,
            &header,
            config.resume,
            config.on_existing_checkpoint,
            self.run_id,
        )?;

        self.preflight().await?;
        if let Some(dir) = &config.record {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::InvalidValue {
                field: "record",
                reason: format!("cannot create {}: {e}", dir.display()),
            })?;
        }
        store.flush()?;

        let pending = scheduler::remaining(&tasks, &store).count();
        let resumed = tasks.len() - pending;
        obs::emit_plan(tasks.len(), resumed);

        let runner = SessionRunner::new(
            self.backend.clone(),
            self.launcher.clone(),
            SessionSettings {
                endpoint: config.endpoint.clone(),
                track: config.track,
                client_timeout: config.client_timeout,
                episode_timeout: config.episode_timeout,
                record_dir: config.record.clone(),
                run_id: self.run_id,
            },
        );

        let mut executed = 0;
        loop {
            self.transition(OrchestratorState::Scheduling);
            let next = scheduler::remaining(&tasks, &store)
                .next()
                .map(|(index, task)| (index, task.clone()));
            let Some((index, task)) = next else {
                break;
            };
            if *self.shutdown.borrow() {
                return Err(OrchestratorError::Interrupted { task: None });
            }
            let route = catalog
                .get(&task.route_id)
                .ok_or_else(|| CatalogError::InvalidRoute {
                    route_id: task.route_id.clone(),
                    message: "scheduled route is missing from the catalog".into(),
                })?;

            self.transition(OrchestratorState::Running(task.clone()));
            obs::emit_task_started(index + 1, tasks.len(), &task);
            let outcome = self.run_with_retries(&runner, &task, route).await?;

            self.transition(OrchestratorState::Recording(task.clone()));
            if let Some(profile) = &outcome.profile {
                store.record_sensors(&profile.sensor_types());
            }
            store.set_progress(index + 1);
            obs::emit_task_recorded(&outcome.result);
            store.append(outcome.result)?;
            executed += 1;
        }

        self.transition(OrchestratorState::Done);
        let planned: HashSet<&EvaluationTask> = tasks.iter().collect();
        let report = EvaluationReport::fold(
            store
                .file()
                .results()
                .filter(|result| planned.contains(&result.task)),
            tasks.len(),
        );
        store.set_global_record(report.clone());
        store.flush()?;
        obs::emit_report(&report);

        Ok(RunSummary {
            run_id: self.run_id,
            checkpoint: config.checkpoint.clone(),
            executed,
            resumed,
            report,
        })
    }

    /// Handshake with the simulator before anything is written.
    async fn preflight(&self) -> Result<()> {
        let endpoint = &self.config.endpoint;
        let probed =
            tokio::time::timeout(self.config.client_timeout, self.backend.probe(endpoint)).await;
        let version = match probed {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => return Err(OrchestratorError::SimulatorUnreachable(e)),
            Err(_) => {
                return Err(OrchestratorError::SimulatorUnreachable(
                    SimulatorError::Unreachable {
                        endpoint: endpoint.address(),
                        reason: format!("no handshake within {:?}", self.config.client_timeout),
                    },
                ))
            }
        };
        obs::emit_preflight_ok(&endpoint.to_string(), &version);
        Ok(())
    }

    /// Run one task, retrying infrastructure failures with exponential backoff.
    ///
    /// `infra_retries + 1` consecutive infrastructure failures make the run fatal.
    async fn run_with_retries(
        &mut self,
        runner: &SessionRunner,
        task: &EvaluationTask,
        route: &RouteDescriptor,
    ) -> Result<SessionOutcome> {
        let max_attempts = self.config.infra_retries + 1;
        let mut attempt = 1;
        loop {
            let span = obs::task_span(task, attempt);
            let ran = runner
                .run(task, route, attempt, &mut self.shutdown)
                .instrument(span)
                .await;
            match ran {
                Ok(outcome) => return Ok(outcome),
                Err(SessionError::Infrastructure { source, .. }) if attempt < max_attempts => {
                    let delay = self
                        .config
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    obs::emit_task_retry(task, attempt, delay.as_millis() as u64, &source);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(&mut self.shutdown) => {
                            return Err(OrchestratorError::Interrupted {
                                task: Some(task.clone()),
                            });
                        }
                    }
                    attempt += 1;
                }
                Err(SessionError::Infrastructure { task, source }) => {
                    return Err(OrchestratorError::Fatal {
                        task,
                        attempts: attempt,
                        source,
                    })
                }
                Err(SessionError::InvalidSensors { task, reason }) => {
                    return Err(ConfigError::InvalidSensors(format!("{task}: {reason}")).into())
                }
                Err(SessionError::Cancelled { task }) => {
                    return Err(OrchestratorError::Interrupted { task: Some(task) })
                }
            }
        }
    }
}
