//! Session runner: one simulator connection, one agent, one episode.
//!
//! Every terminal condition of an episode becomes an [`EvaluationResult`] except the ones the
//! orchestrator has to act on (lost infrastructure, an agent that may not run on this track,
//! operator interrupt), which come back as [`SessionError`]. The agent and the simulator
//! connection are released on every path before `run` returns.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::agent::{validate_sensor_configuration, AgentLauncher, AgentProfile, DrivingAgent};
use crate::catalog::RouteDescriptor;
use crate::config::{SimEndpoint, Track};
use crate::error::{AgentError, SessionError, SimulatorError};
use crate::simulator::{InfractionEvent, Observation, SessionHandle, SimulatorBackend, Tick};
use crate::task::{
    EvaluationResult, EvaluationTask, InfractionKind, OutcomeStatus, ScoreBreakdown,
};

/// Per-run settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoint: SimEndpoint,
    pub track: Track,
    /// Bound on any single simulator or agent call.
    pub client_timeout: Duration,
    /// Bound on the whole episode.
    pub episode_timeout: Duration,
    /// Recording directory, if episodes are recorded.
    pub record_dir: Option<PathBuf>,
    pub run_id: Uuid,
}

/// A finished episode.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub result: EvaluationResult,
    /// The agent's declared setup, when it got that far.
    pub profile: Option<AgentProfile>,
}

/// Why an episode stopped.
#[derive(Debug)]
enum Termination {
    Completed,
    Infraction(InfractionEvent),
    EpisodeTimeout,
    Watchdog(&'static str),
    AgentFailed(AgentError),
    SimulatorFailed(SimulatorError),
    InvalidSensors(String),
    Cancelled,
}

/// Running totals over the ticks of one episode.
#[derive(Debug, Default)]
struct EpisodeTally {
    route_completion: f64,
    sim_time_s: f64,
    infractions: BTreeMap<InfractionKind, u32>,
}

impl EpisodeTally {
    /// Fold a tick in and report whether it ends the episode.
    ///
    /// A terminal infraction wins over route completion on the same tick.
    fn observe(&mut self, tick: &Tick) -> Option<Termination> {
        self.sim_time_s = tick.sim_time_s;
        self.route_completion = self.route_completion.max(tick.route_completion);

        let mut terminal = None;
        for event in &tick.infractions {
            *self.infractions.entry(event.kind).or_default() += 1;
            if terminal.is_none() && event.kind.is_terminal() {
                terminal = Some(event.clone());
            }
        }
        match terminal {
            Some(event) => Some(Termination::Infraction(event)),
            None if tick.route_completed => Some(Termination::Completed),
            None => None,
        }
    }
}

/// Mutable state of an episode in flight, owned outside the episode future so cleanup can
/// reach it after a timeout or interrupt drops that future.
struct Episode {
    handle: SessionHandle,
    agent: Option<Box<dyn DrivingAgent>>,
    tally: EpisodeTally,
    profile: Option<AgentProfile>,
    recording: Option<PathBuf>,
}

/// Runs single episodes against a simulator backend and an agent launcher.
pub struct SessionRunner {
    backend: Arc<dyn SimulatorBackend>,
    launcher: Arc<dyn AgentLauncher>,
    settings: SessionSettings,
}

impl SessionRunner {
    pub fn new(
        backend: Arc<dyn SimulatorBackend>,
        launcher: Arc<dyn AgentLauncher>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            backend,
            launcher,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Run `task` on `route`. `attempt` is the 1-based infrastructure attempt number.
    pub async fn run(
        &self,
        task: &EvaluationTask,
        route: &RouteDescriptor,
        attempt: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<SessionOutcome, SessionError> {
        if *cancel.borrow() {
            return Err(SessionError::Cancelled { task: task.clone() });
        }
        let started_at = Utc::now();
        let clock = Instant::now();
        let settings = &self.settings;

        let connected = tokio::time::timeout(
            settings.client_timeout,
            self.backend.connect(&settings.endpoint),
        )
        .await;
        let session = match connected {
            Ok(Ok(session)) => session,
            Ok(Err(e)) if e.is_infrastructure() => {
                return Err(SessionError::Infrastructure {
                    task: task.clone(),
                    source: e,
                })
            }
            Ok(Err(e)) => {
                let mut tally = EpisodeTally::default();
                return Ok(SessionOutcome {
                    result: self.finish(
                        task,
                        OutcomeStatus::Crashed,
                        Some(format!("simulator refused the session: {e}")),
                        &mut tally,
                        None,
                        attempt,
                        started_at,
                        clock,
                    ),
                    profile: None,
                });
            }
            Err(_) => {
                return Err(SessionError::Infrastructure {
                    task: task.clone(),
                    source: SimulatorError::Unreachable {
                        endpoint: settings.endpoint.address(),
                        reason: format!("no session within {:?}", settings.client_timeout),
                    },
                })
            }
        };

        let mut episode = Episode {
            handle: SessionHandle::new(session, settings.endpoint.clone()),
            agent: None,
            tally: EpisodeTally::default(),
            profile: None,
            recording: None,
        };

        let termination = {
            let drive = self.drive(&mut episode, task, route);
            tokio::select! {
                biased;
                _ = cancelled(cancel) => Termination::Cancelled,
                finished = tokio::time::timeout(settings.episode_timeout, drive) => {
                    finished.unwrap_or(Termination::EpisodeTimeout)
                }
            }
        };

        let Episode {
            handle,
            agent,
            mut tally,
            profile,
            recording,
        } = episode;
        self.release(handle, agent).await;

        tracing::debug!(%task, termination = ?termination, "episode ended");
        let (status, reason) = match termination {
            Termination::Completed => (OutcomeStatus::Success, None),
            Termination::Infraction(event) => {
                let mut reason = format!("{} at frame {}", event.kind, event.frame);
                if let Some(detail) = event.detail {
                    reason.push_str(&format!(": {detail}"));
                }
                (OutcomeStatus::Failure, Some(reason))
            }
            Termination::EpisodeTimeout => (
                OutcomeStatus::Timeout,
                Some(format!(
                    "episode exceeded {}s",
                    settings.episode_timeout.as_secs_f64()
                )),
            ),
            Termination::Watchdog(call) => (
                OutcomeStatus::Timeout,
                Some(format!(
                    "{call} exceeded the {}s client timeout",
                    settings.client_timeout.as_secs_f64()
                )),
            ),
            Termination::AgentFailed(e) => (OutcomeStatus::Crashed, Some(e.to_string())),
            Termination::SimulatorFailed(e) if e.is_infrastructure() => {
                return Err(SessionError::Infrastructure {
                    task: task.clone(),
                    source: e,
                })
            }
            Termination::SimulatorFailed(e) => (OutcomeStatus::Crashed, Some(e.to_string())),
            Termination::InvalidSensors(reason) => {
                return Err(SessionError::InvalidSensors {
                    task: task.clone(),
                    reason,
                })
            }
            Termination::Cancelled => return Err(SessionError::Cancelled { task: task.clone() }),
        };

        Ok(SessionOutcome {
            result: self.finish(
                task, status, reason, &mut tally, recording, attempt, started_at, clock,
            ),
            profile,
        })
    }

    /// Agent setup, route load, optional recording, then the step loop.
    async fn drive(
        &self,
        episode: &mut Episode,
        task: &EvaluationTask,
        route: &RouteDescriptor,
    ) -> Termination {
        let limit = self.settings.client_timeout;

        let mut agent = match watchdog(limit, self.launcher.launch()).await {
            Some(Ok(agent)) => agent,
            Some(Err(e)) => return Termination::AgentFailed(e),
            None => return Termination::AgentFailed(AgentError::Launch("agent launch timed out".into())),
        };
        let configured = watchdog(limit, agent.configure(route)).await;
        episode.agent = Some(agent);
        let profile = match configured {
            Some(Ok(profile)) => profile,
            Some(Err(e)) => return Termination::AgentFailed(e),
            None => return Termination::AgentFailed(AgentError::Raised("agent setup timed out".into())),
        };
        if let Err(reason) = validate_sensor_configuration(&profile, self.settings.track) {
            return Termination::InvalidSensors(reason);
        }
        episode.profile = Some(profile);

        let mut tick = match watchdog(limit, episode.handle.load_route(route, task.repetition)).await {
            Some(Ok(tick)) => tick,
            Some(Err(e)) => return Termination::SimulatorFailed(e),
            None => {
                return Termination::SimulatorFailed(SimulatorError::ConnectionLost(
                    "route load did not answer within the client timeout".into(),
                ))
            }
        };

        if let Some(dir) = &self.settings.record_dir {
            let path = dir.join(format!("{}_rep{}.log", task.route_id, task.repetition));
            match watchdog(limit, episode.handle.start_recording(&path)).await {
                Some(Ok(())) => episode.recording = Some(path),
                Some(Err(e)) if e.is_infrastructure() => return Termination::SimulatorFailed(e),
                Some(Err(e)) => tracing::warn!(%task, error = %e, "recording not started"),
                None => {
                    return Termination::SimulatorFailed(SimulatorError::ConnectionLost(
                        "recording request did not answer within the client timeout".into(),
                    ))
                }
            }
        }

        let Some(agent) = episode.agent.as_mut() else {
            return Termination::AgentFailed(AgentError::Exited("agent released early".into()));
        };
        loop {
            if let Some(end) = episode.tally.observe(&tick) {
                return end;
            }
            let observation = Observation::from_tick(&tick);
            let control = match watchdog(limit, agent.act(&observation)).await {
                Some(Ok(control)) => control.clamped(),
                Some(Err(e)) => return Termination::AgentFailed(e),
                None => return Termination::Watchdog("agent step"),
            };
            tick = match watchdog(limit, episode.handle.step(control)).await {
                Some(Ok(tick)) => tick,
                Some(Err(e)) => return Termination::SimulatorFailed(e),
                None => return Termination::Watchdog("simulator tick"),
            };
        }
    }

    /// Destroy the agent, then disconnect. Failures are logged, never raised.
    async fn release(&self, handle: SessionHandle, agent: Option<Box<dyn DrivingAgent>>) {
        let limit = self.settings.client_timeout;
        if let Some(mut agent) = agent {
            match watchdog(limit, agent.destroy()).await {
                Some(Ok(())) => {}
                Some(Err(e)) => tracing::warn!(error = %e, "agent teardown failed"),
                None => tracing::warn!("agent teardown timed out"),
            }
        }
        match watchdog(limit, handle.release()).await {
            Some(Ok(())) => {}
            Some(Err(e)) => tracing::debug!(error = %e, "simulator disconnect failed"),
            None => tracing::warn!("simulator disconnect timed out"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        task: &EvaluationTask,
        status: OutcomeStatus,
        failure_reason: Option<String>,
        tally: &mut EpisodeTally,
        recording: Option<PathBuf>,
        attempts: u32,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
    ) -> EvaluationResult {
        if status == OutcomeStatus::Success {
            tally.route_completion = 100.0;
        }
        let infractions = std::mem::take(&mut tally.infractions);
        EvaluationResult {
            task: task.clone(),
            status,
            scores: ScoreBreakdown::compute(tally.route_completion, &infractions),
            infraction_count: infractions.values().sum(),
            infractions,
            duration_ms: clock.elapsed().as_millis() as u64,
            sim_time_s: tally.sim_time_s,
            failure_reason,
            recording,
            attempts,
            started_at,
            run_id: self.settings.run_id,
        }
    }
}

/// `None` when `fut` does not finish within `limit`.
async fn watchdog<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    tokio::time::timeout(limit, fut).await.ok()
}

/// Resolves once cancellation is requested. Never resolves if the sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
