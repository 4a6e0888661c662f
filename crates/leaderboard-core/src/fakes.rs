//! In-memory simulator and agent for tests.
//!
//! `ScriptedSimulator` replays per-task episode scripts and records everything it was asked
//! to do; `ScriptedAgentLauncher` hands out agents with a fixed profile and optional failures.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::agent::{AgentLauncher, AgentProfile, DrivingAgent, SensorSpec};
use crate::catalog::RouteDescriptor;
use crate::config::{SimEndpoint, Track};
use crate::error::{AgentError, SimulatorError};
use crate::simulator::{
    InfractionEvent, Observation, SimResult, SimulatorBackend, SimulatorSession, Tick,
    VehicleControl,
};
use crate::task::{EvaluationTask, InfractionKind};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// ScriptedSimulator
// ---------------------------------------------------------------------------

/// How one episode unfolds. Step numbers are 1-based.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeScript {
    /// Step on which the route is completed.
    pub completes_after: Option<u32>,
    /// Step on which an infraction is reported.
    pub infraction_at: Option<(u32, InfractionKind)>,
    /// Step that never answers.
    pub hangs_at: Option<u32>,
    /// Step on which the connection drops.
    pub drops_connection_at: Option<u32>,
    /// Error returned by the route load.
    pub load_error: Option<SimulatorError>,
}

impl Default for EpisodeScript {
    fn default() -> Self {
        Self {
            completes_after: Some(3),
            infraction_at: None,
            hangs_at: None,
            drops_connection_at: None,
            load_error: None,
        }
    }
}

impl EpisodeScript {
    pub fn completes_after(steps: u32) -> Self {
        Self {
            completes_after: Some(steps),
            ..Self::default()
        }
    }

    pub fn infraction(step: u32, kind: InfractionKind) -> Self {
        Self {
            completes_after: None,
            infraction_at: Some((step, kind)),
            ..Self::default()
        }
    }

    pub fn hangs(step: u32) -> Self {
        Self {
            completes_after: None,
            hangs_at: Some(step),
            ..Self::default()
        }
    }

    pub fn drops_connection(step: u32) -> Self {
        Self {
            completes_after: None,
            drops_connection_at: Some(step),
            ..Self::default()
        }
    }

    pub fn load_fails(error: SimulatorError) -> Self {
        Self {
            load_error: Some(error),
            ..Self::default()
        }
    }

    fn tick(&self, step: u32) -> Tick {
        let completion = match self.completes_after {
            Some(total) if total > 0 => (f64::from(step) / f64::from(total) * 100.0).min(100.0),
            _ => f64::from(step).min(99.0),
        };
        let infractions = match self.infraction_at {
            Some((at, kind)) if at == step => vec![InfractionEvent {
                kind,
                frame: u64::from(step),
                detail: Some("scripted".into()),
            }],
            _ => Vec::new(),
        };
        Tick {
            frame: u64::from(step),
            sim_time_s: f64::from(step) * 0.05,
            route_completion: completion,
            speed_mps: 5.0,
            route_completed: self.completes_after.is_some_and(|total| step >= total),
            infractions,
            sensors: serde_json::Map::new(),
        }
    }
}

/// Everything the fake simulator was asked to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatorLog {
    pub probes: u32,
    pub connects: u32,
    pub disconnects: u32,
    /// Route loads, in order.
    pub episodes: Vec<EvaluationTask>,
    pub recordings: Vec<PathBuf>,
    pub traffic_manager_ports: Vec<u16>,
}

#[derive(Debug, Default)]
struct SimulatorInner {
    default_script: Mutex<EpisodeScript>,
    scripts: Mutex<HashMap<EvaluationTask, VecDeque<EpisodeScript>>>,
    refuse: AtomicBool,
    failing_connects: AtomicU32,
    log: Mutex<SimulatorLog>,
}

/// Simulator backend replaying [`EpisodeScript`]s.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSimulator {
    inner: Arc<SimulatorInner>,
}

impl ScriptedSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script used for tasks without a queued script.
    pub fn set_default_script(&self, script: EpisodeScript) {
        *lock(&self.inner.default_script) = script;
    }

    /// Queue a script for the next episode of `task`.
    pub fn push_script(&self, task: EvaluationTask, script: EpisodeScript) {
        lock(&self.inner.scripts)
            .entry(task)
            .or_default()
            .push_back(script);
    }

    /// Refuse every probe and connection.
    pub fn set_refusing(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make the next `n` connections fail as unreachable. Probes are unaffected.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn log(&self) -> SimulatorLog {
        lock(&self.inner.log).clone()
    }

    fn refused(endpoint: &SimEndpoint) -> SimulatorError {
        SimulatorError::Unreachable {
            endpoint: endpoint.address(),
            reason: "connection refused".into(),
        }
    }
}

#[async_trait]
impl SimulatorBackend for ScriptedSimulator {
    async fn probe(&self, endpoint: &SimEndpoint) -> SimResult<String> {
        lock(&self.inner.log).probes += 1;
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(Self::refused(endpoint));
        }
        Ok("scripted-0.9".to_string())
    }

    async fn connect(&self, endpoint: &SimEndpoint) -> SimResult<Box<dyn SimulatorSession>> {
        {
            let mut log = lock(&self.inner.log);
            log.connects += 1;
            log.traffic_manager_ports.push(endpoint.traffic_manager_port);
        }
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(Self::refused(endpoint));
        }
        let failing = self.inner.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner
                .failing_connects
                .store(failing - 1, Ordering::SeqCst);
            return Err(Self::refused(endpoint));
        }
        Ok(Box::new(ScriptedSession {
            inner: self.inner.clone(),
            script: None,
            step: 0,
        }))
    }
}

struct ScriptedSession {
    inner: Arc<SimulatorInner>,
    script: Option<EpisodeScript>,
    step: u32,
}

#[async_trait]
impl SimulatorSession for ScriptedSession {
    async fn load_route(&mut self, route: &RouteDescriptor, repetition: u32) -> SimResult<Tick> {
        let task = EvaluationTask::new(route.id.clone(), repetition);
        lock(&self.inner.log).episodes.push(task.clone());

        let queued = lock(&self.inner.scripts)
            .get_mut(&task)
            .and_then(VecDeque::pop_front);
        let script = queued.unwrap_or_else(|| lock(&self.inner.default_script).clone());
        if let Some(error) = &script.load_error {
            return Err(error.clone());
        }
        let initial = script.tick(0);
        self.script = Some(script);
        self.step = 0;
        Ok(initial)
    }

    async fn start_recording(&mut self, path: &Path) -> SimResult<()> {
        lock(&self.inner.log).recordings.push(path.to_path_buf());
        Ok(())
    }

    async fn step(&mut self, _control: VehicleControl) -> SimResult<Tick> {
        let script = self
            .script
            .as_ref()
            .ok_or_else(|| SimulatorError::Protocol("step before load_route".into()))?;
        self.step += 1;
        if script.hangs_at == Some(self.step) {
            std::future::pending::<()>().await;
        }
        if script.drops_connection_at == Some(self.step) {
            return Err(SimulatorError::ConnectionLost("scripted drop".into()));
        }
        Ok(script.tick(self.step))
    }

    async fn disconnect(&mut self) -> SimResult<()> {
        lock(&self.inner.log).disconnects += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedAgentLauncher
// ---------------------------------------------------------------------------

/// Lifecycle counters shared by all agents of one launcher.
#[derive(Debug, Default)]
pub struct AgentStats {
    pub launches: AtomicU32,
    pub configures: AtomicU32,
    pub acts: AtomicU32,
    pub destroys: AtomicU32,
}

/// Hands out in-memory agents.
#[derive(Debug, Clone)]
pub struct ScriptedAgentLauncher {
    profile: AgentProfile,
    fail_configure: Option<AgentError>,
    fail_on_act: Option<(u32, AgentError)>,
    stats: Arc<AgentStats>,
}

impl Default for ScriptedAgentLauncher {
    fn default() -> Self {
        Self {
            profile: AgentProfile {
                track: Track::Sensors,
                sensors: vec![
                    SensorSpec::new("sensor.camera.rgb", "Center"),
                    SensorSpec::new("sensor.speedometer", "Speed"),
                ],
            },
            fail_configure: None,
            fail_on_act: None,
            stats: Arc::new(AgentStats::default()),
        }
    }
}

impl ScriptedAgentLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: AgentProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn failing_configure(mut self, error: AgentError) -> Self {
        self.fail_configure = Some(error);
        self
    }

    /// Fail the `n`-th act call (1-based) of every agent.
    pub fn failing_act(mut self, n: u32, error: AgentError) -> Self {
        self.fail_on_act = Some((n, error));
        self
    }

    pub fn stats(&self) -> Arc<AgentStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl AgentLauncher for ScriptedAgentLauncher {
    fn describe(&self) -> String {
        "scripted-agent".to_string()
    }

    async fn launch(&self) -> Result<Box<dyn DrivingAgent>, AgentError> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedAgent {
            launcher: self.clone(),
            acts: 0,
        }))
    }
}

struct ScriptedAgent {
    launcher: ScriptedAgentLauncher,
    acts: u32,
}

#[async_trait]
impl DrivingAgent for ScriptedAgent {
    async fn configure(&mut self, _route: &RouteDescriptor) -> Result<AgentProfile, AgentError> {
        self.launcher.stats.configures.fetch_add(1, Ordering::SeqCst);
        match &self.launcher.fail_configure {
            Some(error) => Err(error.clone()),
            None => Ok(self.launcher.profile.clone()),
        }
    }

    async fn act(&mut self, observation: &Observation) -> Result<VehicleControl, AgentError> {
        self.launcher.stats.acts.fetch_add(1, Ordering::SeqCst);
        self.acts += 1;
        if let Some((n, error)) = &self.launcher.fail_on_act {
            if *n == self.acts {
                return Err(error.clone());
            }
        }
        Ok(VehicleControl {
            steer: 0.0,
            throttle: if observation.speed_mps < 8.0 { 0.7 } else { 0.0 },
            brake: 0.0,
        })
    }

    async fn destroy(&mut self) -> Result<(), AgentError> {
        self.launcher.stats.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
