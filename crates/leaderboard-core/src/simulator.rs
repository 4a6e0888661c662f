//! Simulator boundary.
//!
//! The evaluator never talks to a simulator directly; it goes through:
//! - `SimulatorBackend`: reachability probe and connection factory
//! - `SimulatorSession`: one live connection driving one episode
//!
//! `bridge::TcpSimulator` is the networked backend; `fakes::ScriptedSimulator` is the
//! in-memory one used in tests.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::RouteDescriptor;
use crate::config::SimEndpoint;
use crate::error::SimulatorError;
use crate::task::InfractionKind;

/// Result type for simulator calls.
pub type SimResult<T> = std::result::Result<T, SimulatorError>;

// ---------------------------------------------------------------------------
// Wire-level data
// ---------------------------------------------------------------------------

/// Actuation command produced by the agent for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleControl {
    pub steer: f64,
    pub throttle: f64,
    pub brake: f64,
}

impl VehicleControl {
    /// Clamp to the actuator ranges; NaN becomes 0.
    pub fn clamped(self) -> Self {
        let clamp = |v: f64, lo: f64, hi: f64| if v.is_nan() { 0.0 } else { v.clamp(lo, hi) };
        Self {
            steer: clamp(self.steer, -1.0, 1.0),
            throttle: clamp(self.throttle, 0.0, 1.0),
            brake: clamp(self.brake, 0.0, 1.0),
        }
    }
}

/// An infraction reported by the simulator's criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfractionEvent {
    pub kind: InfractionKind,
    pub frame: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// World state after a route load or a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub frame: u64,
    pub sim_time_s: f64,
    /// Percentage of the route covered so far.
    pub route_completion: f64,
    #[serde(default)]
    pub speed_mps: f64,
    #[serde(default)]
    pub route_completed: bool,
    /// Infractions raised during this tick only.
    #[serde(default)]
    pub infractions: Vec<InfractionEvent>,
    /// Sensor payloads keyed by sensor id.
    #[serde(default)]
    pub sensors: serde_json::Map<String, serde_json::Value>,
}

/// What the agent is shown each tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub frame: u64,
    pub sim_time_s: f64,
    pub speed_mps: f64,
    pub route_completion: f64,
    pub sensors: serde_json::Map<String, serde_json::Value>,
}

impl Observation {
    pub fn from_tick(tick: &Tick) -> Self {
        Self {
            frame: tick.frame,
            sim_time_s: tick.sim_time_s,
            speed_mps: tick.speed_mps,
            route_completion: tick.route_completion,
            sensors: tick.sensors.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Factory for simulator connections.
#[async_trait]
pub trait SimulatorBackend: Send + Sync {
    /// Handshake without loading anything. Returns the server version string.
    async fn probe(&self, endpoint: &SimEndpoint) -> SimResult<String>;

    /// Open a connection bound to `endpoint` and its traffic-manager port.
    async fn connect(&self, endpoint: &SimEndpoint) -> SimResult<Box<dyn SimulatorSession>>;
}

/// One live simulator connection.
#[async_trait]
pub trait SimulatorSession: Send {
    /// Load the route's town, weather and scenarios; returns the initial tick.
    async fn load_route(&mut self, route: &RouteDescriptor, repetition: u32) -> SimResult<Tick>;

    /// Record the episode to `path` on the simulator host.
    async fn start_recording(&mut self, path: &Path) -> SimResult<()>;

    /// Apply `control` and advance one tick.
    async fn step(&mut self, control: VehicleControl) -> SimResult<Tick>;

    /// Tear down scenario actors and close the connection.
    async fn disconnect(&mut self) -> SimResult<()>;
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Owned simulator connection for one in-flight episode.
///
/// Must be closed with [`SessionHandle::release`]; dropping an unreleased handle logs a warning.
pub struct SessionHandle {
    session: Box<dyn SimulatorSession>,
    endpoint: SimEndpoint,
    released: bool,
}

impl SessionHandle {
    pub fn new(session: Box<dyn SimulatorSession>, endpoint: SimEndpoint) -> Self {
        Self {
            session,
            endpoint,
            released: false,
        }
    }

    pub fn endpoint(&self) -> &SimEndpoint {
        &self.endpoint
    }

    pub async fn load_route(&mut self, route: &RouteDescriptor, repetition: u32) -> SimResult<Tick> {
        self.session.load_route(route, repetition).await
    }

    pub async fn start_recording(&mut self, path: &Path) -> SimResult<()> {
        self.session.start_recording(path).await
    }

    pub async fn step(&mut self, control: VehicleControl) -> SimResult<Tick> {
        self.session.step(control).await
    }

    /// Disconnect and consume the handle.
    pub async fn release(mut self) -> SimResult<()> {
        self.released = true;
        self.session.disconnect().await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(endpoint = %self.endpoint, "simulator session dropped without release");
        }
    }
}
