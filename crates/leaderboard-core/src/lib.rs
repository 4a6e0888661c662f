//! Leaderboard evaluator core.
//!
//! Runs a driving agent over a catalog of routes, one closed-loop episode per
//! (route, repetition), and keeps a resumable checkpoint of the results.
//!
//! - [`catalog`]: XML routes and JSON scenario triggers
//! - [`checkpoint`]: durable, locked, atomically rewritten result store
//! - [`scheduler`]: task expansion and resume filtering
//! - [`session`]: one episode against the simulator and agent boundaries
//! - [`orchestrator`]: the run state machine tying it together

pub mod agent;
pub mod bridge;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod orchestrator;
pub mod process_agent;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod simulator;
pub mod task;
pub mod telemetry;

pub use agent::{
    validate_sensor_configuration, AgentLauncher, AgentProfile, DrivingAgent, SensorSpec,
};
pub use bridge::TcpSimulator;
pub use catalog::{
    RouteCatalog, RouteDescriptor, ScenarioTrigger, ScenarioType, TriggerLocation, Waypoint,
    WeatherPreset,
};
pub use checkpoint::{CheckpointFile, CheckpointHeader, CheckpointStore, CHECKPOINT_SCHEMA};
pub use config::{EvaluatorConfig, ExistingCheckpointPolicy, SimEndpoint, Track};
pub use error::{
    AgentError, CatalogError, CheckpointError, ConfigError, OrchestratorError, Result,
    SessionError, SimulatorError,
};
pub use orchestrator::{Orchestrator, OrchestratorState, RunSummary};
pub use process_agent::ProcessAgentLauncher;
pub use report::EvaluationReport;
pub use session::{SessionOutcome, SessionRunner, SessionSettings};
pub use simulator::{
    Observation, SessionHandle, SimulatorBackend, SimulatorSession, Tick, VehicleControl,
};
pub use task::{
    EvaluationResult, EvaluationTask, InfractionKind, OutcomeStatus, ScoreBreakdown,
};

/// Crate version, reported in the CLI banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
