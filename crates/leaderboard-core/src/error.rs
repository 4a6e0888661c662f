//! Error taxonomy for the leaderboard evaluator.
//!
//! Errors fall into three classes:
//! - configuration errors (catalog, config, checkpoint compatibility): surfaced before any task runs
//! - infrastructure errors (simulator unreachable, connection lost): retried, then fatal
//! - episode-level errors: never surface here; the session runner turns them into results

use std::path::PathBuf;

use crate::task::EvaluationTask;

/// Errors produced while loading the route and scenario catalogs.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("cannot read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed route catalog {path}: {message}")]
    Xml { path: PathBuf, message: String },

    #[error("malformed scenario catalog {path}: {message}")]
    Json { path: PathBuf, message: String },

    #[error("route catalog {path} defines no routes")]
    Empty { path: PathBuf },

    #[error("route {route_id} is defined more than once")]
    DuplicateRoute { route_id: String },

    #[error("route {route_id}: {message}")]
    InvalidRoute { route_id: String, message: String },

    #[error("unknown scenario type: {0}")]
    UnknownScenarioType(String),

    #[error("unknown weather preset: {0}")]
    UnknownWeather(String),
}

/// Errors produced while validating the evaluator configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{what} not found: {path}")]
    MissingPath { what: &'static str, path: PathBuf },

    #[error("{what} must be a file: {path}")]
    NotAFile { what: &'static str, path: PathBuf },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("no routes matched scenario {0}")]
    NoRoutesMatched(String),

    #[error("invalid sensor configuration: {0}")]
    InvalidSensors(String),
}

/// Errors produced by the checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("checkpoint {path} has schema {found}, expected {expected}")]
    IncompatibleSchema {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error(
        "checkpoint {path} was produced by a different plan (digest {found}, current {expected}); \
         use a new checkpoint path or rerun without resume"
    )]
    PlanMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error(
        "checkpoint {path} already holds {entries} result(s); pass --resume true to continue it \
         or --on-existing-checkpoint overwrite to discard it"
    )]
    StaleCheckpoint { path: PathBuf, entries: usize },

    #[error("checkpoint is locked by another evaluator ({holder}); remove {lock_path} if no evaluator is running")]
    Locked { lock_path: PathBuf, holder: String },

    #[error("task {task} already has a different recorded result")]
    DuplicateTask { task: EvaluationTask },
}

/// Errors raised at the simulator boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimulatorError {
    #[error("simulator unreachable at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("simulator connection lost: {0}")]
    ConnectionLost(String),

    #[error("simulator protocol error: {0}")]
    Protocol(String),

    #[error("simulator rejected request: {0}")]
    Remote(String),
}

impl SimulatorError {
    /// Whether the error means the simulator itself is gone or unusable.
    ///
    /// `Remote` errors are scenario-level refusals reported over a healthy connection.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, SimulatorError::Remote(_))
    }
}

/// Errors raised at the agent boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("agent could not be launched: {0}")]
    Launch(String),

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("agent exited: {0}")]
    Exited(String),

    #[error("agent raised: {0}")]
    Raised(String),
}

/// Failures a session run propagates instead of converting into a result.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("infrastructure failure while running {task}: {source}")]
    Infrastructure {
        task: EvaluationTask,
        #[source]
        source: SimulatorError,
    },

    #[error("agent sensor configuration rejected while running {task}: {reason}")]
    InvalidSensors { task: EvaluationTask, reason: String },

    #[error("interrupted while running {task}")]
    Cancelled { task: EvaluationTask },
}

/// Terminal errors of an orchestrator run.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("pre-flight failed: {0}")]
    SimulatorUnreachable(#[source] SimulatorError),

    #[error("fatal infrastructure failure on {task} after {attempts} attempt(s): {source}")]
    Fatal {
        task: EvaluationTask,
        attempts: u32,
        #[source]
        source: SimulatorError,
    },

    #[error("interrupted by operator{}", in_flight(.task))]
    Interrupted { task: Option<EvaluationTask> },
}

fn in_flight(task: &Option<EvaluationTask>) -> String {
    task.as_ref()
        .map(|t| format!(" while running {t}"))
        .unwrap_or_default()
}

impl OrchestratorError {
    /// Process exit code for this error.
    ///
    /// 1 = configuration, 2 = infrastructure, 130 = operator interrupt.
    pub fn exit_code(&self) -> u8 {
        match self {
            OrchestratorError::Config(_)
            | OrchestratorError::Catalog(_)
            | OrchestratorError::Checkpoint(_) => 1,
            OrchestratorError::SimulatorUnreachable(_) | OrchestratorError::Fatal { .. } => 2,
            OrchestratorError::Interrupted { .. } => 130,
        }
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
