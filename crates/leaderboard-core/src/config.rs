//! Evaluator configuration, validated once at startup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::ScenarioType;
use crate::error::ConfigError;

/// Evaluation mode deciding which inputs the agent may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Track {
    #[serde(rename = "SENSORS")]
    Sensors,
    #[serde(rename = "MAP")]
    Map,
}

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Sensors => "SENSORS",
            Track::Map => "MAP",
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Track {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SENSORS" => Ok(Track::Sensors),
            "MAP" => Ok(Track::Map),
            other => Err(ConfigError::InvalidValue {
                field: "track",
                reason: format!("expected SENSORS or MAP, got {other:?}"),
            }),
        }
    }
}

/// What to do with an existing non-empty checkpoint when not resuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingCheckpointPolicy {
    /// Refuse to start.
    #[default]
    Reject,
    /// Discard the old results and start over.
    Overwrite,
}

/// Simulator address plus the traffic-manager port bound for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEndpoint {
    pub host: String,
    pub port: u16,
    pub traffic_manager_port: u16,
}

impl SimEndpoint {
    pub fn new(host: impl Into<String>, port: u16, traffic_manager_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            traffic_manager_port,
        }
    }

    /// `host:port` suitable for a socket connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SimEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (tm {})", self.host, self.port, self.traffic_manager_port)
    }
}

/// Every option recognised by the evaluator.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Route catalog (XML).
    pub routes: PathBuf,
    /// Scenario-trigger catalog (JSON).
    pub scenarios: PathBuf,
    pub repetitions: u32,
    pub track: Track,
    pub checkpoint: PathBuf,
    /// Agent implementation reference.
    pub agent: PathBuf,
    pub agent_config: Option<PathBuf>,
    pub debug: bool,
    /// Directory receiving per-episode recordings.
    pub record: Option<PathBuf>,
    pub resume: bool,
    pub on_existing_checkpoint: ExistingCheckpointPolicy,
    pub endpoint: SimEndpoint,
    /// Bound on any single simulator or agent call.
    pub client_timeout: Duration,
    /// Bound on a whole episode.
    pub episode_timeout: Duration,
    /// Only routes carrying a trigger of this type are run.
    pub scenario_type: Option<ScenarioType>,
    /// Extra attempts after an infrastructure failure.
    pub infra_retries: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_backoff: Duration,
    /// Simulator installation root, recorded for provenance.
    pub simulator_root: Option<PathBuf>,
}

impl EvaluatorConfig {
    /// Configuration with the evaluator defaults for everything but the required paths.
    pub fn new(
        routes: impl Into<PathBuf>,
        scenarios: impl Into<PathBuf>,
        agent: impl Into<PathBuf>,
        checkpoint: impl Into<PathBuf>,
    ) -> Self {
        Self {
            routes: routes.into(),
            scenarios: scenarios.into(),
            repetitions: 1,
            track: Track::Sensors,
            checkpoint: checkpoint.into(),
            agent: agent.into(),
            agent_config: None,
            debug: false,
            record: None,
            resume: false,
            on_existing_checkpoint: ExistingCheckpointPolicy::Reject,
            endpoint: SimEndpoint::new("localhost", 2000, 8000),
            client_timeout: Duration::from_secs(200),
            episode_timeout: Duration::from_secs(3600),
            scenario_type: None,
            infra_retries: 2,
            retry_backoff: Duration::from_millis(500),
            simulator_root: None,
        }
    }

    /// Validate every option. Called once before any state is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_file("route catalog", &self.routes)?;
        require_file("scenario catalog", &self.scenarios)?;
        require_file("agent", &self.agent)?;
        if let Some(agent_config) = &self.agent_config {
            require_exists("agent config", agent_config)?;
        }

        if self.repetitions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "repetitions",
                reason: "must be at least 1".into(),
            });
        }
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "host",
                reason: "must not be empty".into(),
            });
        }
        if self.endpoint.port == 0 || self.endpoint.traffic_manager_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                reason: "ports must be non-zero".into(),
            });
        }
        if self.endpoint.port == self.endpoint.traffic_manager_port {
            return Err(ConfigError::InvalidValue {
                field: "trafficManagerPort",
                reason: format!(
                    "must differ from the simulator port {}",
                    self.endpoint.port
                ),
            });
        }
        if self.client_timeout.is_zero() || self.episode_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "timeout",
                reason: "timeouts must be positive".into(),
            });
        }

        if self.checkpoint.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "checkpoint",
                reason: "path must not be empty".into(),
            });
        }
        if self.checkpoint.is_dir() {
            return Err(ConfigError::NotAFile {
                what: "checkpoint",
                path: self.checkpoint.clone(),
            });
        }
        if let Some(parent) = self.checkpoint.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(ConfigError::MissingPath {
                    what: "checkpoint directory",
                    path: parent.to_path_buf(),
                });
            }
        }

        if let Some(record) = &self.record {
            if record.exists() && !record.is_dir() {
                return Err(ConfigError::InvalidValue {
                    field: "record",
                    reason: format!("{} is not a directory", record.display()),
                });
            }
        }
        if let Some(root) = &self.simulator_root {
            require_exists("simulator root", root)?;
        }
        Ok(())
    }
}

fn require_exists(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingPath {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn require_file(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    require_exists(what, path)?;
    if !path.is_file() {
        return Err(ConfigError::NotAFile {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}
