//! Agent hosted in a child process, spoken to with newline-delimited JSON over stdio.
//!
//! Requests carry an `op` tag (`configure`, `act`, `destroy`); every request gets exactly one
//! reply line. A reply with an `error` key means the agent raised.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::agent::{AgentLauncher, AgentProfile, DrivingAgent};
use crate::catalog::RouteDescriptor;
use crate::error::AgentError;
use crate::simulator::{Observation, VehicleControl};

/// Grace period for the child to exit after `destroy` before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum AgentRequest<'a> {
    Configure { route_id: &'a str, town: &'a str },
    Act { observation: &'a Observation },
    Destroy,
}

/// Launches the agent executable once per episode.
#[derive(Debug, Clone)]
pub struct ProcessAgentLauncher {
    program: PathBuf,
    args: Vec<String>,
    config: Option<PathBuf>,
}

impl ProcessAgentLauncher {
    pub fn new(program: impl Into<PathBuf>, config: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            config,
        }
    }

    /// Arguments placed before `--config`, e.g. a script for an interpreter.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl AgentLauncher for ProcessAgentLauncher {
    fn describe(&self) -> String {
        self.program.display().to_string()
    }

    async fn launch(&self) -> Result<Box<dyn DrivingAgent>, AgentError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Launch(format!("{}: {e}", self.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Launch("agent stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Launch("agent stdout unavailable".into()))?;

        tracing::debug!(agent = %self.program.display(), pid = ?child.id(), "agent process started");
        Ok(Box::new(ProcessAgent {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
        }))
    }
}

/// A live agent child process.
pub struct ProcessAgent {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ProcessAgent {
    async fn call(&mut self, request: &AgentRequest<'_>) -> Result<serde_json::Value, AgentError> {
        let mut line =
            serde_json::to_string(request).map_err(|e| AgentError::Protocol(e.to_string()))?;
        line.push('\n');

        let sent = match self.stdin.as_mut() {
            Some(stdin) => write_line(stdin, &line).await,
            None => return Err(AgentError::Exited("agent input already closed".into())),
        };
        if let Err(e) = sent {
            return Err(self.exited(e.to_string()));
        }

        let reply = match self.stdout.next_line().await {
            Ok(Some(reply)) => reply,
            Ok(None) => return Err(self.exited("agent closed its output".into())),
            Err(e) => return Err(self.exited(e.to_string())),
        };
        let value: serde_json::Value = serde_json::from_str(&reply)
            .map_err(|e| AgentError::Protocol(format!("invalid reply {reply:?}: {e}")))?;
        if let Some(error) = value.get("error") {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(AgentError::Raised(message));
        }
        Ok(value)
    }

    fn exited(&mut self, reason: String) -> AgentError {
        match self.child.try_wait() {
            Ok(Some(status)) => AgentError::Exited(format!("{reason} ({status})")),
            _ => AgentError::Exited(reason),
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, AgentError> {
    serde_json::from_value(value).map_err(|e| AgentError::Protocol(e.to_string()))
}

#[async_trait]
impl DrivingAgent for ProcessAgent {
    async fn configure(&mut self, route: &RouteDescriptor) -> Result<AgentProfile, AgentError> {
        let reply = self
            .call(&AgentRequest::Configure {
                route_id: &route.id,
                town: &route.town,
            })
            .await?;
        decode(reply)
    }

    async fn act(&mut self, observation: &Observation) -> Result<VehicleControl, AgentError> {
        let reply = self.call(&AgentRequest::Act { observation }).await?;
        decode(reply)
    }

    async fn destroy(&mut self) -> Result<(), AgentError> {
        let farewell = if self.stdin.is_some() {
            self.call(&AgentRequest::Destroy).await.map(|_| ())
        } else {
            Ok(())
        };
        // Closing stdin lets well-behaved agents exit on EOF.
        self.stdin = None;

        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "agent process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to wait for agent process");
            }
            Err(_) => {
                tracing::warn!("agent process ignored destroy; killing it");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(error = %e, "failed to kill agent process");
                }
            }
        }
        match farewell {
            Err(AgentError::Exited(_)) => Ok(()),
            other => other,
        }
    }
}
