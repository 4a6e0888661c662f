//! TCP simulator backend speaking the line-delimited JSON bridge protocol.

pub mod protocol;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::catalog::RouteDescriptor;
use crate::config::SimEndpoint;
use crate::error::SimulatorError;
use crate::simulator::{SimResult, SimulatorBackend, SimulatorSession, Tick, VehicleControl};

use protocol::{read_message, write_message, BridgeRequest, BridgeResponse};

/// Connects to a simulator bridge over TCP.
#[derive(Debug, Clone)]
pub struct TcpSimulator {
    client_name: String,
    connect_timeout: Duration,
}

impl TcpSimulator {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn open(&self, endpoint: &SimEndpoint) -> SimResult<(TcpSession, String)> {
        let address = endpoint.address();
        let unreachable = |reason: String| SimulatorError::Unreachable {
            endpoint: address.clone(),
            reason,
        };

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => {
                return Err(unreachable(format!(
                    "no answer within {:?}",
                    self.connect_timeout
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let (read, write) = stream.into_split();
        let mut session = TcpSession {
            reader: BufReader::new(read),
            writer: write,
            closed: false,
        };
        let hello = session
            .request(&BridgeRequest::Hello {
                client: self.client_name.clone(),
                traffic_manager_port: endpoint.traffic_manager_port,
            })
            .await?;
        let version = hello
            .server_version
            .unwrap_or_else(|| "unknown".to_string());
        Ok((session, version))
    }
}

#[async_trait]
impl SimulatorBackend for TcpSimulator {
    async fn probe(&self, endpoint: &SimEndpoint) -> SimResult<String> {
        let (mut session, version) = self.open(endpoint).await?;
        if let Err(e) = session.disconnect().await {
            tracing::debug!(error = %e, "probe disconnect failed");
        }
        Ok(version)
    }

    async fn connect(&self, endpoint: &SimEndpoint) -> SimResult<Box<dyn SimulatorSession>> {
        let (session, version) = self.open(endpoint).await?;
        tracing::debug!(%endpoint, server_version = %version, "simulator session opened");
        Ok(Box::new(session))
    }
}

/// One bridge connection.
pub struct TcpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    closed: bool,
}

impl TcpSession {
    async fn request(&mut self, request: &BridgeRequest) -> SimResult<BridgeResponse> {
        if self.closed {
            return Err(SimulatorError::ConnectionLost("session already closed".into()));
        }
        write_message(&mut self.writer, request).await?;
        let response: BridgeResponse = read_message(&mut self.reader)
            .await?
            .ok_or_else(|| SimulatorError::ConnectionLost("simulator closed the connection".into()))?;
        response.into_result()
    }
}

#[async_trait]
impl SimulatorSession for TcpSession {
    async fn load_route(&mut self, route: &RouteDescriptor, repetition: u32) -> SimResult<Tick> {
        self.request(&BridgeRequest::LoadRoute {
            route: route.clone(),
            repetition,
        })
        .await?
        .into_tick()
    }

    async fn start_recording(&mut self, path: &Path) -> SimResult<()> {
        self.request(&BridgeRequest::StartRecording {
            path: path.to_path_buf(),
        })
        .await
        .map(|_| ())
    }

    async fn step(&mut self, control: VehicleControl) -> SimResult<Tick> {
        self.request(&BridgeRequest::Step { control })
            .await?
            .into_tick()
    }

    async fn disconnect(&mut self) -> SimResult<()> {
        if self.closed {
            return Ok(());
        }
        let farewell = self.request(&BridgeRequest::Disconnect).await.map(|_| ());
        self.closed = true;
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(error = %e, "bridge socket shutdown failed");
        }
        farewell
    }
}
