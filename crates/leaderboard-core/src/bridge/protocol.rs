//! Wire format of the simulator bridge: one JSON object per line in each direction.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::catalog::RouteDescriptor;
use crate::error::SimulatorError;
use crate::simulator::{Tick, VehicleControl};

/// Client to bridge request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeRequest {
    Hello {
        client: String,
        traffic_manager_port: u16,
    },
    LoadRoute {
        route: RouteDescriptor,
        repetition: u32,
    },
    StartRecording {
        path: PathBuf,
    },
    Step {
        control: VehicleControl,
    },
    Disconnect,
}

/// Bridge to client response. Exactly one per request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<Tick>,
}

impl BridgeResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn hello(server_version: impl Into<String>) -> Self {
        Self {
            server_version: Some(server_version.into()),
            ..Self::ok()
        }
    }

    pub fn tick(tick: Tick) -> Self {
        Self {
            tick: Some(tick),
            ..Self::ok()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Turn a refusal into [`SimulatorError::Remote`].
    pub fn into_result(self) -> Result<Self, SimulatorError> {
        if self.ok {
            Ok(self)
        } else {
            Err(SimulatorError::Remote(
                self.error.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }

    pub fn into_tick(self) -> Result<Tick, SimulatorError> {
        self.tick
            .ok_or_else(|| SimulatorError::Protocol("response carries no tick".into()))
    }
}

/// Write one message followed by a newline.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), SimulatorError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line =
        serde_json::to_vec(message).map_err(|e| SimulatorError::Protocol(e.to_string()))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| SimulatorError::ConnectionLost(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| SimulatorError::ConnectionLost(e.to_string()))
}

/// Upper bound on one message line, sensor payloads included.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Read one message. `Ok(None)` on a clean end of stream.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, SimulatorError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_message_limited(reader, MAX_MESSAGE_BYTES).await
}

/// [`read_message`] with an explicit line limit. Longer lines are a protocol error.
pub async fn read_message_limited<R, T>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<T>, SimulatorError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_line(&mut line)
        .await
        .map_err(|e| SimulatorError::ConnectionLost(e.to_string()))?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && line.len() > limit {
        return Err(SimulatorError::Protocol(format!(
            "message exceeds {limit} bytes"
        )));
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| SimulatorError::Protocol(format!("invalid message {:?}: {e}", line.trim_end())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_op_tagged() {
        let json = serde_json::to_value(BridgeRequest::Hello {
            client: "leaderboard".into(),
            traffic_manager_port: 8000,
        })
        .unwrap();
        assert_eq!(json["op"], "hello");
        assert_eq!(json["traffic_manager_port"], 8000);

        let json = serde_json::to_value(BridgeRequest::Disconnect).unwrap();
        assert_eq!(json, serde_json::json!({"op": "disconnect"}));
    }

    #[test]
    fn test_refusal_maps_to_remote() {
        let err = BridgeResponse::error("town not found").into_result().unwrap_err();
        assert_eq!(err, SimulatorError::Remote("town not found".into()));
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn test_missing_tick_is_protocol_error() {
        let err = BridgeResponse::ok().into_tick().unwrap_err();
        assert!(matches!(err, SimulatorError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_message_framing() {
        let mut buf = Vec::new();
        write_message(&mut buf, &BridgeResponse::hello("0.9.15")).await.unwrap();
        write_message(&mut buf, &BridgeResponse::ok()).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let first: BridgeResponse = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.server_version.as_deref(), Some("0.9.15"));
        let second: BridgeResponse = read_message(&mut reader).await.unwrap().unwrap();
        assert!(second.ok);
        let end: Option<BridgeResponse> = read_message(&mut reader).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_oversized_message_is_protocol_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &BridgeResponse::error("x".repeat(64))).await.unwrap();
        write_message(&mut buf, &BridgeResponse::ok()).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let err = read_message_limited::<_, BridgeResponse>(&mut reader, 32)
            .await
            .unwrap_err();
        assert!(matches!(err, SimulatorError::Protocol(m) if m.contains("32 bytes")));

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let first: BridgeResponse = read_message_limited(&mut reader, 128).await.unwrap().unwrap();
        assert!(!first.ok);
    }

    #[tokio::test]
    async fn test_unterminated_stream_stops_at_limit() {
        let endless = vec![b'{'; 4096];
        let mut reader = tokio::io::BufReader::new(endless.as_slice());
        let err = read_message_limited::<_, BridgeResponse>(&mut reader, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, SimulatorError::Protocol(_)));
    }
}
