//! Wire protocol spoken with the remote DuckDB server.
//!
//! Control traffic is JSON text frames tagged by `type`. Query results
//! arrive as binary frames: a big-endian `u32` header length, the JSON
//! header `{type, queryId}`, then an Arrow IPC stream.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ConnectorError, Result};
use crate::query::QueryId;

/// Size of the header-length prefix of a binary frame.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    Subscribe {
        channel: String,
    },
    Arrow {
        sql: String,
        #[serde(rename = "queryId")]
        query_id: QueryId,
    },
    Cancel {
        #[serde(rename = "queryId")]
        query_id: QueryId,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ConnectorError::internal(format!("Failed to encode message: {e}")))
    }
}

/// Messages received from the server as text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    AuthAck,
    /// Scoped to one query when `query_id` is set, otherwise a global fault.
    Error {
        #[serde(rename = "queryId", default)]
        query_id: Option<QueryId>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Statement executed without a result set.
    Ok {
        #[serde(rename = "queryId")]
        query_id: QueryId,
    },
    CancelAck {
        #[serde(rename = "queryId", default)]
        query_id: Option<QueryId>,
    },
    Notify {
        #[serde(default)]
        payload: JsonValue,
    },
    /// Older servers send results inline as base64 IPC.
    Arrow {
        #[serde(rename = "queryId")]
        query_id: QueryId,
        data: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// JSON header of a binary result frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "queryId")]
    pub query_id: QueryId,
}

impl FrameHeader {
    pub fn arrow(query_id: QueryId) -> Self {
        Self {
            kind: "arrow".to_string(),
            query_id,
        }
    }
}

/// Builds a binary result frame around an Arrow IPC stream.
pub fn encode_result_frame(header: &FrameHeader, ipc: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(header)
        .map_err(|e| ConnectorError::internal(format!("Failed to encode frame header: {e}")))?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| ConnectorError::internal("Frame header too large"))?;

    let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + header.len() + ipc.len());
    frame.extend_from_slice(&header_len.to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(ipc);
    Ok(frame)
}

/// Splits a binary result frame into its header and IPC payload.
pub fn decode_result_frame(frame: &[u8]) -> Result<(FrameHeader, &[u8])> {
    let prefix: [u8; FRAME_PREFIX_LEN] = frame
        .get(..FRAME_PREFIX_LEN)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| ConnectorError::transport("Result frame shorter than its length prefix"))?;
    let header_len = u32::from_be_bytes(prefix) as usize;

    let header_end = FRAME_PREFIX_LEN
        .checked_add(header_len)
        .filter(|end| *end <= frame.len())
        .ok_or_else(|| {
            ConnectorError::transport(format!(
                "Result frame header length {header_len} exceeds frame size {}",
                frame.len()
            ))
        })?;

    let header: FrameHeader = serde_json::from_slice(&frame[FRAME_PREFIX_LEN..header_end])
        .map_err(|e| ConnectorError::transport(format!("Invalid result frame header: {e}")))?;
    Ok((header, &frame[header_end..]))
}
