//! Length-prefixed JSON framing for the local RPC endpoint.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! Requests carry an operation name and a JSON arguments object; responses
//! carry either a result document or a structured error. An unknown
//! operation answers with the [`ERR_UNKNOWN_OP`] code — the sentinel that
//! tells clients to fall back to in-process mode.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{BeadsError, Result};

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Error code returned for operations this daemon does not implement.
pub const ERR_UNKNOWN_OP: &str = "unknown-op";
/// Error code for a request that exceeded the daemon's deadline.
pub const ERR_TIMEOUT: &str = "timeout";

/// A client request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A structured RPC error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

/// A daemon response; exactly one of `result` / `error` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    #[must_use]
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn err(id: u64, code: &str, message: String) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code: code.to_owned(),
                message,
            }),
        }
    }
}

/// Write one frame.
///
/// # Errors
/// I/O and encoding errors.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| BeadsError::DaemonUnavailable {
        detail: "frame too large to encode".to_owned(),
    })?;
    if len > MAX_FRAME_LEN {
        return Err(BeadsError::DaemonUnavailable {
            detail: format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} limit"),
        });
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean EOF before the length prefix.
///
/// # Errors
/// I/O errors, oversized frames, and malformed JSON.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(BeadsError::DaemonUnavailable {
            detail: format!("peer sent a {len}-byte frame (limit {MAX_FRAME_LEN})"),
        });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(serde_json::from_slice(&body)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
