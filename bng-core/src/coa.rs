//! CoA IPC bridge: a local Unix stream socket carrying one JSON
//! request/reply per connection, per `spec.md` §4.9.
//!
//! Grounded on `examples/original_source/bng/lib/services/bng_coad.py`'s
//! `handle_coad_connection`: the connection handler never mutates session
//! state itself, it bridges the request into the single-writer engine's
//! command queue with a reply-promise (there an `asyncio.Future`, here a
//! `tokio::sync::oneshot`) and waits on that promise under its own
//! timeout, independent of the request read timeout.

use std::path::Path;
use std::time::Duration;

use log::{error, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::error::CoaError;

const MAX_REQUEST_BYTES: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CoaRequest {
    Disconnect { session_id: String },
    PolicyChange { session_id: String, filter_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CoaReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CoaReply {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

/// One CoA request handed off to the engine's command queue, carrying the
/// one-shot reply channel the connection handler awaits.
pub struct CoaCommand {
    pub request: CoaRequest,
    pub reply_tx: oneshot::Sender<CoaReply>,
}

/// Accepts CoA connections until the process shuts down, spawning one
/// short-lived task per connection so a slow or stuck client cannot block
/// other CoA requests.
pub async fn run(sock_path: &str, command_tx: mpsc::Sender<CoaCommand>, read_timeout: Duration, reply_timeout: Duration) -> Result<(), CoaError> {
    if Path::new(sock_path).exists() {
        std::fs::remove_file(sock_path)?;
    }
    let listener = UnixListener::bind(sock_path)?;

    loop {
        let (stream, _) = listener.accept().await?;
        let command_tx = command_tx.clone();
        tokio::spawn(async move {
            handle_connection(stream, command_tx, read_timeout, reply_timeout).await;
        });
    }
}

async fn handle_connection(mut stream: UnixStream, command_tx: mpsc::Sender<CoaCommand>, read_timeout: Duration, reply_timeout: Duration) {
    let reply = match process_request(&mut stream, command_tx, read_timeout, reply_timeout).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("coa: request failed: {e}");
            CoaReply::err(e.to_string())
        }
    };

    let Ok(bytes) = serde_json::to_vec(&reply) else {
        error!("coa: failed to serialize reply");
        return;
    };
    if let Err(e) = stream.write_all(&bytes).await {
        warn!("coa: failed to write reply: {e}");
    }
}

async fn process_request(
    stream: &mut UnixStream,
    command_tx: mpsc::Sender<CoaCommand>,
    read_timeout: Duration,
    reply_timeout: Duration,
) -> Result<CoaReply, CoaError> {
    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    let n = tokio::time::timeout(read_timeout, stream.read(&mut buf))
        .await
        .map_err(|_| CoaError::ReadTimeout)??;
    if n == 0 {
        return Ok(CoaReply::err("empty request"));
    }

    let request: CoaRequest = serde_json::from_slice(&buf[..n])?;
    let (reply_tx, reply_rx) = oneshot::channel();
    command_tx
        .send(CoaCommand { request, reply_tx })
        .await
        .map_err(|_| CoaError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "engine command queue closed")))?;

    tokio::time::timeout(reply_timeout, reply_rx)
        .await
        .map_err(|_| CoaError::ReplyTimeout)?
        .map_err(|_| CoaError::ReplyTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_request_deserializes() {
        let req: CoaRequest = serde_json::from_str(r#"{"action":"disconnect","session_id":"abc"}"#).unwrap();
        assert!(matches!(req, CoaRequest::Disconnect { session_id } if session_id == "abc"));
    }

    #[test]
    fn policy_change_request_deserializes() {
        let req: CoaRequest = serde_json::from_str(r#"{"action":"policy_change","session_id":"abc","filter_id":"f1"}"#).unwrap();
        assert!(matches!(req, CoaRequest::PolicyChange { session_id, filter_id } if session_id == "abc" && filter_id == "f1"));
    }

    #[test]
    fn reply_success_omits_error_field() {
        let json = serde_json::to_string(&CoaReply::ok()).unwrap();
        assert_eq!(json, r#"{"success":true}"#);
    }

    #[test]
    fn reply_error_includes_message() {
        let json = serde_json::to_string(&CoaReply::err("not found")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"not found"}"#);
    }
}
