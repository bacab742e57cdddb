// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for the cn-agent migration processes.
//!
//! The processes speak line-delimited JSON over TCP. Every request carries
//! an `eventId`; the process answers with a `response` (or `end`) echoing
//! it, or an `error`. `progress` messages may arrive at any time while a
//! command runs:
//!
//! ```text
//! -> {"type":"request","command":"sync","eventId":2,"host":"10.0.0.5","port":4242}
//! <- {"type":"progress","current_progress":1024,"total_progress":4096}
//! <- {"type":"response","eventId":2}
//! ```

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use vmflow_clients::AgentProcess;
use vmflow_core::TaskError;

const SERVICE: &str = "sync";

/// Longest line accepted from a migration process.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Errors talking to a migration process.
#[derive(Debug, Error)]
pub enum SyncProtocolError {
    /// The TCP connection could not be established.
    #[error("Failed to connect to migration process at {addr}: {message}")]
    Connect {
        /// `host:port`
        addr: String,
        /// Error details
        message: String,
    },

    /// The process closed the connection before answering.
    #[error("Migration process closed the connection")]
    Closed,

    /// The process answered with an error.
    #[error("Migration process error: {0}")]
    Remote(String),

    /// The process sent something that is not a protocol message.
    #[error("Invalid message from migration process: {0}")]
    Invalid(String),

    /// Reading or writing the socket failed.
    #[error("Migration process I/O error: {0}")]
    Io(String),

    /// No answer within the allotted time.
    #[error("Migration process did not answer within {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl From<LinesCodecError> for SyncProtocolError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                SyncProtocolError::Invalid("line too long".to_string())
            }
            LinesCodecError::Io(e) => SyncProtocolError::Io(e.to_string()),
        }
    }
}

impl From<SyncProtocolError> for TaskError {
    fn from(err: SyncProtocolError) -> Self {
        match err {
            SyncProtocolError::Remote(message) => TaskError::AgentTaskFailed {
                task_id: SERVICE.to_string(),
                message,
            },
            SyncProtocolError::Invalid(message) => TaskError::Service {
                service: SERVICE.to_string(),
                status: 0,
                message,
            },
            other => TaskError::transient(SERVICE, other.to_string()),
        }
    }
}

/// An open connection to a migration process.
pub struct SyncConnection {
    framed: Framed<TcpStream, LinesCodec>,
    next_event: u64,
    addr: String,
}

impl SyncConnection {
    /// Connect to `process`.
    pub async fn connect(process: &AgentProcess, timeout: Duration) -> Result<Self, SyncProtocolError> {
        let addr = format!("{}:{}", process.host, process.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SyncProtocolError::Timeout(timeout))?
            .map_err(|e| SyncProtocolError::Connect {
                addr: addr.clone(),
                message: e.to_string(),
            })?;
        debug!(addr = %addr, pid = process.pid, "Connected to migration process");

        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            next_event: 1,
            addr,
        })
    }

    /// Send `command` and wait for its answer.
    ///
    /// `args` must be an object (or null); its fields are merged into the
    /// request. `on_progress(current, total)` is called for every progress
    /// message received meanwhile. Returns the answer's fields.
    pub async fn command<F>(
        &mut self,
        command: &str,
        args: Value,
        mut on_progress: F,
    ) -> Result<Map<String, Value>, SyncProtocolError>
    where
        F: FnMut(u64, u64),
    {
        let event_id = self.next_event;
        self.next_event += 1;

        let mut request = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(SyncProtocolError::Invalid(format!(
                    "command arguments must be an object, got {}",
                    other
                )));
            }
        };
        request.insert("type".to_string(), json!("request"));
        request.insert("command".to_string(), json!(command));
        request.insert("eventId".to_string(), json!(event_id));

        self.framed.send(Value::Object(request).to_string()).await?;
        debug!(addr = %self.addr, command = %command, event_id, "Sent migration command");

        loop {
            let line = match self.framed.next().await {
                Some(line) => line?,
                None => return Err(SyncProtocolError::Closed),
            };
            let message: Map<String, Value> = serde_json::from_str(&line)
                .map_err(|e| SyncProtocolError::Invalid(format!("{}: {}", e, line)))?;

            let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();
            let answers = message
                .get("eventId")
                .and_then(Value::as_u64)
                .is_none_or(|id| id == event_id);

            match kind {
                "progress" => {
                    let current = message
                        .get("current_progress")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    let total = message
                        .get("total_progress")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    on_progress(current, total);
                }
                "error" if answers => {
                    let reason = message
                        .get("message")
                        .or_else(|| message.get("error"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    return Err(SyncProtocolError::Remote(reason.to_string()));
                }
                "response" | "end" if answers => return Ok(message),
                _ => {
                    debug!(addr = %self.addr, message = %line, "Ignoring unrelated migration message");
                }
            }
        }
    }
}

/// Ask `process` to stop, waiting at most `timeout` for the answer.
pub async fn request_stop(process: &AgentProcess, timeout: Duration) -> Result<(), SyncProtocolError> {
    let stop = async {
        let mut conn = SyncConnection::connect(process, timeout).await?;
        conn.command("stop", Value::Null, |_, _| {}).await?;
        Ok::<(), SyncProtocolError>(())
    };
    match tokio::time::timeout(timeout, stop).await {
        Ok(result) => result,
        Err(_) => {
            warn!(pid = process.pid, host = %process.host, port = process.port, "Migration process ignored stop");
            Err(SyncProtocolError::Timeout(timeout))
        }
    }
}
