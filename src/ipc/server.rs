//! Local control server for `vdesk-ctl`.
//!
//! Listens on a Unix domain socket (Linux/macOS) or named pipe (Windows)
//! using the `interprocess` crate. Each connection carries line-delimited
//! JSON commands that are routed to the [`SessionRegistry`].
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "create", "width": 1280, "height": 720}
//! {"command": "list"}
//! {"command": "get", "id": "…"}
//! {"command": "inspect", "id": "…"}
//! {"command": "stop", "id": "…"}
//! {"command": "resize", "id": "…", "width": 1600, "height": 900}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: session …", "not_found": true}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::orchestrator::SessionRegistry;
use crate::{AppError, Result};

/// Inbound request from `vdesk-ctl`.
#[derive(Debug, Deserialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Session identifier (for `get`, `inspect`, `stop`, `resize`).
    #[serde(default)]
    pub id: Option<String>,
    /// Requested width (for `create`, `resize`).
    #[serde(default)]
    pub width: Option<i64>,
    /// Requested height (for `create`, `resize`).
    #[serde(default)]
    pub height: Option<i64>,
}

/// Outbound response to `vdesk-ctl`.
#[derive(Debug, Serialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the failure is an unknown session.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub not_found: bool,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            not_found: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            not_found: false,
        }
    }

    fn from_error(err: &AppError) -> Self {
        Self {
            not_found: err.is_not_found(),
            ..Self::error(err.to_string())
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    registry: Arc<SessionRegistry>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = registry.config().ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, Arc::clone(&registry)));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    registry: Arc<SessionRegistry>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &registry).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        debug!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route a command to the registry.
pub async fn dispatch_command(request: &IpcRequest, registry: &SessionRegistry) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        match request.command.as_str() {
            "create" => handle_create(request, registry).await,
            "list" => to_response(Ok(registry.list())),
            "get" => match require_id(request) {
                Ok(id) => to_response(registry.get(id)),
                Err(response) => response,
            },
            "inspect" => match require_id(request) {
                Ok(id) => to_response(registry.inspect(id)),
                Err(response) => response,
            },
            "stop" => match require_id(request) {
                Ok(id) => {
                    let stopped = registry.stop(id).await;
                    IpcResponse::success(serde_json::json!({ "stopped": stopped }))
                }
                Err(response) => response,
            },
            "resize" => handle_resize(request, registry).await,
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

async fn handle_create(request: &IpcRequest, registry: &SessionRegistry) -> IpcResponse {
    to_response(registry.create(request.width, request.height).await)
}

async fn handle_resize(request: &IpcRequest, registry: &SessionRegistry) -> IpcResponse {
    let id = match require_id(request) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let (Some(width), Some(height)) = (request.width, request.height) else {
        return IpcResponse::error("resize requires width and height");
    };
    match registry.resize(id, width, height).await {
        Ok(()) => IpcResponse::success(serde_json::json!({ "resized": true })),
        Err(err) => {
            if !err.is_not_found() {
                warn!(session_id = id, %err, "resize failed");
            }
            IpcResponse::from_error(&err)
        }
    }
}

fn require_id(request: &IpcRequest) -> std::result::Result<&str, IpcResponse> {
    request
        .id
        .as_deref()
        .ok_or_else(|| IpcResponse::error(format!("{} requires an id", request.command)))
}

fn to_response<T: Serialize>(result: Result<T>) -> IpcResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => IpcResponse::success(data),
            Err(err) => IpcResponse::error(format!("serialization failed: {err}")),
        },
        Err(err) => {
            if err.is_not_found() {
                debug!(%err, "lookup miss");
            } else {
                warn!(%err, "command failed");
            }
            IpcResponse::from_error(&err)
        }
    }
}
