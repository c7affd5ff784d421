//! MCP server: newline-delimited JSON-RPC 2.0 over stdio.
//!
//! The reader pulls one request at a time; tool calls and resource reads run
//! concurrently as tasks, and every response funnels through a single writer
//! task, so partial JSON is never interleaved. Responses carry the
//! originating id but not the original order. On stdin EOF (or a signal) the
//! server stops accepting, gives in-flight handlers a drain window, and
//! shuts subsystems down in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use meridian_protocol::{
    methods, ContentBlock, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ResourceContents, ResourceReadParams, ResourceReadResult, ResourcesListResult, RpcErrorCode,
    ServerCapabilities, ServerInfo, ToolCallParams, ToolCallResult, ToolError,
    ToolsListResult, JSONRPC_VERSION, MCP_PROTOCOL_VERSION,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::ServerContext;
use crate::resources::{build_resources, ResourceRegistry};
use crate::tools::{build_registry, ToolRegistry};

/// The server. Construction closes the registries; `run` serves stdio.
pub struct McpServer {
    ctx: Arc<ServerContext>,
    tools: Arc<ToolRegistry>,
    resources: Arc<ResourceRegistry>,
    initialized: Arc<AtomicBool>,
}

impl McpServer {
    pub fn new(ctx: Arc<ServerContext>) -> Result<Self> {
        let tools = Arc::new(build_registry(&ctx.config)?);
        let resources = Arc::new(build_resources());
        info!(
            "registered {} tools, {} resources",
            tools.len(),
            resources.list().len()
        );
        Ok(Self {
            ctx,
            tools,
            resources,
            initialized: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Serve until stdin EOF or an interrupt signal.
    pub async fn run(&self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        // Single writer task: the only place that touches stdout.
        let (out_tx, mut out_rx) = mpsc::channel::<JsonRpcResponse>(64);
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(response) = out_rx.recv().await {
                let json = match serde_json::to_string(&response) {
                    Ok(json) => json,
                    Err(err) => {
                        error!("failed to serialize response: {}", err);
                        continue;
                    }
                };
                debug!("sending: {}", json);
                if stdout.write_all(json.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdout.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut in_flight: JoinSet<()> = JoinSet::new();
        info!("MCP server serving ({:?} mode)", self.ctx.config.mode);

        loop {
            // Reap finished handlers without blocking the read loop.
            while in_flight.try_join_next().is_some() {}

            let line = tokio::select! {
                line = lines.next_line() => line.context("failed to read from stdin")?,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break;
                }
            };

            let Some(line) = line else {
                info!("stdin closed");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            debug!("received: {}", line);

            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(err) => {
                    let response = JsonRpcResponse::error(
                        None,
                        JsonRpcError::new(RpcErrorCode::ParseError, format!("invalid JSON: {err}")),
                    );
                    let _ = out_tx.send(response).await;
                    continue;
                }
            };

            if request.jsonrpc != JSONRPC_VERSION {
                let response = JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(
                        RpcErrorCode::InvalidRequest,
                        format!("invalid JSON-RPC version: {}", request.jsonrpc),
                    ),
                );
                let _ = out_tx.send(response).await;
                continue;
            }

            match request.method.as_str() {
                methods::INITIALIZE => {
                    let response = self.handle_initialize(request);
                    let _ = out_tx.send(response).await;
                }
                methods::INITIALIZED => {
                    // Notification; no response. An id'd variant gets null.
                    if let Some(id) = request.id {
                        let _ = out_tx
                            .send(JsonRpcResponse::success(Some(id), Value::Null))
                            .await;
                    }
                }
                methods::PING => {
                    if let Some(id) = request.id {
                        let _ = out_tx
                            .send(JsonRpcResponse::success(
                                Some(id),
                                Value::Object(Default::default()),
                            ))
                            .await;
                    }
                }
                methods::TOOLS_LIST => {
                    let result = ToolsListResult {
                        tools: self.tools.list_tools(),
                    };
                    let _ = out_tx
                        .send(JsonRpcResponse::success(
                            request.id,
                            serde_json::to_value(result).unwrap_or(Value::Null),
                        ))
                        .await;
                }
                methods::RESOURCES_LIST => {
                    let result = ResourcesListResult {
                        resources: self.resources.list(),
                    };
                    let _ = out_tx
                        .send(JsonRpcResponse::success(
                            request.id,
                            serde_json::to_value(result).unwrap_or(Value::Null),
                        ))
                        .await;
                }
                methods::TOOLS_CALL => {
                    // Handlers run concurrently; the writer serializes output.
                    let ctx = Arc::clone(&self.ctx);
                    let tools = Arc::clone(&self.tools);
                    let initialized = Arc::clone(&self.initialized);
                    let out = out_tx.clone();
                    in_flight.spawn(async move {
                        let response =
                            handle_tools_call(&ctx, &tools, &initialized, request).await;
                        let _ = out.send(response).await;
                    });
                }
                methods::RESOURCES_READ => {
                    let ctx = Arc::clone(&self.ctx);
                    let resources = Arc::clone(&self.resources);
                    let out = out_tx.clone();
                    in_flight.spawn(async move {
                        let response = handle_resources_read(&ctx, &resources, request).await;
                        let _ = out.send(response).await;
                    });
                }
                _ => {
                    let response = JsonRpcResponse::error(
                        request.id,
                        JsonRpcError::new(
                            RpcErrorCode::MethodNotFound,
                            format!("unknown method: {}", request.method),
                        ),
                    );
                    let _ = out_tx.send(response).await;
                }
            }
        }

        // Drain window for in-flight handlers, then abort stragglers.
        let drain = self.ctx.config.drain_window;
        info!("draining in-flight handlers ({}s window)", drain.as_secs());
        let drain_all = async {
            while in_flight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(drain, drain_all).await.is_err() {
            warn!("drain window elapsed; aborting remaining handlers");
            in_flight.abort_all();
        }

        self.ctx.shutdown().await;

        drop(out_tx);
        let _ = writer.await;
        info!("MCP server stopped");
        Ok(())
    }

    fn handle_initialize(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if let Some(params) = &request.params {
            if let Some(client) = params.get("clientInfo") {
                info!(
                    "initialize from {} v{}",
                    client.get("name").and_then(serde_json::Value::as_str).unwrap_or("?"),
                    client.get("version").and_then(serde_json::Value::as_str).unwrap_or("?"),
                );
            }
        }

        self.initialized.store(true, Ordering::SeqCst);

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(meridian_protocol::ToolsCapability {
                    list_changed: false,
                }),
                resources: Some(meridian_protocol::ResourcesCapability {
                    subscribe: false,
                    list_changed: false,
                }),
                logging: None,
            },
            server_info: ServerInfo {
                name: self.ctx.config.server_name.clone(),
                version: self.ctx.config.server_version.clone(),
            },
        };

        JsonRpcResponse::success(
            request.id,
            serde_json::to_value(result).unwrap_or(Value::Null),
        )
    }
}

async fn handle_tools_call(
    ctx: &ServerContext,
    tools: &ToolRegistry,
    initialized: &AtomicBool,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    if !initialized.load(Ordering::SeqCst) {
        return JsonRpcResponse::error(
            request.id,
            JsonRpcError::new(RpcErrorCode::ServerError(-32002), "server not initialized"),
        );
    }

    let params: ToolCallParams = match request.params {
        Some(params) => match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(
                        RpcErrorCode::InvalidParams,
                        format!("invalid tool call params: {err}"),
                    ),
                );
            }
        },
        None => {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(RpcErrorCode::InvalidParams, "missing tool call params"),
            );
        }
    };

    info!("tool call: {}", params.name);
    let started = std::time::Instant::now();
    let outcome = tools.call_tool(&params.name, params.arguments, ctx).await;
    debug!(
        "tool {} finished in {}ms",
        params.name,
        started.elapsed().as_millis()
    );

    let envelope = match outcome {
        Ok(value) => bounded_ok(value, ctx.config.max_response_bytes),
        Err(tool_err) => ToolCallResult::err(&tool_err),
    };

    JsonRpcResponse::success(
        request.id,
        serde_json::to_value(envelope).unwrap_or(Value::Null),
    )
}

/// Wrap a success payload, replacing it with a truncation notice when it
/// exceeds the response budget.
fn bounded_ok(value: Value, max_bytes: usize) -> ToolCallResult {
    let serialized = serde_json::to_string(&value).unwrap_or_default();
    if serialized.len() <= max_bytes {
        return ToolCallResult::ok(value);
    }

    warn!(
        "response truncated: {} bytes over the {} byte budget",
        serialized.len(),
        max_bytes
    );
    let notice = ToolError::resource_exhausted(
        "response exceeded the size budget; narrow the request or paginate",
    )
    .with_details(serde_json::json!({
        "original_bytes": serialized.len(),
        "max_bytes": max_bytes,
    }));
    ToolCallResult::err(&notice)
}

async fn handle_resources_read(
    ctx: &ServerContext,
    resources: &ResourceRegistry,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    let params: ResourceReadParams = match request.params {
        Some(params) => match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(
                        RpcErrorCode::InvalidParams,
                        format!("invalid resource read params: {err}"),
                    ),
                );
            }
        },
        None => {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(RpcErrorCode::InvalidParams, "missing resource uri"),
            );
        }
    };

    match resources.read(&params.uri, ctx).await {
        Ok((mime_type, value)) => {
            let result = ResourceReadResult {
                contents: vec![ResourceContents {
                    uri: params.uri,
                    mime_type,
                    text: serde_json::to_string_pretty(&value).unwrap_or_default(),
                }],
            };
            JsonRpcResponse::success(
                request.id,
                serde_json::to_value(result).unwrap_or(Value::Null),
            )
        }
        Err(tool_err) => {
            // Resource failures ride the tool-error envelope shape.
            let envelope = ToolCallResult {
                content: vec![ContentBlock::text(tool_err.to_string())],
                structured_content: Some(tool_err.to_payload()),
                is_error: true,
            };
            JsonRpcResponse::success(
                request.id,
                serde_json::to_value(envelope).unwrap_or(Value::Null),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bounded_ok_passes_small_payloads() {
        let envelope = bounded_ok(json!({"v": 1}), 1024);
        assert!(!envelope.is_error);
        assert_eq!(envelope.structured_content.unwrap()["v"], 1);
    }

    #[test]
    fn test_bounded_ok_truncates_large_payloads() {
        let big = json!({ "data": "x".repeat(4096) });
        let envelope = bounded_ok(big, 256);
        assert!(envelope.is_error);
        let payload = envelope.structured_content.unwrap();
        assert_eq!(payload["code"], "RESOURCE_EXHAUSTED");
        assert!(payload["details"]["original_bytes"].as_u64().unwrap() > 256);
    }
}
