//! 演示能力服务器：通过 stdin/stdout 说换行分隔的 JSON-RPC
//!
//! 启动: cargo run --bin gatekeeper-demo-server [--protocol-version <v>]
//! 能力：echo、sensitive_call、slow（sleep seconds 秒）、fail（返回 isError）、crash（直接退出进程）。
//! stdout 只写协议帧，日志写 stderr。

use std::sync::Arc;
use std::time::Duration;

use gatekeeper::capability::protocol::{self, PROTOCOL_VERSION};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

const INVALID_PARAMS: i64 = -32602;

fn tool_descriptors() -> Value {
    let text_arg = |field: &str, desc: &str| {
        json!({
            "type": "object",
            "properties": { field: { "type": "string", "description": desc } },
            "required": [field]
        })
    };
    json!([
        {
            "name": "echo",
            "description": "Return the given text unchanged",
            "inputSchema": text_arg("text", "Text to echo back")
        },
        {
            "name": "sensitive_call",
            "description": "Perform a privileged operation on the demo system",
            "inputSchema": text_arg("action", "The operation to perform")
        },
        {
            "name": "slow",
            "description": "Sleep for the given number of seconds, then report completion",
            "inputSchema": {
                "type": "object",
                "properties": { "seconds": { "type": "number", "description": "Seconds to sleep" } },
                "required": ["seconds"]
            }
        },
        {
            "name": "fail",
            "description": "Always report an error",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "crash",
            "description": "Terminate the server process",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}

fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text.into() }],
        "isError": is_error
    })
}

async fn send(out: &Mutex<Stdout>, frame: Value) {
    let mut line = frame.to_string();
    line.push('\n');
    let mut out = out.lock().await;
    if let Err(e) = out.write_all(line.as_bytes()).await {
        tracing::error!(error = %e, "failed to write frame");
        return;
    }
    let _ = out.flush().await;
}

/// 执行一次 tools/call；Err 表示参数错误（JSON-RPC error）
async fn call_tool(name: &str, args: &Map<String, Value>) -> Result<Value, (i64, String)> {
    let text = |field: &str| {
        args.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or((INVALID_PARAMS, format!("missing string argument '{}'", field)))
    };
    match name {
        "echo" => Ok(text_result(text("text")?, false)),
        "sensitive_call" => {
            let action = text("action")?;
            Ok(text_result(format!("Privileged operation '{}' completed", action), false))
        }
        "slow" => {
            let seconds = args
                .get("seconds")
                .and_then(Value::as_f64)
                .ok_or((INVALID_PARAMS, "missing number argument 'seconds'".to_string()))?;
            tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            Ok(text_result(format!("Slept for {} seconds", seconds), false))
        }
        "fail" => Ok(text_result("The demo operation failed", true)),
        "crash" => {
            tracing::warn!("crash requested, exiting");
            std::process::exit(1);
        }
        other => Err((INVALID_PARAMS, format!("unknown tool '{}'", other))),
    }
}

async fn handle(out: Arc<Mutex<Stdout>>, version: Arc<String>, frame: Value) {
    let method = frame.get("method").and_then(Value::as_str).unwrap_or_default();
    let Some(id) = frame.get("id").cloned().filter(|v| !v.is_null()) else {
        tracing::debug!(method, "notification received");
        return;
    };
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    let reply = match method {
        "initialize" => protocol::result_frame(
            &id,
            json!({
                "protocolVersion": version.as_str(),
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "gatekeeper-demo", "version": env!("CARGO_PKG_VERSION") }
            }),
        ),
        "ping" => protocol::result_frame(&id, json!({})),
        "tools/list" => protocol::result_frame(&id, json!({ "tools": tool_descriptors() })),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = params
                .get("arguments")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            tracing::info!(tool = name, "tools/call");
            match call_tool(name, &args).await {
                Ok(result) => protocol::result_frame(&id, result),
                Err((code, message)) => protocol::error_frame(&id, code, &message),
            }
        }
        other => protocol::error_frame(
            &id,
            protocol::METHOD_NOT_FOUND,
            &format!("Method not found: {}", other),
        ),
    };
    send(&out, reply).await;
}

fn protocol_version_arg() -> String {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == "--protocol-version")
        .and_then(|i| args.get(i + 1).cloned())
        .unwrap_or_else(|| PROTOCOL_VERSION.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gatekeeper::observability::init();

    let version = Arc::new(protocol_version_arg());
    let out = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    tracing::info!(protocol_version = %version, "demo capability server started");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let frame: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed frame");
                continue;
            }
        };
        // 每个请求独立处理，slow 不阻塞后续请求
        tokio::spawn(handle(Arc::clone(&out), Arc::clone(&version), frame));
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}
