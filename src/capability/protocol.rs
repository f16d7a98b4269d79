//! 能力服务器协议：换行分隔的 JSON-RPC 2.0（MCP 方法名）
//!
//! 客户端方法：initialize → notifications/initialized → tools/list → tools/call。
//! 服务器可发来 ping 请求（回空结果）与通知（仅记录）。

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// 客户端发起握手时提供的协议版本
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// 可接受的服务器协议版本
pub const SUPPORTED_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC 错误对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// 从服务器读到的一帧
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// 对客户端请求的响应
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    /// 有 id 但既没有 result 也没有 error
    Incomplete { id: u64 },
    /// 服务器发起的请求（需要回复）
    Request { id: Value, method: String },
    Notification { method: String },
}

/// 解析一行；无法识别的帧返回 Err（调用方计入协议错误）
pub fn parse_frame(line: &str) -> Result<Frame, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {}", e))?;
    let obj = value
        .as_object()
        .ok_or_else(|| "frame is not a JSON object".to_string())?;

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some("2.0") => {}
        other => return Err(format!("unsupported jsonrpc version: {:?}", other)),
    }

    let id = obj.get("id").filter(|v| !v.is_null());

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        return Ok(match id {
            Some(id) => Frame::Request {
                id: id.clone(),
                method: method.to_string(),
            },
            None => Frame::Notification {
                method: method.to_string(),
            },
        });
    }

    let id = match id {
        Some(v) => v
            .as_u64()
            .ok_or_else(|| format!("response id {} is not a request id", v))?,
        None => return Err("response without id".to_string()),
    };

    if let Some(error) = obj.get("error") {
        let error: RpcError = serde_json::from_value(error.clone())
            .map_err(|e| format!("malformed error object: {}", e))?;
        return Ok(Frame::Response {
            id,
            outcome: Err(error),
        });
    }
    match obj.get("result") {
        Some(result) => Ok(Frame::Response {
            id,
            outcome: Ok(result.clone()),
        }),
        None => Ok(Frame::Incomplete { id }),
    }
}

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub fn notification(method: &str) -> Value {
    json!({ "jsonrpc": "2.0", "method": method })
}

pub fn result_frame(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn error_frame(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// initialize 请求参数
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

pub fn call_params(capability: &str, arguments: &Map<String, Value>) -> Value {
    json!({ "name": capability, "arguments": arguments })
}

/// initialize 响应中关心的字段
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// 服务器声明的一项能力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

pub fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// tools/list 响应（支持 nextCursor 分页）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    #[serde(default)]
    pub tools: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// tools/call 响应
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallResult {
    /// 文本块按顺序拼接；非文本块以占位描述代替
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|block| match &block.text {
                Some(text) => text.clone(),
                None => format!("[{} content]", block.kind),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
