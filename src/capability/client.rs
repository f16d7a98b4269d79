//! 能力服务器客户端：一个子进程一条连接
//!
//! 请求写 stdin，响应由后台 reader 任务从 stdout 读取，并按 id 分发给等待中的请求；
//! stderr 逐行转发到 debug 日志。请求 id 单调递增、永不复用，超时请求的 id 记入 abandoned，
//! 其迟到响应被丢弃；abandoned 只保留最近 MAX_ABANDONED 个，降级时清空。
//!
//! 状态：Starting → Handshaking → Ready；stdout 关闭、写失败或连续协议错误达到上限时 → Degraded，
//! shutdown 后 → Closed。非 Ready 状态下的调用立即返回 Unavailable。

use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::capability::protocol::{
    self, CallResult, CapabilityDescriptor, Frame, InitializeResult, ListResult, ServerInfo,
    SUPPORTED_VERSIONS,
};
use crate::capability::registry::CapabilityBackend;
use crate::capability::secrets;
use crate::config::{CapabilitiesSection, ServerEntry};
use crate::core::CapabilityError;

/// 连接状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Starting,
    Handshaking,
    Ready,
    Degraded,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Starting => "starting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        }
    }
}

/// 连接参数
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// 握手（initialize / tools/list）超时
    pub connect_timeout: Duration,
    /// 连续协议错误上限
    pub max_protocol_errors: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&CapabilitiesSection::default())
    }
}

impl From<&CapabilitiesSection> for ClientOptions {
    fn from(cfg: &CapabilitiesSection) -> Self {
        Self {
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            max_protocol_errors: cfg.max_protocol_errors.max(1),
        }
    }
}

/// 最多记住多少个超时请求 id；更早的迟到响应按未知 id 处理
const MAX_ABANDONED: usize = 256;

type Reply = Result<Value, CapabilityError>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    state: ConnectionState,
    pending: HashMap<u64, oneshot::Sender<Reply>>,
    abandoned: BTreeSet<u64>,
    protocol_errors: u32,
    capabilities: Vec<CapabilityDescriptor>,
    server_info: Option<ServerInfo>,
}

/// reader 任务与客户端共享的连接状态
struct Shared {
    name: String,
    inner: Mutex<Inner>,
    writer: tokio::sync::Mutex<Writer>,
    max_protocol_errors: u32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut inner = self.lock();
        if inner.state != next && inner.state != ConnectionState::Closed {
            tracing::info!(server = %self.name, from = inner.state.as_str(), to = next.as_str(), "connection state");
            inner.state = next;
        }
    }

    /// 降级并让所有等待中的请求立即失败
    fn degrade(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            if inner.state != ConnectionState::Degraded {
                tracing::warn!(server = %self.name, from = inner.state.as_str(), reason, "capability server degraded");
                inner.state = ConnectionState::Degraded;
            }
            inner.abandoned.clear();
            inner.pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(CapabilityError::Unavailable(self.name.clone())));
        }
    }

    /// 记一次协议错误；达到上限返回 true
    fn protocol_error(&self, detail: &str) -> bool {
        let count = {
            let mut inner = self.lock();
            inner.protocol_errors += 1;
            inner.protocol_errors
        };
        tracing::warn!(server = %self.name, count, detail, "protocol error from capability server");
        count >= self.max_protocol_errors
    }

    async fn write_frame(&self, frame: &Value) -> std::io::Result<()> {
        let mut line = frame.to_string();
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    fn dispatch_response(&self, id: u64, reply: Reply) -> bool {
        let tx = {
            let mut inner = self.lock();
            match inner.pending.remove(&id) {
                Some(tx) => {
                    inner.protocol_errors = 0;
                    Some(tx)
                }
                None if inner.abandoned.remove(&id) => {
                    tracing::debug!(server = %self.name, id, "discarding late response for timed-out request");
                    return true;
                }
                None => None,
            }
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }
}

/// 后台读循环：直到 EOF、读错误或降级
async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                shared.degrade("server closed its output");
                break;
            }
            Err(e) => {
                shared.degrade(&format!("read failed: {}", e));
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let handled = match protocol::parse_frame(line) {
            Ok(Frame::Response { id, outcome }) => {
                let reply = outcome.map_err(|e| CapabilityError::Remote {
                    code: e.code,
                    message: e.message,
                });
                if shared.dispatch_response(id, reply) {
                    Ok(())
                } else {
                    Err(format!("response for unknown request id {}", id))
                }
            }
            Ok(Frame::Incomplete { id }) => {
                let reply = Err(CapabilityError::Protocol(
                    "response carried neither result nor error".into(),
                ));
                if shared.dispatch_response(id, reply) {
                    Ok(())
                } else {
                    Err(format!("response for unknown request id {}", id))
                }
            }
            Ok(Frame::Request { id, method }) => {
                let frame = if method == "ping" {
                    protocol::result_frame(&id, json!({}))
                } else {
                    tracing::debug!(server = %shared.name, method = %method, "unsupported server request");
                    protocol::error_frame(&id, protocol::METHOD_NOT_FOUND, "Method not found")
                };
                if let Err(e) = shared.write_frame(&frame).await {
                    shared.degrade(&format!("write failed: {}", e));
                    break;
                }
                Ok(())
            }
            Ok(Frame::Notification { method }) => {
                tracing::debug!(server = %shared.name, method = %method, "server notification");
                Ok(())
            }
            Err(detail) => Err(detail),
        };

        if let Err(detail) = handled {
            if shared.protocol_error(&detail) {
                shared.degrade("too many consecutive protocol errors");
                break;
            }
        }
    }
}

/// stderr 转发到 debug 日志
async fn forward_stderr<R>(name: String, stderr: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %name, "stderr: {}", line);
    }
}

/// 单个能力服务器的连接
pub struct CapabilityClient {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    options: ClientOptions,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl CapabilityClient {
    /// 在任意字节流上建立连接（不握手）
    pub fn from_io<R, W>(name: impl Into<String>, reader: R, writer: W, options: ClientOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Starting,
                pending: HashMap::new(),
                abandoned: BTreeSet::new(),
                protocol_errors: 0,
                capabilities: Vec::new(),
                server_info: None,
            }),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            max_protocol_errors: options.max_protocol_errors.max(1),
        });
        let handle = tokio::spawn(read_loop(shared.clone(), reader));
        Self {
            shared,
            next_id: AtomicU64::new(1),
            options,
            child: Mutex::new(None),
            reader: Mutex::new(Some(handle)),
        }
    }

    /// 在字节流上建立连接并完成握手
    pub async fn connect<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        options: ClientOptions,
    ) -> Result<Self, CapabilityError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let client = Self::from_io(name, reader, writer, options);
        if let Err(e) = client.initialize().await {
            client.shutdown().await;
            return Err(e);
        }
        Ok(client)
    }

    /// 启动子进程并握手。参数中的占位符在这里解析，日志只记录模板。
    pub async fn spawn(
        name: &str,
        entry: &ServerEntry,
        options: ClientOptions,
    ) -> Result<Self, CapabilityError> {
        let args = secrets::resolve_args(name, &entry.args)?;
        let env = secrets::resolve_env(name, &entry.env)?;

        tracing::info!(
            server = %name,
            command = %entry.command,
            args = ?entry.args,
            "starting capability server"
        );

        let mut child = Command::new(&entry.command)
            .args(&args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CapabilityError::Spawn {
                server: name.to_string(),
                reason: e.to_string(),
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return Err(CapabilityError::Spawn {
                    server: name.to_string(),
                    reason: "stdio pipes unavailable".into(),
                });
            }
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.to_string(), stderr));
        }

        let client = Self::from_io(name, stdout, stdin, options);
        *client.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);

        if let Err(e) = client.initialize().await {
            tracing::warn!(server = %name, error = %e, "capability server handshake failed");
            client.shutdown().await;
            return Err(e);
        }
        Ok(client)
    }

    /// initialize → notifications/initialized → tools/list
    async fn initialize(&self) -> Result<(), CapabilityError> {
        let name = self.shared.name.clone();
        let handshake = |reason: String| CapabilityError::Handshake {
            server: name.clone(),
            reason,
        };
        self.shared.set_state(ConnectionState::Handshaking);

        let timeout = self.options.connect_timeout;
        let result = self
            .request("initialize", protocol::initialize_params(), timeout, "initialize")
            .await
            .map_err(|e| handshake(e.to_string()))?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| handshake(e.to_string()))?;

        if !SUPPORTED_VERSIONS.contains(&init.protocol_version.as_str()) {
            return Err(CapabilityError::VersionMismatch {
                server: name.clone(),
                offered: init.protocol_version,
                expected: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            });
        }

        self.shared
            .write_frame(&protocol::notification("notifications/initialized"))
            .await
            .map_err(|e| handshake(e.to_string()))?;

        let mut capabilities = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self
                .request("tools/list", params, timeout, "tools/list")
                .await
                .map_err(|e| handshake(e.to_string()))?;
            let page: ListResult =
                serde_json::from_value(result).map_err(|e| handshake(e.to_string()))?;
            capabilities.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        tracing::info!(
            server = %name,
            protocol = %init.protocol_version,
            capabilities = capabilities.len(),
            "capability server ready"
        );
        {
            let mut inner = self.shared.lock();
            inner.capabilities = capabilities;
            inner.server_info = init.server_info;
        }
        self.shared.set_state(ConnectionState::Ready);
        Ok(())
    }

    /// 发送请求并等待响应；超时后 id 记入 abandoned
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        label: &str,
    ) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.lock();
            match inner.state {
                ConnectionState::Ready | ConnectionState::Handshaking => {}
                _ => return Err(CapabilityError::Unavailable(self.shared.name.clone())),
            }
            inner.pending.insert(id, tx);
        }

        if let Err(e) = self
            .shared
            .write_frame(&protocol::request(id, method, params))
            .await
        {
            self.shared.lock().pending.remove(&id);
            self.shared.degrade(&format!("write failed: {}", e));
            return Err(CapabilityError::Unavailable(self.shared.name.clone()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CapabilityError::Cancelled(self.shared.name.clone())),
            Err(_) => {
                let mut inner = self.shared.lock();
                if inner.pending.remove(&id).is_some() {
                    inner.abandoned.insert(id);
                    if inner.abandoned.len() > MAX_ABANDONED {
                        inner.abandoned.pop_first();
                    }
                }
                Err(CapabilityError::Timeout {
                    capability: label.to_string(),
                    after: timeout,
                })
            }
        }
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.lock().server_info.clone()
    }

    /// 当前等待响应的请求数
    pub fn pending_requests(&self) -> usize {
        self.shared.lock().pending.len()
    }

    #[cfg(test)]
    fn abandoned_requests(&self) -> usize {
        self.shared.lock().abandoned.len()
    }
}

#[async_trait]
impl CapabilityBackend for CapabilityClient {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        self.shared.lock().capabilities.clone()
    }

    async fn invoke(
        &self,
        capability: &str,
        arguments: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<String, CapabilityError> {
        let result = self
            .request(
                "tools/call",
                protocol::call_params(capability, arguments),
                timeout,
                capability,
            )
            .await?;
        let result: CallResult = serde_json::from_value(result)
            .map_err(|e| CapabilityError::Protocol(format!("malformed tools/call result: {}", e)))?;
        if result.is_error {
            Err(CapabilityError::Failed(result.text()))
        } else {
            Ok(result.text())
        }
    }

    /// 关闭连接：等待中的请求以 Cancelled 失败，子进程被终止
    async fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut inner = self.shared.lock();
            if inner.state != ConnectionState::Closed {
                tracing::info!(server = %self.shared.name, from = inner.state.as_str(), "closing capability server");
                inner.state = ConnectionState::Closed;
            }
            inner.pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(CapabilityError::Cancelled(self.shared.name.clone())));
        }

        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::debug!(server = %self.shared.name, error = %e, "kill failed (already exited?)");
            }
        }
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl Drop for CapabilityClient {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().ok().and_then(|h| h.take()) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    /// 测试用服务器端：读客户端请求、写任意帧
    struct FakeServer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        out: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send_raw(&mut self, line: &str) {
            self.out.write_all(line.as_bytes()).await.unwrap();
            self.out.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, frame: Value) {
            self.send_raw(&frame.to_string()).await;
        }

        /// 完成握手：回应 initialize 与 tools/list
        async fn handshake(&mut self, version: &str) {
            let init = self.recv().await;
            assert_eq!(init["method"], "initialize");
            assert_eq!(init["params"]["protocolVersion"], protocol::PROTOCOL_VERSION);
            self.send(json!({
                "jsonrpc": "2.0", "id": init["id"],
                "result": {"protocolVersion": version, "capabilities": {}, "serverInfo": {"name": "fake", "version": "0.1"}}
            }))
            .await;
            if version != protocol::PROTOCOL_VERSION && !SUPPORTED_VERSIONS.contains(&version) {
                return;
            }
            let note = self.recv().await;
            assert_eq!(note["method"], "notifications/initialized");
            let list = self.recv().await;
            assert_eq!(list["method"], "tools/list");
            self.send(json!({
                "jsonrpc": "2.0", "id": list["id"],
                "result": {"tools": [
                    {"name": "echo", "description": "Echo input", "inputSchema": {"type": "object"}},
                    {"name": "run_query", "description": "Run a query"}
                ]}
            }))
            .await;
        }
    }

    fn pair() -> (DuplexStream, FakeServer) {
        let (client_side, server_side) = duplex(64 * 1024);
        let (read, write) = split(server_side);
        (
            client_side,
            FakeServer {
                lines: BufReader::new(read).lines(),
                out: write,
            },
        )
    }

    fn options() -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_secs(5),
            max_protocol_errors: 3,
        }
    }

    async fn ready_client() -> (CapabilityClient, FakeServer) {
        let (io, mut server) = pair();
        let (r, w) = split(io);
        let connecting = tokio::spawn(CapabilityClient::connect("fake", r, w, options()));
        server.handshake(protocol::PROTOCOL_VERSION).await;
        let client = connecting.await.unwrap().unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_handshake_lists_capabilities() {
        let (client, _server) = ready_client().await;
        assert_eq!(client.state(), ConnectionState::Ready);
        let names: Vec<_> = client.capabilities().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["echo", "run_query"]);
        assert_eq!(client.server_info().unwrap().name, "fake");
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (io, mut server) = pair();
        let (r, w) = split(io);
        let connecting = tokio::spawn(CapabilityClient::connect("old", r, w, options()));
        server.handshake("1999-01-01").await;
        let err = connecting.await.unwrap().err().unwrap();
        assert!(matches!(err, CapabilityError::VersionMismatch { ref offered, .. } if offered == "1999-01-01"));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_responses_matched_by_id_out_of_order() {
        let (client, mut server) = ready_client().await;
        let client = Arc::new(client);

        let a = {
            let c = client.clone();
            tokio::spawn(async move { c.invoke("echo", &Map::new(), Duration::from_secs(5)).await })
        };
        let first = server.recv().await;
        let b = {
            let c = client.clone();
            tokio::spawn(async move { c.invoke("run_query", &Map::new(), Duration::from_secs(5)).await })
        };
        let second = server.recv().await;
        assert_ne!(first["id"], second["id"]);

        server
            .send(json!({"jsonrpc": "2.0", "id": second["id"], "result": {"content": [{"type": "text", "text": "second"}]}}))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "id": first["id"], "result": {"content": [{"type": "text", "text": "first"}]}}))
            .await;

        assert_eq!(a.await.unwrap().unwrap(), "first");
        assert_eq!(b.await.unwrap().unwrap(), "second");
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_discarded() {
        let (client, mut server) = ready_client().await;
        let err = client
            .invoke("echo", &Map::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Timeout { .. }));
        let late = server.recv().await;

        // 迟到响应不计入协议错误
        server
            .send(json!({"jsonrpc": "2.0", "id": late["id"], "result": {"content": []}}))
            .await;
        assert_eq!(client.pending_requests(), 0);
        let next = {
            let args = Map::new();
            let fut = client.invoke("echo", &args, Duration::from_secs(5));
            tokio::pin!(fut);
            tokio::select! {
                r = &mut fut => r,
                req = server.recv() => {
                    assert!(req["id"].as_u64().unwrap() > late["id"].as_u64().unwrap());
                    server.send(json!({"jsonrpc": "2.0", "id": req["id"], "result": {"content": [{"type": "text", "text": "ok"}]}})).await;
                    fut.await
                }
            }
        };
        assert_eq!(next.unwrap(), "ok");
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_is_error_maps_to_failed() {
        let (client, mut server) = ready_client().await;
        let args = Map::new();
        let fut = client.invoke("run_query", &args, Duration::from_secs(5));
        tokio::pin!(fut);
        let result = tokio::select! {
            r = &mut fut => r,
            req = server.recv() => {
                server.send(json!({"jsonrpc": "2.0", "id": req["id"], "result": {"content": [{"type": "text", "text": "index not found"}], "isError": true}})).await;
                fut.await
            }
        };
        assert_eq!(result, Err(CapabilityError::Failed("index not found".into())));
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (_client, mut server) = ready_client().await;
        server
            .send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}))
            .await;
        let pong = server.recv().await;
        assert_eq!(pong["id"], "srv-1");
        assert_eq!(pong["result"], json!({}));

        server
            .send(json!({"jsonrpc": "2.0", "id": 77, "method": "sampling/createMessage"}))
            .await;
        let refused = server.recv().await;
        assert_eq!(refused["error"]["code"], protocol::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_repeated_garbage_degrades_connection() {
        let (client, mut server) = ready_client().await;
        for _ in 0..3 {
            server.send_raw("this is not json").await;
        }
        for _ in 0..50 {
            if client.state() == ConnectionState::Degraded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.state(), ConnectionState::Degraded);
        let err = client
            .invoke("echo", &Map::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Unavailable("fake".into()));
    }

    #[tokio::test]
    async fn test_eof_fails_pending_and_degrades() {
        let (client, mut server) = ready_client().await;
        let args = Map::new();
        let fut = client.invoke("echo", &args, Duration::from_secs(5));
        tokio::pin!(fut);
        let result = tokio::select! {
            r = &mut fut => r,
            _ = server.recv() => {
                drop(server);
                fut.await
            }
        };
        assert_eq!(result, Err(CapabilityError::Unavailable("fake".into())));
        assert_eq!(client.state(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn test_shutdown_closes() {
        let (client, _server) = ready_client().await;
        client.shutdown().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        let err = client
            .invoke("echo", &Map::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Unavailable("fake".into()));
    }

    #[tokio::test]
    async fn test_abandoned_ids_are_bounded_and_cleared_on_degrade() {
        let (client, server) = ready_client().await;
        for _ in 0..MAX_ABANDONED + 10 {
            let err = client
                .invoke("echo", &Map::new(), Duration::from_millis(1))
                .await
                .unwrap_err();
            assert!(matches!(err, CapabilityError::Timeout { .. }));
        }
        assert_eq!(client.abandoned_requests(), MAX_ABANDONED);
        assert_eq!(client.pending_requests(), 0);

        drop(server);
        for _ in 0..50 {
            if client.state() == ConnectionState::Degraded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.state(), ConnectionState::Degraded);
        assert_eq!(client.abandoned_requests(), 0);
    }
}
