//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `GATEKEEPER__*` 覆盖（双下划线表示嵌套，如 `GATEKEEPER__LLM__PROVIDER=openai`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub capabilities: CapabilitiesSection,
    /// 能力服务器：名称 -> 启动方式（按名称排序，启动顺序稳定）
    pub servers: BTreeMap<String, ServerEntry>,
    pub approval: ApprovalSection,
    pub checkpoint: CheckpointSection,
    pub retrieval: RetrievalSection,
    pub server: HttpSection,
}

/// [app] 段：应用名、系统提示词、单次请求的模型轮次上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_model_turns")]
    pub max_model_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            system_prompt: default_system_prompt(),
            max_model_turns: default_max_model_turns(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are a careful operations assistant. Use the available tools to answer; \
     some tools require human approval before they run."
        .to_string()
}

fn default_max_model_turns() -> usize {
    25
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；没有对应 API Key 时退回 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [capabilities] 段：调用 / 握手超时与协议错误容忍度
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilitiesSection {
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 连续多少个无法解析的帧后将连接标记为 degraded
    #[serde(default = "default_max_protocol_errors")]
    pub max_protocol_errors: u32,
}

impl Default for CapabilitiesSection {
    fn default() -> Self {
        Self {
            invocation_timeout_secs: default_invocation_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_protocol_errors: default_max_protocol_errors(),
        }
    }
}

fn default_invocation_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_max_protocol_errors() -> u32 {
    3
}

/// [servers.<name>] 段：子进程命令、参数（可含 `$VAR` / `${VAR}` 占位符）、是否启用、额外环境变量
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

/// [approval] 段：需要人工审批的能力（完整名称，如 `splunk_run_query`）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApprovalSection {
    #[serde(default)]
    pub sensitive_capabilities: Vec<String>,
}

/// [checkpoint] 段：后端 memory / file / sqlite 与存储位置
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_backend")]
    pub backend: String,
    /// file：目录；sqlite：数据库文件
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: default_checkpoint_backend(),
            path: default_checkpoint_path(),
        }
    }
}

fn default_checkpoint_backend() -> String {
    "file".to_string()
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("data/checkpoints")
}

/// [retrieval] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSection {
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// 启动时载入知识库的文本文件（每个文件按空行切分成文档）
    #[serde(default)]
    pub documents: Vec<PathBuf>,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            documents: Vec::new(),
        }
    }
}

fn default_k() -> usize {
    4
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// 从 config 目录加载配置，环境变量 GATEKEEPER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 GATEKEEPER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("GATEKEEPER")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 从 TOML 字符串解析（测试与嵌入式配置用）
pub fn parse_config(toml: &str) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_model_turns, 25);
        assert_eq!(cfg.capabilities.invocation_timeout_secs, 30);
        assert_eq!(cfg.capabilities.max_protocol_errors, 3);
        assert_eq!(cfg.checkpoint.backend, "file");
        assert_eq!(cfg.retrieval.default_k, 4);
        assert!(cfg.servers.is_empty());
    }

    #[test]
    fn test_parse_servers_and_approval() {
        let cfg = parse_config(
            r#"
            [approval]
            sensitive_capabilities = ["splunk_run_query"]

            [servers.splunk]
            command = "splunk-mcp"
            args = ["--token", "${SPLUNK_TOKEN}"]

            [servers.github]
            command = "npx"
            enabled = false

            [servers.github.env]
            LOG_LEVEL = "debug"
            "#,
        )
        .unwrap();

        let names: Vec<_> = cfg.servers.keys().cloned().collect();
        assert_eq!(names, vec!["github", "splunk"]);
        assert!(cfg.servers["splunk"].enabled);
        assert!(!cfg.servers["github"].enabled);
        assert_eq!(
            cfg.servers["github"].env.values().collect::<Vec<_>>(),
            vec!["debug"]
        );
        assert_eq!(cfg.approval.sensitive_capabilities, vec!["splunk_run_query"]);
        assert_eq!(cfg.capabilities.connect_timeout_secs, 30);
    }
}
