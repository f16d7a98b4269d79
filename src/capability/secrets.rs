//! 启动参数中的密钥占位符替换
//!
//! 支持 `${VAR}` 与 `$VAR`，`$$` 表示字面 `$`。占位符在启动前从环境变量解析；
//! 缺失的变量是该服务器的配置错误。替换后的值只传给子进程，日志里只出现模板。

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::core::CapabilityError;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .unwrap_or_else(|e| panic!("placeholder pattern: {}", e))
    })
}

/// 替换单个模板；lookup 返回 None 时报 MissingSecret
pub fn substitute(
    server: &str,
    template: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, CapabilityError> {
    let mut missing: Option<String> = None;
    let out = placeholder().replace_all(template, |caps: &Captures| {
        if caps.get(1).is_some() {
            return "$".to_string();
        }
        let var = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match lookup(var) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| var.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(variable) => Err(CapabilityError::MissingSecret {
            server: server.to_string(),
            variable,
        }),
        None => Ok(out.into_owned()),
    }
}

/// 用进程环境变量解析服务器参数
pub fn resolve_args(server: &str, args: &[String]) -> Result<Vec<String>, CapabilityError> {
    args.iter()
        .map(|arg| substitute(server, arg, |var| std::env::var(var).ok()))
        .collect()
}

/// 用进程环境变量解析服务器额外环境变量的值
pub fn resolve_env(
    server: &str,
    env: &BTreeMap<String, String>,
) -> Result<Vec<(String, String)>, CapabilityError> {
    env.iter()
        .map(|(key, value)| {
            substitute(server, value, |var| std::env::var(var).ok()).map(|v| (key.clone(), v))
        })
        .collect()
}
