//! 斜杠命令：以 `/` 开头的消息不进入对话，直接返回说明文本
//!
//! /help、/tools（按提供者分组并标出需要审批的能力）、/servers（别名 /mcp）。

use crate::capability::CapabilityRegistry;

const HELP: &str = "Available commands:\n\
  /help     Show this help\n\
  /tools    List all capabilities (local and remote)\n\
  /servers  Show capability servers and their connection state (alias: /mcp)\n\
\n\
Any other message is sent to the assistant. Capabilities marked [approval] pause the \
conversation until a human approves, rejects or edits the call.";

/// 处理斜杠命令；不是命令时返回 None
pub async fn handle_command(message: &str, registry: &CapabilityRegistry) -> Option<String> {
    let trimmed = message.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let command = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();

    let reply = match command.as_str() {
        "/help" => HELP.to_string(),
        "/tools" => list_tools(registry).await,
        "/servers" | "/mcp" => list_servers(registry).await,
        other => format!("Unknown command '{}'. Type /help for the list of commands.", other),
    };
    Some(reply)
}

async fn list_tools(registry: &CapabilityRegistry) -> String {
    let capabilities = registry.list().await;
    if capabilities.is_empty() {
        return "No capabilities are registered.".to_string();
    }

    let mut providers: Vec<&str> = capabilities.iter().map(|c| c.provider.as_str()).collect();
    providers.sort_unstable();
    providers.dedup();

    let mut out = format!("{} capabilities:\n", capabilities.len());
    for provider in providers {
        out.push_str(&format!("\n[{}]\n", provider));
        for cap in capabilities.iter().filter(|c| c.provider == provider) {
            let mut flags = String::new();
            if cap.sensitive {
                flags.push_str(" [approval]");
            }
            if !cap.available {
                flags.push_str(" [unavailable]");
            }
            out.push_str(&format!("- {}{}: {}\n", cap.name, flags, cap.description));
        }
    }
    out.trim_end().to_string()
}

async fn list_servers(registry: &CapabilityRegistry) -> String {
    let servers = registry.servers().await;
    if servers.is_empty() {
        return "No capability servers are connected.".to_string();
    }
    let lines: Vec<String> = servers
        .iter()
        .map(|s| {
            format!(
                "- {}: {} ({} capabilities)",
                s.name,
                s.state.as_str(),
                s.capabilities
            )
        })
        .collect();
    format!("Capability servers:\n{}", lines.join("\n"))
}
