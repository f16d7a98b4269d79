//! 文件检查点：`<dir>/<编码后的 thread_id>.json`，写入时先写 `.tmp` 再 rename

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::Checkpointer;
use crate::core::{CheckpointError, ConversationState};

#[derive(Debug, Clone)]
pub struct FileCheckpointer {
    dir: PathBuf,
}

impl FileCheckpointer {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// thread_id 中非 [A-Za-z0-9-] 的字节编码为 `_XX`（含 '_' 本身），一一对应且不含路径分隔符
    fn path_for(&self, thread_id: &str) -> PathBuf {
        let mut name = String::with_capacity(thread_id.len());
        for byte in thread_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(char::from(byte));
            } else {
                name.push_str(&format!("_{:02X}", byte));
            }
        }
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn save(&self, state: &ConversationState) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&state.thread_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(thread_id = %state.thread_id, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, CheckpointError> {
        let path = self.path_for(thread_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: ConversationState = serde_json::from_slice(&data)?;
        Ok((state.thread_id == thread_id).then_some(state))
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(data) => match serde_json::from_slice::<ConversationState>(&data) {
                    Ok(state) => ids.push(state.thread_id),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint")
                    }
                },
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, CheckpointError> {
        match tokio::fs::remove_file(self.path_for(thread_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}
