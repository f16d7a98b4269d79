//! 线程占用守卫：同一 thread_id 同一时刻只允许一个请求在处理
//!
//! 第二个并发请求直接得到 ThreadBusy（不排队、不交错）；ThreadPermit 被 drop 时释放。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::core::AgentError;

#[derive(Clone, Default)]
pub struct ThreadGuard {
    active: Arc<Mutex<HashSet<String>>>,
}

/// 持有期间该线程被占用
pub struct ThreadPermit {
    active: Arc<Mutex<HashSet<String>>>,
    thread_id: String,
}

impl ThreadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, thread_id: &str) -> Result<ThreadPermit, AgentError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(thread_id.to_string()) {
            tracing::warn!(thread_id, "rejecting concurrent request for busy thread");
            return Err(AgentError::ThreadBusy(thread_id.to_string()));
        }
        Ok(ThreadPermit {
            active: self.active.clone(),
            thread_id: thread_id.to_string(),
        })
    }
}

impl Drop for ThreadPermit {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected_until_release() {
        let guard = ThreadGuard::new();
        let permit = guard.acquire("t1").unwrap();
        assert!(matches!(guard.acquire("t1"), Err(AgentError::ThreadBusy(_))));
        assert!(guard.acquire("t2").is_ok());
        drop(permit);
        assert!(guard.acquire("t1").is_ok());
    }
}
