//! 会话状态持久化
//!
//! KV 风格读写：value 为整份 ConversationState JSON 文档，key 为 conversation_id。
//! 按会话分区，跨会话无共享锁；具体存储技术对引擎透明。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::EngineError;
use crate::memory::ConversationState;

/// 持久化边界：load / save / remove，按 conversation_id 寻址
///
/// save 返回即视为已落盘——PlanManager 的耐久性契约依赖这一点。
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>, EngineError>;

    async fn save(&self, state: &ConversationState) -> Result<(), EngineError>;

    async fn remove(&self, conversation_id: &str) -> Result<(), EngineError>;
}

/// 文件存储：每个会话一个 JSON 文件，父目录自动创建
///
/// user 级数据放在 users/{user_id}/ 子目录下，结构上避免跨用户争用。
#[derive(Debug)]
pub struct FileConversationStore {
    root: PathBuf,
}

impl FileConversationStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, conversation_id: &str, user_id: Option<&str>) -> PathBuf {
        match user_id {
            Some(uid) => self
                .root
                .join("users")
                .join(uid)
                .join(format!("{}.json", conversation_id)),
            None => self.root.join(format!("{}.json", conversation_id)),
        }
    }

    fn find(&self, conversation_id: &str) -> Option<PathBuf> {
        let direct = self.path_for(conversation_id, None);
        if direct.exists() {
            return Some(direct);
        }
        let users = self.root.join("users");
        let entries = std::fs::read_dir(&users).ok()?;
        for entry in entries.flatten() {
            let candidate = entry.path().join(format!("{}.json", conversation_id));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>, EngineError> {
        let Some(path) = self.find(conversation_id) else {
            return Ok(None);
        };
        let data = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| EngineError::Store(format!("read {}: {}", path.display(), e)))?;
        let state = serde_json::from_str(&data)
            .map_err(|e| EngineError::Store(format!("decode {}: {}", path.display(), e)))?;
        Ok(Some(state))
    }

    async fn save(&self, state: &ConversationState) -> Result<(), EngineError> {
        let path = self.path_for(&state.conversation_id, state.user_id.as_deref());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::Store(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        let data = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::Store(format!("encode: {}", e)))?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| EngineError::Store(format!("write {}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn remove(&self, conversation_id: &str) -> Result<(), EngineError> {
        if let Some(path) = self.find(conversation_id) {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| EngineError::Store(format!("remove {}: {}", path.display(), e)))?;
        }
        Ok(())
    }
}

/// 内存存储：测试与单进程场景使用；语义与文件实现一致（save 即「落盘」）
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    states: RwLock<HashMap<String, ConversationState>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>, EngineError> {
        Ok(self.states.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<(), EngineError> {
        self.states
            .write()
            .await
            .insert(state.conversation_id.clone(), state.clone());
        Ok(())
    }

    async fn remove(&self, conversation_id: &str) -> Result<(), EngineError> {
        self.states.write().await.remove(conversation_id);
        Ok(())
    }
}
