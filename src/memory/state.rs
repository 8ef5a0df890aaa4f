//! 会话状态文档：Plan + 工作记忆的唯一属主
//!
//! 其余组件只拿只读视图，或通过 PlanManager 提交变更；
//! 执行循环每轮都从持久化存储重读该文档，宿主进程可在任意两次调用之间中断。

use serde::{Deserialize, Serialize};

use crate::memory::WorkingMemory;
use crate::plan::Plan;

/// 记忆保留策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// 会话结束即清除
    Session,
    /// 按 user_id 隔离，跨会话保留
    User,
    /// 永不自动淘汰
    Persistent,
}

impl RetentionPolicy {
    /// 从配置字符串解析；未知值回退到 session
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => RetentionPolicy::User,
            "persistent" => RetentionPolicy::Persistent,
            _ => RetentionPolicy::Session,
        }
    }
}

/// 可序列化的会话状态快照（持久化存储的 value，按 conversation_id 分区）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub user_id: Option<String>,
    /// 当前 Plan 快照；简单请求不建 Plan 时为 None
    pub plan: Option<Plan>,
    pub working: WorkingMemory,
    pub retention_policy: RetentionPolicy,
}

impl ConversationState {
    pub fn new(
        conversation_id: impl Into<String>,
        working_memory_limit: usize,
        retention_policy: RetentionPolicy,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: None,
            plan: None,
            working: WorkingMemory::new(working_memory_limit),
            retention_policy,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// 会话结束：session 策略清空工作记忆并丢弃 Plan，其余策略只归档 Plan
    pub fn end_conversation(&mut self) {
        self.plan = None;
        if self.retention_policy == RetentionPolicy::Session {
            self.working.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEntry;

    #[test]
    fn test_retention_policy_parse() {
        assert_eq!(RetentionPolicy::parse("user"), RetentionPolicy::User);
        assert_eq!(
            RetentionPolicy::parse("persistent"),
            RetentionPolicy::Persistent
        );
        assert_eq!(RetentionPolicy::parse("unknown"), RetentionPolicy::Session);
    }

    #[test]
    fn test_session_end_clears_session_memory() {
        let mut state = ConversationState::new("c1", 10, RetentionPolicy::Session);
        state.working.push(MemoryEntry::user("hello"));
        state.end_conversation();
        assert!(state.working.is_empty());
        assert!(state.plan.is_none());
    }

    #[test]
    fn test_session_end_keeps_user_memory() {
        let mut state =
            ConversationState::new("c1", 10, RetentionPolicy::User).with_user("u1");
        state.working.push(MemoryEntry::user("hello"));
        state.end_conversation();
        assert_eq!(state.working.len(), 1);
    }
}
