//! 工作记忆：固定容量环形缓冲
//!
//! FIFO 淘汰，纯按新近度，无频率加权；任何写入序列后 len() <= limit。
//! auto_compress 开启时满载不直接丢弃，而是把最旧一半折叠为一条摘要条目（由外部能力生成摘要）。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 条目角色（与对话消息一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    User,
    Assistant,
    System,
}

/// 工作记忆单条记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: EntryRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(EntryRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(EntryRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(EntryRole::System, content)
    }

    fn new(role: EntryRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 环形工作记忆缓冲
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    entries: VecDeque<MemoryEntry>,
    limit: usize,
}

impl WorkingMemory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.max(1)),
            limit: limit.max(1),
        }
    }

    /// 写入一条记录；超容时 FIFO 淘汰最旧条目
    pub fn push(&mut self, entry: MemoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// 写入一条记录；若缓冲已满，先用 summary 替换最旧一半（压缩优先于丢弃）
    ///
    /// summary 为 None 时退化为普通 FIFO 淘汰。
    pub fn push_compressed(&mut self, entry: MemoryEntry, summary: Option<String>) {
        if self.entries.len() + 1 > self.limit {
            if let Some(text) = summary {
                let drain = (self.entries.len() / 2).max(1);
                self.entries.drain(..drain);
                self.entries
                    .push_front(MemoryEntry::system(format!("[摘要] {}", text)));
            }
        }
        self.push(entry);
    }

    /// 最近 n 条记录（供分类 / 推理上下文使用）
    pub fn recent(&self, n: usize) -> Vec<MemoryEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// 待压缩的最旧一半条目（满载且 auto_compress 开启时由调用方先行摘要）
    pub fn oldest_half(&self) -> Vec<MemoryEntry> {
        let take = (self.entries.len() / 2).max(1);
        self.entries.iter().take(take).cloned().collect()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
