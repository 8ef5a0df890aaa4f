//! 路由层类型定义
//!
//! 意图分析的结构化输出：complexity + skip_memory + 追问 / 停止标记 + 相关能力分组。
//! RoutingRecord 为瞬态数据，不写入持久化存储。

use serde::{Deserialize, Serialize};

/// 任务复杂度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// 简单：单步骤，无需规划
    Simple,
    /// 中等：需要少量能力调用，需要规划
    Medium,
    /// 复杂：需要规划和多步骤执行
    Complex,
}

/// 意图分析结果（路由记录）
///
/// 字段始终齐全：分类失败时由调用方回退到保守默认值（Medium + 空分组）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub complexity: Complexity,
    /// 跳过记忆检索（请求与历史无关时的时延优化）
    pub skip_memory: bool,
    #[serde(default)]
    pub is_follow_up: bool,
    /// 用户希望停止 / 取消当前任务
    #[serde(default)]
    pub wants_to_stop: bool,
    /// 语义多选的能力分组（重召回：宁多勿漏，空列表走全量 Fallback）
    #[serde(default)]
    pub relevant_groups: Vec<String>,
}

impl RoutingRecord {
    /// 是否需要规划（从 complexity 推断）
    pub fn needs_plan(&self) -> bool {
        self.complexity != Complexity::Simple
    }

    /// 保守默认值：分类不可用时使用（偏高复杂度、不跳过记忆）
    pub fn conservative_default() -> Self {
        Self {
            complexity: Complexity::Medium,
            skip_memory: false,
            is_follow_up: false,
            wants_to_stop: false,
            relevant_groups: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_plan_from_complexity() {
        let mut record = RoutingRecord::conservative_default();
        assert!(record.needs_plan());
        record.complexity = Complexity::Simple;
        assert!(!record.needs_plan());
    }

    #[test]
    fn test_conservative_default() {
        let record = RoutingRecord::conservative_default();
        assert_eq!(record.complexity, Complexity::Medium);
        assert!(!record.skip_memory);
        assert!(record.relevant_groups.is_empty());
    }
}
