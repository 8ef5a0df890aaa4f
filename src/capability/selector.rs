//! 工具 / 技能选择器
//!
//! 根据 RoutingRecord 的 relevant_groups 与当前步骤，按策略产出可用能力集：
//! capability_based 精确标签匹配，priority_based 按优先级截断，all 全量兜底。
//! base_tools 无论何种策略都附加（如取消检查）；全部分组无匹配时返回 NoCapabilityFound，
//! 由执行循环作为重规划触发条件处理，而非致命错误。

use std::collections::HashSet;
use std::sync::Arc;

use crate::capability::{Capability, CapabilityRegistry};
use crate::config::ToolSelectorSection;
use crate::core::EngineError;

/// 选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// 精确标签匹配
    CapabilityBased,
    /// 按优先级排序并截断
    PriorityBased,
    /// 全量注册表（兜底，代价高，仅用于未分类 / 简单请求）
    All,
}

impl SelectionStrategy {
    /// 从配置字符串解析；未知值回退到 capability_based
    pub fn parse(s: &str) -> Self {
        match s {
            "priority_based" => SelectionStrategy::PriorityBased,
            "all" => SelectionStrategy::All,
            _ => SelectionStrategy::CapabilityBased,
        }
    }
}

/// 工具选择器
pub struct ToolSelector {
    registry: Arc<CapabilityRegistry>,
    strategy: SelectionStrategy,
    base_tools: Vec<String>,
    max_selected: usize,
}

impl ToolSelector {
    pub fn new(registry: Arc<CapabilityRegistry>, config: &ToolSelectorSection) -> Self {
        Self {
            registry,
            strategy: SelectionStrategy::parse(&config.selection_strategy),
            base_tools: config.base_tools.clone(),
            max_selected: config.max_selected,
        }
    }

    /// 产出当前步骤的可用能力集
    ///
    /// relevant_groups 为空时退化为 all 策略（Fallback 全量注入，宁多勿漏）。
    pub fn select(
        &self,
        relevant_groups: &[String],
    ) -> Result<Vec<Arc<dyn Capability>>, EngineError> {
        let mut selected = match self.strategy {
            SelectionStrategy::All => self.registry.all(),
            _ if relevant_groups.is_empty() => self.registry.all(),
            SelectionStrategy::CapabilityBased => {
                let matched = self.filter_by_groups(relevant_groups);
                if matched.is_empty() {
                    return Err(EngineError::NoCapabilityFound(
                        relevant_groups.join(", "),
                    ));
                }
                matched
            }
            SelectionStrategy::PriorityBased => {
                let mut matched = self.filter_by_groups(relevant_groups);
                if matched.is_empty() {
                    return Err(EngineError::NoCapabilityFound(
                        relevant_groups.join(", "),
                    ));
                }
                matched.sort_by_key(|c| std::cmp::Reverse(c.priority()));
                matched.truncate(self.max_selected);
                matched
            }
        };

        self.append_base_tools(&mut selected);
        Ok(selected)
    }

    /// 全量兜底集（含 base_tools）：无分组匹配时的降级入口
    pub fn select_all(&self) -> Vec<Arc<dyn Capability>> {
        let mut selected = self.registry.all();
        self.append_base_tools(&mut selected);
        selected
    }

    /// 精确标签匹配：能力任一分组命中任一 relevant_group 即保留
    fn filter_by_groups(&self, groups: &[String]) -> Vec<Arc<dyn Capability>> {
        self.registry
            .all()
            .into_iter()
            .filter(|c| c.groups().iter().any(|g| groups.contains(g)))
            .collect()
    }

    /// base_tools 始终附加并去重
    fn append_base_tools(&self, selected: &mut Vec<Arc<dyn Capability>>) {
        let present: HashSet<String> =
            selected.iter().map(|c| c.name().to_string()).collect();
        for name in &self.base_tools {
            if present.contains(name) {
                continue;
            }
            match self.registry.get(name) {
                Some(cap) => selected.push(cap),
                None => tracing::warn!(tool = %name, "base tool not registered"),
            }
        }
    }
}
