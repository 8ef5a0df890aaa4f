//! 推理调用抽象
//!
//! 非确定性的「提议下一步动作」被收窄为一个小接口：分类、分解、提议、摘要。
//! 确定性的编排逻辑（调度 / 状态机）与外部托管的推理调用由此解耦，测试中可完全 Mock。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::memory::MemoryEntry;
use crate::plan::{Step, StepSpec};

/// 推理方提议的动作：调用哪个能力、用什么输入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub capability: String,
    pub input: serde_json::Value,
}

/// 推理客户端 trait：所有方法返回 Err(String) 表示调用失败，由调用方决定回退
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// 意图分类：返回原始输出（JSON 文本），解析由 IntentClassifier 负责
    ///
    /// task_types / output_formats 注入分类提示词，空则用推理方默认。
    async fn classify(
        &self,
        utterance: &str,
        context: &[MemoryEntry],
        task_types: &[String],
        output_formats: &[String],
    ) -> Result<String, String>;

    /// 目标分解：为剩余目标产出步骤集；completed 供增量重规划参考
    async fn decompose(
        &self,
        goal: &str,
        completed: &[Step],
        granularity: &str,
    ) -> Result<Vec<StepSpec>, String>;

    /// 为单个步骤在给定能力集内提议动作
    async fn propose(
        &self,
        step: &Step,
        capabilities: &[Arc<dyn Capability>],
    ) -> Result<ProposedAction, String>;

    /// 摘要一组记忆条目（auto_compress 用）
    async fn summarize(&self, entries: &[MemoryEntry]) -> Result<String, String>;
}
