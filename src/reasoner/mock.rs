//! 脚本化推理客户端（用于测试，无需外部服务）
//!
//! 分类返回固定文本，分解按预置脚本逐次出队，提议固定选第一个可用能力；
//! 可配置为整体失败，用于验证各处的保守回退路径。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::capability::Capability;
use crate::memory::MemoryEntry;
use crate::plan::{Step, StepSpec};
use crate::reasoner::{ProposedAction, Reasoner};

/// 脚本化客户端：行为完全确定，便于断言编排逻辑
#[derive(Default)]
pub struct ScriptedReasoner {
    classification: Option<String>,
    decompositions: Mutex<VecDeque<Vec<StepSpec>>>,
    /// 提议时指定能力名；None 则用能力集中的第一个
    propose_capability: Option<String>,
    fail_all: bool,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有调用都返回 Err，用于测试回退路径
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// 分类固定返回 raw
    pub fn classifying(raw: &str) -> Self {
        Self {
            classification: Some(raw.to_string()),
            ..Self::default()
        }
    }

    pub fn with_classification(mut self, raw: &str) -> Self {
        self.classification = Some(raw.to_string());
        self
    }

    /// 追加一次分解脚本（按调用顺序出队）
    pub fn with_decomposition(self, specs: Vec<StepSpec>) -> Self {
        self.decompositions.lock().unwrap().push_back(specs);
        self
    }

    pub fn with_propose_capability(mut self, name: &str) -> Self {
        self.propose_capability = Some(name.to_string());
        self
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn classify(
        &self,
        _utterance: &str,
        _context: &[MemoryEntry],
        _task_types: &[String],
        _output_formats: &[String],
    ) -> Result<String, String> {
        if self.fail_all {
            return Err("scripted failure".to_string());
        }
        self.classification
            .clone()
            .ok_or_else(|| "no classification scripted".to_string())
    }

    async fn decompose(
        &self,
        goal: &str,
        _completed: &[Step],
        _granularity: &str,
    ) -> Result<Vec<StepSpec>, String> {
        if self.fail_all {
            return Err("scripted failure".to_string());
        }
        self.decompositions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| format!("no decomposition scripted for goal: {}", goal))
    }

    async fn propose(
        &self,
        step: &Step,
        capabilities: &[Arc<dyn Capability>],
    ) -> Result<ProposedAction, String> {
        if self.fail_all {
            return Err("scripted failure".to_string());
        }
        let capability = match &self.propose_capability {
            Some(name) => name.clone(),
            None => capabilities
                .first()
                .map(|c| c.name().to_string())
                .ok_or_else(|| "empty capability set".to_string())?,
        };
        Ok(ProposedAction {
            capability,
            input: serde_json::json!({ "step": step.description }),
        })
    }

    async fn summarize(&self, entries: &[MemoryEntry]) -> Result<String, String> {
        if self.fail_all {
            return Err("scripted failure".to_string());
        }
        Ok(format!("{} 条历史摘要", entries.len()))
    }
}
