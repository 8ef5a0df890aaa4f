//! 计划类型定义
//!
//! Plan / Step 数据模型与状态机。状态只前进：pending -> in_progress -> {completed|failed}，
//! completed / failed / skipped 为终态，不允许回退。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type StepId = String;

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 等待依赖满足
    Pending,
    /// 正在执行
    InProgress,
    /// 已完成
    Completed,
    /// 重试耗尽后失败
    Failed,
    /// 跳过（依赖失败，级联）
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// 前向状态机校验；InProgress -> InProgress 允许（重试计数）
    pub fn can_transition(from: StepStatus, to: StepStatus) -> bool {
        match (from, to) {
            (StepStatus::Pending, StepStatus::InProgress) => true,
            (StepStatus::Pending, StepStatus::Skipped) => true,
            (StepStatus::InProgress, StepStatus::InProgress) => true,
            (StepStatus::InProgress, StepStatus::Completed) => true,
            (StepStatus::InProgress, StepStatus::Failed) => true,
            _ => false,
        }
    }
}

/// 计划状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

/// 推理方产出的步骤描述（分解 / 重规划的输入）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// 显式 id；缺省时由 PlanManager 分配
    #[serde(default)]
    pub id: Option<StepId>,
    pub description: String,
    /// 依赖的步骤 id（可指向本批 spec 或已完成步骤）
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl StepSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: None,
            description: description.into(),
            dependencies: Vec::new(),
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<StepId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn depends_on(mut self, dep: impl Into<StepId>) -> Self {
        self.dependencies.push(dep.into());
        self
    }
}

/// 原子工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub description: String,
    pub dependencies: Vec<StepId>,
    pub status: StepStatus,
    /// 不透明结果载荷；能力输出原样保存
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Step {
    pub fn from_spec(spec: StepSpec, default_max_retries: u32) -> Self {
        Self {
            id: spec
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            description: spec.description,
            dependencies: spec.dependencies,
            status: StepStatus::Pending,
            result: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
        }
    }

    /// max_retries 指首次执行之外的重试次数，总尝试数为 max_retries + 1
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }
}

/// 用户请求的结构化分解
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    /// 触发规划的原始意图
    pub source_intent: String,
    /// 创建顺序即调度平局顺序
    pub steps: Vec<Step>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub replan_count: u32,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// 已尝试的步骤数（进入过终态的 completed / failed / skipped-因依赖失败不计）
    pub fn attempted(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Failed))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count()
    }

    /// failed / attempted；无已尝试步骤时为 0
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.attempted();
        if attempted == 0 {
            return 0.0;
        }
        self.failed() as f64 / attempted as f64
    }

    pub fn completed_step_ids(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn incomplete_step_ids(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    /// 进度摘要（Markdown 勾选列表），用于终态回包与提示词注入
    pub fn progress_summary(&self) -> String {
        let total = self.steps.len();
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let mut lines = vec![format!("进度: {}/{}", completed, total)];
        for step in &self.steps {
            let mark = match step.status {
                StepStatus::Completed => "[x]",
                StepStatus::Skipped => "[-]",
                StepStatus::Failed => "[!]",
                _ => "[ ]",
            };
            lines.push(format!("- {} {}", mark, step.description));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        use StepStatus::*;
        assert!(StepStatus::can_transition(Pending, InProgress));
        assert!(StepStatus::can_transition(InProgress, Completed));
        assert!(StepStatus::can_transition(InProgress, Failed));
        assert!(StepStatus::can_transition(Pending, Skipped));
        // 不允许从终态回退
        assert!(!StepStatus::can_transition(Completed, InProgress));
        assert!(!StepStatus::can_transition(Completed, Pending));
        assert!(!StepStatus::can_transition(Failed, Pending));
        assert!(!StepStatus::can_transition(Skipped, InProgress));
        // 不允许越级
        assert!(!StepStatus::can_transition(Pending, Completed));
    }

    #[test]
    fn test_retry_budget_excludes_first_attempt() {
        let mut step = Step::from_spec(StepSpec::new("a").with_id("a"), 2);
        // 首次执行失败不计入重试预算
        step.retry_count = 2;
        assert!(!step.retries_exhausted());
        step.retry_count = 3;
        assert!(step.retries_exhausted());
    }

    #[test]
    fn test_failure_rate() {
        let mut plan = Plan {
            id: "p1".into(),
            source_intent: "test".into(),
            steps: vec![
                Step::from_spec(StepSpec::new("a").with_id("a"), 2),
                Step::from_spec(StepSpec::new("b").with_id("b"), 2),
                Step::from_spec(StepSpec::new("c").with_id("c"), 2),
                Step::from_spec(StepSpec::new("d").with_id("d"), 2),
            ],
            status: PlanStatus::Executing,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            replan_count: 0,
        };
        assert_eq!(plan.failure_rate(), 0.0);
        plan.step_mut("a").unwrap().status = StepStatus::Completed;
        plan.step_mut("b").unwrap().status = StepStatus::Completed;
        plan.step_mut("c").unwrap().status = StepStatus::Failed;
        plan.step_mut("d").unwrap().status = StepStatus::Failed;
        assert!((plan.failure_rate() - 0.5).abs() < f64::EPSILON);
    }
}
