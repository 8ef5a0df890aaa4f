//! 计划管理器
//!
//! 拥有 Plan / Step 生命周期：create（DAG 校验）、ready（依赖图调度）、
//! update（前向状态机 + 落盘后才返回）、replan（纯函数产生新 Plan）。
//! 耐久性契约：每次 update / replan 返回前必须已写入持久化存储——宿主进程
//! 可能在任意两次调用之间中断，必须能从最后一次落盘的快照恢复。

use std::sync::Arc;

use chrono::Utc;

use crate::config::PlanManagerSection;
use crate::core::EngineError;
use crate::memory::{ConversationState, ConversationStore};
use crate::plan::graph;
use crate::plan::types::{Plan, PlanStatus, Step, StepId, StepSpec, StepStatus};

/// 重规划策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplanStrategy {
    /// 丢弃所有未完成步骤，对剩余目标重新分解
    Full,
    /// 保留 completed 步骤原样（同 id 同 result），只重生成 pending / failed
    Incremental,
}

impl ReplanStrategy {
    /// 从配置字符串解析；未知值回退到 incremental
    pub fn parse(s: &str) -> Self {
        match s {
            "full" => ReplanStrategy::Full,
            _ => ReplanStrategy::Incremental,
        }
    }
}

/// 对不可变 Plan 应用重规划，产出新 Plan（不修改入参，便于并发推理与回滚）
///
/// completed 步骤逐字段保留（同 id、同 result）；specs 构成新的剩余步骤，
/// 其依赖可指向已完成步骤；合并后整体重新做 DAG 校验。
pub fn apply_replan(
    plan: &Plan,
    specs: Vec<StepSpec>,
    default_max_retries: u32,
) -> Result<Plan, EngineError> {
    let mut steps: Vec<Step> = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .cloned()
        .collect();
    steps.extend(
        specs
            .into_iter()
            .map(|spec| Step::from_spec(spec, default_max_retries)),
    );
    graph::validate_dag(&steps)?;

    Ok(Plan {
        id: plan.id.clone(),
        source_intent: plan.source_intent.clone(),
        steps,
        status: PlanStatus::Executing,
        created_at: plan.created_at,
        updated_at: Utc::now(),
        replan_count: plan.replan_count + 1,
    })
}

/// 计划管理器：所有 Plan 变更的唯一入口
pub struct PlanManager {
    store: Arc<dyn ConversationStore>,
    config: PlanManagerSection,
}

impl PlanManager {
    pub fn new(store: Arc<dyn ConversationStore>, config: PlanManagerSection) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PlanManagerSection {
        &self.config
    }

    /// 创建 Plan 并落盘，初始状态 planning；步骤集非 DAG 或超出 max_steps 时拒绝
    pub async fn create(
        &self,
        state: &mut ConversationState,
        intent: &str,
        specs: Vec<StepSpec>,
    ) -> Result<(), EngineError> {
        if specs.is_empty() {
            return Err(EngineError::Validation("empty step set".to_string()));
        }
        if specs.len() > self.config.max_steps {
            return Err(EngineError::Validation(format!(
                "{} steps exceeds max_steps {}",
                specs.len(),
                self.config.max_steps
            )));
        }

        let steps: Vec<Step> = specs
            .into_iter()
            .map(|spec| Step::from_spec(spec, self.config.max_retries))
            .collect();
        graph::validate_dag(&steps)?;

        let now = Utc::now();
        let plan = Plan {
            id: uuid::Uuid::new_v4().to_string(),
            source_intent: intent.to_string(),
            steps,
            status: PlanStatus::Planning,
            created_at: now,
            updated_at: now,
            replan_count: 0,
        };
        tracing::info!(plan_id = %plan.id, steps = plan.steps.len(), "plan created");
        state.plan = Some(plan);
        self.store.save(state).await
    }

    /// 就绪步骤集：依赖全部 completed 且自身 pending，创建顺序
    pub fn ready(&self, plan: &Plan) -> Vec<StepId> {
        graph::ready_steps(plan)
    }

    /// 单步变更：前向状态机校验 -> 级联跳过 -> 重算 Plan 状态 -> 落盘后返回
    pub async fn update(
        &self,
        state: &mut ConversationState,
        step_id: &str,
        status: StepStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        let plan = state
            .plan
            .as_mut()
            .ok_or_else(|| EngineError::PlanNotFound(state.conversation_id.clone()))?;

        let step = plan.step_mut(step_id).ok_or_else(|| {
            EngineError::Validation(format!("unknown step id: {}", step_id))
        })?;
        if !StepStatus::can_transition(step.status, status) {
            return Err(EngineError::Validation(format!(
                "illegal transition {:?} -> {:?} for step {}",
                step.status, status, step_id
            )));
        }
        step.status = status;
        if let Some(value) = result {
            step.result = Some(value);
        }

        graph::cascade_skip(plan);
        Self::recompute_status(plan);
        plan.updated_at = Utc::now();
        tracing::debug!(step = step_id, status = ?status, plan_status = ?plan.status, "step updated");

        self.store.save(state).await
    }

    /// 重试计数 +1（同样落盘，重启后重试预算不归零）
    pub async fn record_retry(
        &self,
        state: &mut ConversationState,
        step_id: &str,
    ) -> Result<u32, EngineError> {
        let plan = state
            .plan
            .as_mut()
            .ok_or_else(|| EngineError::PlanNotFound(state.conversation_id.clone()))?;
        let step = plan.step_mut(step_id).ok_or_else(|| {
            EngineError::Validation(format!("unknown step id: {}", step_id))
        })?;
        step.retry_count += 1;
        let count = step.retry_count;
        plan.updated_at = Utc::now();
        self.store.save(state).await?;
        Ok(count)
    }

    /// 重规划触发条件：failed / attempted 超过 failure_threshold
    pub fn needs_replan(&self, plan: &Plan) -> bool {
        if !self.config.replan_enabled {
            return false;
        }
        plan.failure_rate() > self.config.failure_threshold
    }

    /// 应用重规划；超出 max_replan_attempts 时把 Plan 置为 failed 并返回 ReplanExhausted。
    /// 非法的新分解（如环状依赖）返回 Validation，且同样计入尝试预算
    pub async fn replan(
        &self,
        state: &mut ConversationState,
        specs: Vec<StepSpec>,
        strategy: ReplanStrategy,
    ) -> Result<(), EngineError> {
        let plan = state
            .plan
            .as_ref()
            .ok_or_else(|| EngineError::PlanNotFound(state.conversation_id.clone()))?;

        if plan.replan_count >= self.config.max_replan_attempts {
            let attempts = plan.replan_count;
            if let Some(p) = state.plan.as_mut() {
                p.status = PlanStatus::Failed;
                p.updated_at = Utc::now();
            }
            self.store.save(state).await?;
            return Err(EngineError::ReplanExhausted(attempts));
        }

        let new_plan = match apply_replan(plan, specs, self.config.max_retries) {
            Ok(p) => p,
            Err(e) => {
                // 非法的重规划分解同样消耗一次尝试预算并落盘
                if let Some(p) = state.plan.as_mut() {
                    p.replan_count += 1;
                    p.updated_at = Utc::now();
                }
                self.store.save(state).await?;
                return Err(e);
            }
        };
        tracing::info!(
            plan_id = %new_plan.id,
            replan_count = new_plan.replan_count,
            strategy = ?strategy,
            "plan replanned"
        );
        state.plan = Some(new_plan);
        self.store.save(state).await
    }

    /// 取消：刷写部分进度，状态置 cancelled
    pub async fn cancel(&self, state: &mut ConversationState) -> Result<(), EngineError> {
        if let Some(plan) = state.plan.as_mut() {
            plan.status = PlanStatus::Cancelled;
            plan.updated_at = Utc::now();
        }
        self.store.save(state).await
    }

    /// Plan 状态重算：所有步骤 completed / skipped 时整体 completed
    fn recompute_status(plan: &mut Plan) {
        if plan.status.is_terminal() {
            return;
        }
        let all_done = plan.steps.iter().all(|s| {
            matches!(s.status, StepStatus::Completed | StepStatus::Skipped)
        });
        if all_done {
            plan.status = PlanStatus::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConversationStore, RetentionPolicy};

    fn manager() -> (PlanManager, ConversationState) {
        let store = MemoryConversationStore::shared();
        let manager = PlanManager::new(store, PlanManagerSection::default());
        let state = ConversationState::new("c1", 10, RetentionPolicy::Session);
        (manager, state)
    }

    fn three_step_specs() -> Vec<StepSpec> {
        vec![
            StepSpec::new("collect").with_id("a"),
            StepSpec::new("draft").with_id("b").depends_on("a"),
            StepSpec::new("review").with_id("c").depends_on("b"),
        ]
    }

    #[tokio::test]
    async fn test_create_starts_in_planning() {
        let (manager, mut state) = manager();
        manager
            .create(&mut state, "goal", three_step_specs())
            .await
            .unwrap();
        assert_eq!(state.plan.as_ref().unwrap().status, PlanStatus::Planning);
    }

    #[tokio::test]
    async fn test_create_rejects_cycle() {
        let (manager, mut state) = manager();
        let specs = vec![
            StepSpec::new("a").with_id("a").depends_on("b"),
            StepSpec::new("b").with_id("b").depends_on("a"),
        ];
        let err = manager.create(&mut state, "goal", specs).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(state.plan.is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_too_many_steps() {
        let store = MemoryConversationStore::shared();
        let manager = PlanManager::new(
            store,
            PlanManagerSection {
                max_steps: 2,
                ..Default::default()
            },
        );
        let mut state = ConversationState::new("c1", 10, RetentionPolicy::Session);
        let err = manager
            .create(&mut state, "goal", three_step_specs())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_flushes_before_returning() {
        let store = MemoryConversationStore::shared();
        let manager = PlanManager::new(store.clone(), PlanManagerSection::default());
        let mut state = ConversationState::new("c1", 10, RetentionPolicy::Session);
        manager
            .create(&mut state, "goal", three_step_specs())
            .await
            .unwrap();

        manager
            .update(&mut state, "a", StepStatus::InProgress, None)
            .await
            .unwrap();
        manager
            .update(
                &mut state,
                "a",
                StepStatus::Completed,
                Some(serde_json::json!({"out": 1})),
            )
            .await
            .unwrap();

        // 从存储重读，模拟进程重启后的恢复
        let restored = store.load("c1").await.unwrap().unwrap();
        let plan = restored.plan.unwrap();
        assert_eq!(plan.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(
            plan.step("a").unwrap().result,
            Some(serde_json::json!({"out": 1}))
        );
    }

    #[tokio::test]
    async fn test_update_rejects_regression_from_completed() {
        let (manager, mut state) = manager();
        manager
            .create(&mut state, "goal", three_step_specs())
            .await
            .unwrap();
        manager
            .update(&mut state, "a", StepStatus::InProgress, None)
            .await
            .unwrap();
        manager
            .update(&mut state, "a", StepStatus::Completed, None)
            .await
            .unwrap();
        let err = manager
            .update(&mut state, "a", StepStatus::InProgress, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_plan_completes_when_all_steps_done() {
        let (manager, mut state) = manager();
        manager
            .create(&mut state, "goal", three_step_specs())
            .await
            .unwrap();
        for id in ["a", "b", "c"] {
            manager
                .update(&mut state, id, StepStatus::InProgress, None)
                .await
                .unwrap();
            manager
                .update(&mut state, id, StepStatus::Completed, None)
                .await
                .unwrap();
        }
        assert_eq!(state.plan.as_ref().unwrap().status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_step_cascades_skip_and_counts_completed() {
        let (manager, mut state) = manager();
        manager
            .create(&mut state, "goal", three_step_specs())
            .await
            .unwrap();
        manager
            .update(&mut state, "a", StepStatus::InProgress, None)
            .await
            .unwrap();
        manager
            .update(&mut state, "a", StepStatus::Failed, None)
            .await
            .unwrap();
        let plan = state.plan.as_ref().unwrap();
        // b、c 级联跳过，但 Plan 不是 completed（存在 failed 步骤时由引擎决定重规划）
        assert_eq!(plan.step("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(plan.step("c").unwrap().status, StepStatus::Skipped);
        assert_ne!(plan.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn test_incremental_replan_preserves_completed_verbatim() {
        let (manager, mut state) = manager();
        manager
            .create(&mut state, "goal", three_step_specs())
            .await
            .unwrap();
        manager
            .update(&mut state, "a", StepStatus::InProgress, None)
            .await
            .unwrap();
        manager
            .update(
                &mut state,
                "a",
                StepStatus::Completed,
                Some(serde_json::json!({"answer": 42})),
            )
            .await
            .unwrap();

        let before = serde_json::to_string(state.plan.as_ref().unwrap().step("a").unwrap()).unwrap();

        let specs = vec![
            StepSpec::new("draft v2").with_id("b2").depends_on("a"),
            StepSpec::new("review v2").with_id("c2").depends_on("b2"),
        ];
        manager
            .replan(&mut state, specs, ReplanStrategy::Incremental)
            .await
            .unwrap();

        let plan = state.plan.as_ref().unwrap();
        assert_eq!(plan.replan_count, 1);
        // 完成步骤跨重规划边界逐字节一致
        let after = serde_json::to_string(plan.step("a").unwrap()).unwrap();
        assert_eq!(before, after);
        assert!(plan.step("b").is_none());
        assert_eq!(plan.step("b2").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_replan_budget_exhaustion_fails_plan() {
        // 场景 E：max_replan_attempts=2，两次重规划后第三次直接 failed
        let (manager, mut state) = manager();
        manager
            .create(&mut state, "goal", three_step_specs())
            .await
            .unwrap();
        for round in 0..2 {
            let specs = vec![StepSpec::new(format!("retry {}", round))
                .with_id(format!("r{}", round))];
            manager
                .replan(&mut state, specs, ReplanStrategy::Full)
                .await
                .unwrap();
        }
        let err = manager
            .replan(
                &mut state,
                vec![StepSpec::new("one more").with_id("x")],
                ReplanStrategy::Full,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ReplanExhausted(2)));
        assert_eq!(state.plan.as_ref().unwrap().status, PlanStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_replan_consumes_attempt() {
        let store = MemoryConversationStore::shared();
        let manager = PlanManager::new(store.clone(), PlanManagerSection::default());
        let mut state = ConversationState::new("c1", 10, RetentionPolicy::Session);
        manager
            .create(&mut state, "goal", three_step_specs())
            .await
            .unwrap();

        // 环状的新分解被拒绝，但预算照常扣减并落盘
        let specs = vec![
            StepSpec::new("x").with_id("x").depends_on("y"),
            StepSpec::new("y").with_id("y").depends_on("x"),
        ];
        let err = manager
            .replan(&mut state, specs, ReplanStrategy::Incremental)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(state.plan.as_ref().unwrap().replan_count, 1);

        let restored = store.load("c1").await.unwrap().unwrap();
        assert_eq!(restored.plan.unwrap().replan_count, 1);
    }

    #[tokio::test]
    async fn test_failure_rate_trigger() {
        // 场景 B：threshold=0.3，4 个已尝试步骤 2 个失败（rate 0.5）触发重规划
        let (manager, mut state) = manager();
        let specs = vec![
            StepSpec::new("a").with_id("a"),
            StepSpec::new("b").with_id("b"),
            StepSpec::new("c").with_id("c"),
            StepSpec::new("d").with_id("d"),
        ];
        manager.create(&mut state, "goal", specs).await.unwrap();
        for (id, status) in [
            ("a", StepStatus::Completed),
            ("b", StepStatus::Completed),
            ("c", StepStatus::Failed),
            ("d", StepStatus::Failed),
        ] {
            manager
                .update(&mut state, id, StepStatus::InProgress, None)
                .await
                .unwrap();
            manager.update(&mut state, id, status, None).await.unwrap();
        }
        assert!(manager.needs_replan(state.plan.as_ref().unwrap()));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(ReplanStrategy::parse("full"), ReplanStrategy::Full);
        assert_eq!(
            ReplanStrategy::parse("incremental"),
            ReplanStrategy::Incremental
        );
        assert_eq!(ReplanStrategy::parse("??"), ReplanStrategy::Incremental);
    }
}
