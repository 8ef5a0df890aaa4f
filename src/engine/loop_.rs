//! 执行主循环
//!
//! idle -> planning -> executing -> {replanning | completed | failed | cancelled} 的可恢复状态机。
//! 每轮迭代都从持久化存储重读 Plan / Memory 快照，从不信任进程内对上一轮的记忆——
//! 宿主进程可能在任意两轮之间重启，全部控制状态必须能仅凭落盘快照重建。
//! 循环体：Reason（选择能力 + 推理提议）-> Act（能力调用，挂起点）-> Observe ->
//! Validate（成功谓词，失败计入重试）-> Update（经 PlanManager 串行落盘）。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityExecutor, CapabilityRegistry, ToolSelector};
use crate::config::AgentConfig;
use crate::core::{EngineError, RecoveryAction};
use crate::engine::events::{send_event, ProgressEvent, ProgressEventKind};
use crate::memory::{ConversationState, ConversationStore, MemoryEntry, RetentionPolicy};
use crate::plan::{Plan, PlanManager, PlanStatus, ReplanStrategy, Step, StepId, StepSpec, StepStatus};
use crate::reasoner::Reasoner;
use crate::routing::{IntentClassifier, RoutingRecord};

/// 引擎阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Planning,
    Executing,
    Replanning,
    Completed,
    Failed,
    Cancelled,
}

/// 单轮处理结果：终态阶段 + 回复 + 已完成 / 未完成步骤清单
///
/// failed / cancelled 也携带进度摘要，部分进展从不静默丢弃。
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub phase: EnginePhase,
    pub response: String,
    pub completed_steps: Vec<StepId>,
    pub incomplete_steps: Vec<StepId>,
}

/// 单步 Act / Observe 结果（并行阶段产出，Update 阶段串行消费）
struct StepOutcome {
    step_id: StepId,
    observation: Result<serde_json::Value, EngineError>,
}

/// 编排引擎：组合分类器、计划管理器、选择器、执行器与持久化存储
pub struct Engine {
    config: AgentConfig,
    store: Arc<dyn ConversationStore>,
    plan_manager: PlanManager,
    selector: ToolSelector,
    executor: CapabilityExecutor,
    classifier: IntentClassifier,
    reasoner: Arc<dyn Reasoner>,
    /// 跨批次约束工具并发（开并行时生效）
    tool_semaphore: Arc<Semaphore>,
    event_tx: Option<UnboundedSender<ProgressEvent>>,
}

impl Engine {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn ConversationStore>,
        registry: Arc<CapabilityRegistry>,
        reasoner: Arc<dyn Reasoner>,
    ) -> Self {
        let plan_manager = PlanManager::new(store.clone(), config.plan_manager.clone());
        let selector = ToolSelector::new(registry, &config.tool_selector);
        let executor = CapabilityExecutor::new(config.engine.step_timeout_secs);
        let classifier = IntentClassifier::new(reasoner.clone(), config.intent_analyzer.clone());
        let tool_semaphore = Arc::new(Semaphore::new(
            config.tool_selector.max_parallel_tools.max(1),
        ));
        Self {
            config,
            store,
            plan_manager,
            selector,
            executor,
            classifier,
            reasoner,
            tool_semaphore,
            event_tx: None,
        }
    }

    /// 设置进度事件通道
    pub fn with_event_tx(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 处理一轮用户输入：分类 -> （取消 | 直接执行 | 建计划）-> 驱动执行循环
    pub async fn handle_turn(
        &self,
        conversation_id: &str,
        utterance: &str,
        cancel_token: CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let mut state = self.load_or_init(conversation_id).await?;
        self.remember(&mut state, MemoryEntry::user(utterance)).await;
        self.store.save(&state).await?;

        let context = state.working.recent(8);
        let record = self.classifier.classify(utterance, &context).await;
        tracing::info!(
            conversation = conversation_id,
            complexity = ?record.complexity,
            wants_to_stop = record.wants_to_stop,
            groups = ?record.relevant_groups,
            "intent classified"
        );

        // 任意状态 -> cancelled：停止派发，刷写部分进度
        if record.wants_to_stop || cancel_token.is_cancelled() {
            return self.cancel_turn(&mut state).await;
        }

        // simple 请求绕过 PlanManager：单次直接动作，不建 Plan
        if !record.needs_plan() {
            return self.direct_action(&mut state, utterance, &record).await;
        }

        // planning：无计划或上一个计划已终结时重新分解
        let needs_new_plan = state
            .plan
            .as_ref()
            .map(|p| p.status.is_terminal())
            .unwrap_or(true);
        if needs_new_plan {
            // 非法分解（环状依赖、步骤超限等）不上抛：重新请求分解，
            // 与重规划共用 max_replan_attempts 预算，耗尽返回 failed 终态
            let mut rejected: u32 = 0;
            loop {
                let goal = self.build_goal(&state, utterance, &record);
                let specs = self
                    .reasoner
                    .decompose(&goal, &[], &self.config.plan_manager.granularity)
                    .await
                    .map_err(EngineError::Reasoner)?;
                match self.plan_manager.create(&mut state, utterance, specs).await {
                    Ok(()) => break,
                    Err(e) if e.recovery_action() == RecoveryAction::Replan => {
                        rejected += 1;
                        tracing::warn!(
                            error = %e,
                            rejected,
                            "decomposition rejected, requesting a fresh one"
                        );
                        if rejected > self.config.plan_manager.max_replan_attempts {
                            return Ok(TurnOutcome {
                                phase: EnginePhase::Failed,
                                response: format!("规划失败: {}", e),
                                completed_steps: Vec::new(),
                                incomplete_steps: Vec::new(),
                            });
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.run_plan(conversation_id, &record, cancel_token).await
    }

    /// 执行循环主体：直到 Plan 进入终态或迭代预算耗尽
    async fn run_plan(
        &self,
        conversation_id: &str,
        record: &RoutingRecord,
        cancel_token: CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        for _ in 0..self.config.engine.max_turns {
            // 关键不变量：每轮重读落盘快照，不依赖进程内状态
            let mut state = self.load_existing(conversation_id).await?;

            // 循环顶轮询取消
            if cancel_token.is_cancelled() {
                return self.cancel_turn(&mut state).await;
            }

            let mut plan = state
                .plan
                .clone()
                .ok_or_else(|| EngineError::PlanNotFound(conversation_id.to_string()))?;

            // planning -> executing：首次进入循环时落盘推进
            if plan.status == PlanStatus::Planning {
                if let Some(p) = state.plan.as_mut() {
                    p.status = PlanStatus::Executing;
                    p.updated_at = chrono::Utc::now();
                }
                self.store.save(&state).await?;
                plan.status = PlanStatus::Executing;
            }

            match plan.status {
                PlanStatus::Completed => return self.complete_turn(&mut state).await,
                PlanStatus::Failed => return Ok(Self::outcome(&plan, EnginePhase::Failed)),
                PlanStatus::Cancelled => return Ok(Self::outcome(&plan, EnginePhase::Cancelled)),
                _ => {}
            }

            // 可派发集：快照里滞留的 in_progress（进程中断后恢复重跑）+ 依赖满足的
            // pending；均按创建顺序，超出并发上限时按创建顺序截断（确定性平局策略）
            let ready = self.plan_manager.ready(&plan);
            let mut batch: Vec<Step> = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::InProgress || ready.contains(&s.id))
                .cloned()
                .collect();
            let limit = if self.config.tool_selector.allow_parallel {
                self.config.tool_selector.max_parallel_tools.max(1)
            } else {
                1
            };
            batch.truncate(limit);

            if batch.is_empty() {
                // 无可派发步骤且未完成：被失败 / 跳过阻塞，进入 replanning
                match self.try_replan(&mut state, record).await? {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                }
            }

            // Reason：为本批步骤收窄能力集；无匹配能力同样触发重规划
            let capabilities = match self.selector.select(&record.relevant_groups) {
                Ok(caps) => caps,
                Err(e) if e.recovery_action() == RecoveryAction::Replan => {
                    tracing::warn!(error = %e, "no capability found, replanning");
                    match self.try_replan(&mut state, record).await? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
                Err(e) => return Err(e),
            };

            // 派发前标记 in_progress（串行落盘）并推送 step_started
            for step in &batch {
                if step.status == StepStatus::Pending {
                    self.plan_manager
                        .update(&mut state, &step.id, StepStatus::InProgress, None)
                        .await?;
                    send_event(
                        &self.event_tx,
                        conversation_id,
                        ProgressEventKind::StepStarted {
                            step_id: step.id.clone(),
                        },
                    );
                }
            }

            // Act / Observe：仅有的挂起点，独立步骤并行，互不修改共享状态
            let acts = batch.iter().map(|step| {
                let caps = capabilities.clone();
                async move {
                    let _permit = self.tool_semaphore.clone().acquire_owned().await.ok();
                    let observation = match self.reasoner.propose(step, &caps).await {
                        Ok(action) => match caps.iter().find(|c| c.name() == action.capability) {
                            Some(cap) => self.executor.execute(cap.as_ref(), action.input).await,
                            None => Err(EngineError::StepExecutionFailed(format!(
                                "proposed capability {} not in admissible set",
                                action.capability
                            ))),
                        },
                        Err(e) => Err(EngineError::Reasoner(e)),
                    };
                    StepOutcome {
                        step_id: step.id.clone(),
                        observation,
                    }
                }
            });
            let outcomes = futures_util::future::join_all(acts).await;

            // 取消后在途 Act 已跑完，但其 Update 被丢弃
            if cancel_token.is_cancelled() {
                return self.cancel_turn(&mut state).await;
            }

            // Validate + Update：唯一允许修改共享状态的阶段，串行执行
            for outcome in outcomes {
                self.apply_outcome(&mut state, outcome).await?;
            }

            // 失败率超阈值进入 replanning
            let needs_replan = state
                .plan
                .as_ref()
                .map(|p| p.status == PlanStatus::Executing && self.plan_manager.needs_replan(p))
                .unwrap_or(false);
            if needs_replan {
                if let Some(outcome) = self.try_replan(&mut state, record).await? {
                    return Ok(outcome);
                }
            }
        }

        // 迭代预算耗尽：带摘要返回当前状态
        let state = self.load_existing(conversation_id).await?;
        let plan = state
            .plan
            .as_ref()
            .ok_or_else(|| EngineError::PlanNotFound(conversation_id.to_string()))?;
        tracing::warn!(max_turns = self.config.engine.max_turns, "turn budget exhausted");
        Ok(Self::outcome(plan, EnginePhase::Executing))
    }

    /// Validate + Update 单步：成功谓词通过则 completed，否则计入重试，耗尽后 failed
    async fn apply_outcome(
        &self,
        state: &mut ConversationState,
        outcome: StepOutcome,
    ) -> Result<(), EngineError> {
        let conversation_id = state.conversation_id.clone();
        let step_id = outcome.step_id;

        // 观察失败或结果不明确时计入重试；可重试与否由 recovery_action 决定
        let reason = match outcome.observation {
            Ok(value) if validate_observation(&value) => {
                let description = state
                    .plan
                    .as_ref()
                    .and_then(|p| p.step(&step_id))
                    .map(|s| s.description.clone())
                    .unwrap_or_default();
                self.plan_manager
                    .update(state, &step_id, StepStatus::Completed, Some(value))
                    .await?;
                self.remember(
                    state,
                    MemoryEntry::system(format!("步骤完成: {}", description)),
                )
                .await;
                self.store.save(state).await?;
                send_event(
                    &self.event_tx,
                    &conversation_id,
                    ProgressEventKind::StepCompleted { step_id },
                );
                return Ok(());
            }
            Ok(_) => "validation failed".to_string(),
            Err(e) if e.recovery_action() == RecoveryAction::RetryStep => e.to_string(),
            Err(e) => return Err(e),
        };

        let retries = self.plan_manager.record_retry(state, &step_id).await?;
        let exhausted = state
            .plan
            .as_ref()
            .and_then(|p| p.step(&step_id))
            .map(|s| s.retries_exhausted())
            .unwrap_or(true);
        if exhausted {
            tracing::warn!(step = %step_id, retries, reason = %reason, "step failed");
            self.plan_manager
                .update(state, &step_id, StepStatus::Failed, None)
                .await?;
            send_event(
                &self.event_tx,
                &conversation_id,
                ProgressEventKind::StepFailed { step_id, reason },
            );
        } else {
            // 留在 in_progress，下一轮迭代重新派发
            tracing::debug!(step = %step_id, retries, reason = %reason, "step retrying");
        }
        Ok(())
    }

    /// replanning：按策略请求重新分解并应用；预算耗尽返回 failed 终态
    ///
    /// 返回 Some(outcome) 表示本轮终结（失败），None 表示重规划成功、回到 executing。
    async fn try_replan(
        &self,
        state: &mut ConversationState,
        record: &RoutingRecord,
    ) -> Result<Option<TurnOutcome>, EngineError> {
        let plan = state
            .plan
            .clone()
            .ok_or_else(|| EngineError::PlanNotFound(state.conversation_id.clone()))?;

        if !self.config.plan_manager.replan_enabled {
            self.fail_plan(state).await?;
            return Ok(Some(Self::outcome(&plan, EnginePhase::Failed)));
        }

        let strategy = ReplanStrategy::parse(&self.config.plan_manager.replan_strategy);
        let goal = self.build_goal(state, &plan.source_intent, record);

        // 非法的新分解消耗一次尝试预算后重新请求，预算由 PlanManager 统一裁决
        loop {
            let snapshot = state
                .plan
                .clone()
                .ok_or_else(|| EngineError::PlanNotFound(state.conversation_id.clone()))?;
            let completed: Vec<Step> = snapshot
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .cloned()
                .collect();
            // full 策略对剩余目标全新分解；incremental 把已完成步骤交给推理方参考
            let completed_view: &[Step] = match strategy {
                ReplanStrategy::Full => &[],
                ReplanStrategy::Incremental => &completed,
            };
            let specs: Vec<StepSpec> = self
                .reasoner
                .decompose(&goal, completed_view, &self.config.plan_manager.granularity)
                .await
                .map_err(EngineError::Reasoner)?;

            match self.plan_manager.replan(state, specs, strategy).await {
                Ok(()) => {
                    let replan_count = state
                        .plan
                        .as_ref()
                        .map(|p| p.replan_count)
                        .unwrap_or_default();
                    send_event(
                        &self.event_tx,
                        &state.conversation_id,
                        ProgressEventKind::PlanReplanned { replan_count },
                    );
                    return Ok(None);
                }
                Err(EngineError::ReplanExhausted(n)) => {
                    tracing::warn!(attempts = n, "replan budget exhausted, plan failed");
                    let failed = state.plan.as_ref().unwrap_or(&plan);
                    return Ok(Some(Self::outcome(failed, EnginePhase::Failed)));
                }
                Err(e) if e.recovery_action() == RecoveryAction::Replan => {
                    tracing::warn!(
                        error = %e,
                        "replan decomposition rejected, requesting a fresh one"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// simple 复杂度：Reason + Act，不建 Plan。分组无匹配时降级到全量能力集，
    /// 可重试的执行失败按 max_retries 预算重试，耗尽返回 failed 终态而非错误
    async fn direct_action(
        &self,
        state: &mut ConversationState,
        utterance: &str,
        record: &RoutingRecord,
    ) -> Result<TurnOutcome, EngineError> {
        let capabilities = match self.selector.select(&record.relevant_groups) {
            Ok(caps) => caps,
            Err(e) if e.recovery_action() == RecoveryAction::Replan => {
                tracing::warn!(error = %e, "no capability matched, falling back to full set");
                self.selector.select_all()
            }
            Err(e) => return Err(e),
        };
        let step = Step::from_spec(
            StepSpec::new(utterance),
            self.config.plan_manager.max_retries,
        );

        let mut failures: u32 = 0;
        let output = loop {
            let observation = match self.reasoner.propose(&step, &capabilities).await {
                Ok(action) => match capabilities.iter().find(|c| c.name() == action.capability) {
                    Some(cap) => self.executor.execute(cap.as_ref(), action.input).await,
                    None => Err(EngineError::StepExecutionFailed(format!(
                        "proposed capability {} not in admissible set",
                        action.capability
                    ))),
                },
                Err(e) => Err(EngineError::Reasoner(e)),
            };
            let reason = match observation {
                Ok(value) if validate_observation(&value) => break value,
                Ok(_) => "validation failed".to_string(),
                Err(e) if e.recovery_action() == RecoveryAction::RetryStep => e.to_string(),
                Err(e) => return Err(e),
            };
            failures += 1;
            if failures > step.max_retries {
                tracing::warn!(failures, reason = %reason, "direct action failed");
                let response = format!("执行失败: {}", reason);
                self.remember(state, MemoryEntry::assistant(response.clone())).await;
                self.store.save(state).await?;
                return Ok(TurnOutcome {
                    phase: EnginePhase::Failed,
                    response,
                    completed_steps: Vec::new(),
                    incomplete_steps: Vec::new(),
                });
            }
            tracing::debug!(failures, reason = %reason, "direct action retrying");
        };

        let response = output.to_string();
        self.remember(state, MemoryEntry::assistant(response.clone())).await;
        self.store.save(state).await?;
        Ok(TurnOutcome {
            phase: EnginePhase::Completed,
            response,
            completed_steps: Vec::new(),
            incomplete_steps: Vec::new(),
        })
    }

    /// 会话结束：归档当前 Plan 并按保留策略处理会话文档。
    /// session 策略整份移除，user / persistent 只丢弃 Plan、保留工作记忆
    pub async fn end_conversation(&self, conversation_id: &str) -> Result<(), EngineError> {
        let Some(mut state) = self.store.load(conversation_id).await? else {
            return Ok(());
        };
        state.end_conversation();
        match state.retention_policy {
            RetentionPolicy::Session => self.store.remove(conversation_id).await,
            _ => self.store.save(&state).await,
        }
    }

    /// completed 终态：推送 plan_completed，摘要写入工作记忆
    async fn complete_turn(
        &self,
        state: &mut ConversationState,
    ) -> Result<TurnOutcome, EngineError> {
        let plan = state
            .plan
            .clone()
            .ok_or_else(|| EngineError::PlanNotFound(state.conversation_id.clone()))?;
        self.remember(state, MemoryEntry::assistant(plan.progress_summary()))
            .await;
        self.store.save(state).await?;
        send_event(
            &self.event_tx,
            &state.conversation_id,
            ProgressEventKind::PlanCompleted {
                plan_id: plan.id.clone(),
            },
        );
        Ok(Self::outcome(&plan, EnginePhase::Completed))
    }

    /// cancelled 终态：刷写部分进度后停止派发
    async fn cancel_turn(
        &self,
        state: &mut ConversationState,
    ) -> Result<TurnOutcome, EngineError> {
        self.plan_manager.cancel(state).await?;
        match state.plan.as_ref() {
            Some(plan) => Ok(Self::outcome(plan, EnginePhase::Cancelled)),
            None => Ok(TurnOutcome {
                phase: EnginePhase::Cancelled,
                response: "已取消。".to_string(),
                completed_steps: Vec::new(),
                incomplete_steps: Vec::new(),
            }),
        }
    }

    async fn fail_plan(&self, state: &mut ConversationState) -> Result<(), EngineError> {
        if let Some(plan) = state.plan.as_mut() {
            plan.status = PlanStatus::Failed;
            plan.updated_at = chrono::Utc::now();
        }
        self.store.save(state).await
    }

    /// 终态回包：进度摘要 + 已完成 / 未完成步骤清单
    fn outcome(plan: &Plan, phase: EnginePhase) -> TurnOutcome {
        TurnOutcome {
            phase,
            response: plan.progress_summary(),
            completed_steps: plan.completed_step_ids(),
            incomplete_steps: plan.incomplete_step_ids(),
        }
    }

    /// 组装分解目标：skip_memory 时不读工作记忆（时延优化）
    fn build_goal(
        &self,
        state: &ConversationState,
        utterance: &str,
        record: &RoutingRecord,
    ) -> String {
        if record.skip_memory {
            return utterance.to_string();
        }
        let recent = state.working.recent(8);
        if recent.is_empty() {
            return utterance.to_string();
        }
        let context: Vec<String> = recent.iter().map(|e| e.content.clone()).collect();
        format!("{}\n\n近期上下文:\n{}", utterance, context.join("\n"))
    }

    /// 写入工作记忆；满载且 auto_compress 开启时先经推理方摘要最旧一半
    async fn remember(&self, state: &mut ConversationState, entry: MemoryEntry) {
        if self.config.memory_manager.auto_compress && state.working.is_full() {
            let oldest = state.working.oldest_half();
            // 摘要失败退化为 FIFO 淘汰，容量上界优先
            let summary = self.reasoner.summarize(&oldest).await.ok();
            state.working.push_compressed(entry, summary);
        } else {
            state.working.push(entry);
        }
    }

    /// 按配置初始化新会话状态
    async fn load_or_init(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationState, EngineError> {
        if let Some(state) = self.store.load(conversation_id).await? {
            return Ok(state);
        }
        Ok(ConversationState::new(
            conversation_id,
            self.config.memory_manager.working_memory_limit,
            RetentionPolicy::parse(&self.config.memory_manager.retention_policy),
        ))
    }

    async fn load_existing(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationState, EngineError> {
        self.store
            .load(conversation_id)
            .await?
            .ok_or_else(|| EngineError::PlanNotFound(conversation_id.to_string()))
    }
}

/// 成功谓词：Null 视为不明确（失败），对象里显式 success=false 视为失败，其余视为成功
pub fn validate_observation(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Object(map) => map
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        _ => true,
    }
}
