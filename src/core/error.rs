//! 引擎错误类型与恢复动作
//!
//! 执行循环的恢复决策统一经 recovery_action() 路由：Validation / NoCapabilityFound
//! 触发重规划，StepTimeout / StepExecutionFailed / Reasoner 计入重试，
//! 其余错误终结当前 Plan。用户取消不走错误通道，直接体现为 cancelled 计划状态。

use thiserror::Error;

/// 编排引擎运行过程中可能出现的错误（计划校验、能力选择、步骤执行、存储等）
#[derive(Error, Debug)]
pub enum EngineError {
    /// 计划非法：循环依赖、悬空依赖、步骤数超限等
    #[error("Validation error: {0}")]
    Validation(String),

    /// 没有任何能力匹配 relevant_groups（可通过重规划恢复，非致命）
    #[error("No capability found for groups: {0}")]
    NoCapabilityFound(String),

    #[error("Step timeout: {0}")]
    StepTimeout(String),

    #[error("Step execution failed: {0}")]
    StepExecutionFailed(String),

    /// 重规划次数用尽，Plan 进入 failed
    #[error("Replan attempts exhausted after {0} tries")]
    ReplanExhausted(u32),

    /// 持久化存储读写失败
    #[error("Store error: {0}")]
    Store(String),

    /// 外部推理调用失败
    #[error("Reasoner error: {0}")]
    Reasoner(String),

    #[error("Plan not found for conversation: {0}")]
    PlanNotFound(String),
}

/// 根据错误类型给出的恢复动作，由执行循环消费
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 触发重规划（计划非法 / 无可用能力）
    Replan,
    /// 步骤级重试（超时 / 执行失败，受 max_retries 约束）
    RetryStep,
    /// 终止当前 Plan，带上已完成 / 未完成摘要
    Abort,
}

impl EngineError {
    /// 将错误映射为恢复动作
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            EngineError::Validation(_) | EngineError::NoCapabilityFound(_) => {
                RecoveryAction::Replan
            }
            EngineError::StepTimeout(_)
            | EngineError::StepExecutionFailed(_)
            | EngineError::Reasoner(_) => RecoveryAction::RetryStep,
            _ => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_triggers_replan() {
        let err = EngineError::Validation("cycle".to_string());
        assert_eq!(err.recovery_action(), RecoveryAction::Replan);
    }

    #[test]
    fn test_no_capability_triggers_replan() {
        let err = EngineError::NoCapabilityFound("writing".to_string());
        assert_eq!(err.recovery_action(), RecoveryAction::Replan);
    }

    #[test]
    fn test_timeout_triggers_retry() {
        let err = EngineError::StepTimeout("search".to_string());
        assert_eq!(err.recovery_action(), RecoveryAction::RetryStep);
    }

    #[test]
    fn test_reasoner_failure_triggers_retry() {
        let err = EngineError::Reasoner("llm unavailable".to_string());
        assert_eq!(err.recovery_action(), RecoveryAction::RetryStep);
    }

    #[test]
    fn test_replan_exhausted_aborts() {
        let err = EngineError::ReplanExhausted(2);
        assert_eq!(err.recovery_action(), RecoveryAction::Abort);
    }
}
