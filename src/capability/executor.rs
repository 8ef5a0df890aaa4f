//! 能力执行器
//!
//! 对每次能力调用施加有界执行预算（超时），超时视为一次失败的 Observe
//! （StepTimeout，计入重试与 failure_rate），绝不升级为引擎级故障；
//! 每次调用输出一条结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::capability::Capability;
use crate::core::EngineError;

/// 能力执行器：超时包装 + 统一错误映射
pub struct CapabilityExecutor {
    timeout: Duration,
}

impl CapabilityExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行指定能力；超时返回 StepTimeout，能力返回 Err 则转为 StepExecutionFailed
    pub async fn execute(
        &self,
        capability: &dyn Capability,
        input: Value,
    ) -> Result<Value, EngineError> {
        let start = Instant::now();
        let input_preview = preview(&input);
        let result = timeout(self.timeout, capability.execute(input)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "capability_audit",
            "capability": capability.name(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "input_preview": input_preview,
        });
        tracing::info!(audit = %audit.to_string(), "capability");

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(EngineError::StepExecutionFailed(format!(
                "{}: {}",
                capability.name(),
                e
            ))),
            Err(_) => Err(EngineError::StepTimeout(capability.name().to_string())),
        }
    }
}

fn preview(input: &Value) -> String {
    let s = input.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SlowCapability;

    #[async_trait]
    impl Capability for SlowCapability {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps longer than the budget"
        }

        fn groups(&self) -> &[String] {
            &[]
        }

        async fn execute(&self, _input: Value) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct FailingCapability;

    #[async_trait]
    impl Capability for FailingCapability {
        fn name(&self) -> &str {
            "failing"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        fn groups(&self) -> &[String] {
            &[]
        }

        async fn execute(&self, _input: Value) -> Result<Value, String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_step_timeout() {
        let executor = CapabilityExecutor::new(1);
        let err = executor
            .execute(&SlowCapability, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepTimeout(_)));
    }

    #[tokio::test]
    async fn test_failure_maps_to_step_execution_failed() {
        let executor = CapabilityExecutor::new(1);
        let err = executor
            .execute(&FailingCapability, Value::Null)
            .await
            .unwrap_err();
        match err {
            EngineError::StepExecutionFailed(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
