//! Hive - 对话智能体的计划 / 记忆 / 执行编排引擎
//!
//! 入口：初始化日志，装配演示能力与规则推理方，进入 REPL 循环。

use std::io::{BufRead, Write as _};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use hive::capability::{Capability, CapabilityRegistry};
use hive::memory::{FileConversationStore, MemoryEntry};
use hive::plan::{Step, StepSpec};
use hive::reasoner::{ProposedAction, Reasoner};
use hive::{load_config, Engine};

/// 回显能力（演示用）
struct EchoCapability {
    groups: Vec<String>,
}

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "原样返回输入"
    }

    fn groups(&self) -> &[String] {
        &self.groups
    }

    async fn execute(&self, input: Value) -> Result<Value, String> {
        Ok(serde_json::json!({ "success": true, "echo": input }))
    }
}

/// 规则推理方（演示用，无外部服务）
///
/// 含「然后 / ；」的输入视为 complex 并按其切分为顺序步骤，否则 simple；
/// 提议固定选能力集中的第一个。
struct RuleReasoner;

#[async_trait]
impl Reasoner for RuleReasoner {
    async fn classify(
        &self,
        utterance: &str,
        _context: &[MemoryEntry],
        _task_types: &[String],
        _output_formats: &[String],
    ) -> Result<String, String> {
        let complexity = if utterance.contains("然后") || utterance.contains('；') {
            "complex"
        } else {
            "simple"
        };
        Ok(format!(
            r#"{{"complexity": "{}", "skip_memory": false, "is_follow_up": false, "wants_to_stop": false, "relevant_groups": ["general"]}}"#,
            complexity
        ))
    }

    async fn decompose(
        &self,
        goal: &str,
        _completed: &[Step],
        _granularity: &str,
    ) -> Result<Vec<StepSpec>, String> {
        // 目标可能附带上下文段落，只取首行切分
        let first_line = goal.lines().next().unwrap_or(goal);
        let parts: Vec<&str> = first_line
            .split("然后")
            .flat_map(|p| p.split('；'))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            return Err("empty goal".to_string());
        }
        Ok(parts
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let spec = StepSpec::new(*p).with_id(format!("s{}", i));
                if i > 0 {
                    spec.depends_on(format!("s{}", i - 1))
                } else {
                    spec
                }
            })
            .collect())
    }

    async fn propose(
        &self,
        step: &Step,
        capabilities: &[Arc<dyn Capability>],
    ) -> Result<ProposedAction, String> {
        let capability = capabilities
            .first()
            .map(|c| c.name().to_string())
            .ok_or_else(|| "empty capability set".to_string())?;
        Ok(ProposedAction {
            capability,
            input: serde_json::json!({ "step": step.description }),
        })
    }

    async fn summarize(&self, entries: &[MemoryEntry]) -> Result<String, String> {
        Ok(format!("{} 条历史摘要", entries.len()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config = load_config(None).unwrap_or_default();
    let store = Arc::new(FileConversationStore::new("workspace/conversations"));
    let mut registry = CapabilityRegistry::new();
    registry.register(EchoCapability {
        groups: vec!["general".to_string()],
    });
    let engine = Engine::new(config, store, Arc::new(registry), Arc::new(RuleReasoner));

    println!("Hive REPL（空行退出；「算了」取消当前任务）");
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().context("flush stdout")?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).context("read stdin")? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        match engine
            .handle_turn("repl", line, CancellationToken::new())
            .await
        {
            Ok(outcome) => println!("[{:?}]\n{}", outcome.phase, outcome.response),
            Err(e) => eprintln!("error: {}", e),
        }
    }

    // 退出时按保留策略归档 / 清除本次会话
    engine
        .end_conversation("repl")
        .await
        .context("end conversation")?;
    Ok(())
}
