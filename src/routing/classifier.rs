//! 意图分类器
//!
//! 快速规则匹配（停止短语，不调用推理方）+ 推理方语义分类；
//! 分类输出解析失败时回退到保守默认值（Medium + 空分组），记为软错误，从不向上抛。

use std::sync::Arc;

use crate::config::IntentAnalyzerSection;
use crate::memory::MemoryEntry;
use crate::reasoner::Reasoner;
use crate::routing::{Complexity, RoutingRecord};

/// 视为「希望停止当前任务」的短语（小写比较，前缀锚定）
const STOP_PHRASES: &[&str] = &[
    "never mind",
    "forget it",
    "stop",
    "cancel",
    "算了",
    "取消",
    "不用了",
    "别做了",
];

/// 意图分类器：(utterance, context) -> RoutingRecord，无副作用
pub struct IntentClassifier {
    reasoner: Arc<dyn Reasoner>,
    config: IntentAnalyzerSection,
}

impl IntentClassifier {
    pub fn new(reasoner: Arc<dyn Reasoner>, config: IntentAnalyzerSection) -> Self {
        Self { reasoner, config }
    }

    /// 分类入口：先走规则匹配，再走推理方；任何失败都落到保守默认值
    pub async fn classify(&self, utterance: &str, context: &[MemoryEntry]) -> RoutingRecord {
        if let Some(record) = self.fast_match(utterance) {
            return record;
        }

        if !self.config.enabled {
            return RoutingRecord::conservative_default();
        }

        let raw = match self
            .reasoner
            .classify(
                utterance,
                context,
                &self.config.task_types,
                &self.config.output_formats,
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "intent classification call failed, using fallback");
                return RoutingRecord::conservative_default();
            }
        };

        match parse_routing_record(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, raw = %raw, "malformed classification, using fallback");
                RoutingRecord::conservative_default()
            }
        }
    }

    /// 快速规则匹配：停止短语直接产出 wants_to_stop 记录，省一次推理调用。
    /// 只做前缀锚定匹配，句中出现的停止词（如「不要取消订阅」）交给语义分类
    fn fast_match(&self, utterance: &str) -> Option<RoutingRecord> {
        let lower = utterance.trim().to_lowercase();
        if STOP_PHRASES.iter().any(|p| lower.starts_with(p)) {
            return Some(RoutingRecord {
                complexity: Complexity::Simple,
                skip_memory: true,
                is_follow_up: true,
                wants_to_stop: true,
                relevant_groups: Vec::new(),
            });
        }
        None
    }
}

/// 从分类输出中提取 JSON 并解析为 RoutingRecord（```json 块或裸 JSON）
pub fn parse_routing_record(output: &str) -> Result<RoutingRecord, String> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or_else(|| rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        &trimmed[start..=end]
    } else {
        return Err("no JSON object in classification output".to_string());
    };

    serde_json::from_str(json_str).map_err(|e| format!("{}: {}", e, json_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoner::ScriptedReasoner;

    fn classifier_with(script: ScriptedReasoner) -> IntentClassifier {
        IntentClassifier::new(Arc::new(script), IntentAnalyzerSection::default())
    }

    #[tokio::test]
    async fn test_stop_phrase_bypasses_reasoner() {
        // 推理方会报错，但规则匹配应先命中，不触发调用
        let classifier = classifier_with(ScriptedReasoner::failing());
        let record = classifier.classify("never mind, forget it", &[]).await;
        assert!(record.wants_to_stop);
        assert!(record.is_follow_up);
        assert_eq!(record.complexity, Complexity::Simple);
    }

    #[tokio::test]
    async fn test_embedded_stop_word_is_not_a_cancel() {
        // 句中或否定语境里的停止词不应命中快速路径，由语义分类接手
        let raw = r#"{"complexity": "medium", "skip_memory": false, "relevant_groups": []}"#;
        for utterance in ["don't stop, keep going", "不要取消订阅", "帮我查一下怎么取消订阅"] {
            let classifier = classifier_with(ScriptedReasoner::classifying(raw));
            let record = classifier.classify(utterance, &[]).await;
            assert!(!record.wants_to_stop, "{} 不该被当成取消", utterance);
        }
    }

    #[tokio::test]
    async fn test_malformed_output_falls_back() {
        let classifier = classifier_with(ScriptedReasoner::classifying("not json at all"));
        let record = classifier.classify("do something", &[]).await;
        assert_eq!(record.complexity, Complexity::Medium);
        assert!(record.relevant_groups.is_empty());
        assert!(!record.skip_memory);
    }

    #[tokio::test]
    async fn test_json_block_parsed() {
        let raw = r#"```json
{"complexity": "complex", "skip_memory": true, "is_follow_up": false, "wants_to_stop": false, "relevant_groups": ["writing"]}
```"#;
        let classifier = classifier_with(ScriptedReasoner::classifying(raw));
        let record = classifier.classify("write a report", &[]).await;
        assert_eq!(record.complexity, Complexity::Complex);
        assert!(record.skip_memory);
        assert_eq!(record.relevant_groups, vec!["writing"]);
    }

    #[tokio::test]
    async fn test_reasoner_error_falls_back() {
        let classifier = classifier_with(ScriptedReasoner::failing());
        let record = classifier.classify("do something", &[]).await;
        assert_eq!(record.complexity, Complexity::Medium);
    }
}
