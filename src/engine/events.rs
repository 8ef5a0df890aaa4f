//! 进度事件：推送给通知通道的执行过程可见性
//!
//! 至少一次投递（at-least-once）：事件可能重复，消费方按 event_id 去重。
//! 发送失败（通道关闭）不影响执行循环。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 事件种类
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEventKind {
    StepStarted { step_id: String },
    StepCompleted { step_id: String },
    StepFailed { step_id: String, reason: String },
    PlanReplanned { replan_count: u32 },
    PlanCompleted { plan_id: String },
}

/// 进度事件：event_id 全局唯一，供消费方去重
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub event_id: String,
    pub conversation_id: String,
    pub kind: ProgressEventKind,
}

impl ProgressEvent {
    pub fn new(conversation_id: &str, kind: ProgressEventKind) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            kind,
        }
    }
}

/// 发送事件；通道缺失或关闭时静默忽略，执行循环不被慢消费方阻塞
pub fn send_event(
    tx: &Option<UnboundedSender<ProgressEvent>>,
    conversation_id: &str,
    kind: ProgressEventKind,
) {
    if let Some(t) = tx {
        let _ = t.send(ProgressEvent::new(conversation_id, kind));
    }
}
