//! 执行引擎：可恢复的 Reason-Act-Observe-Validate-Update 主循环与进度事件

pub mod events;
pub mod loop_;

pub use events::{ProgressEvent, ProgressEventKind};
pub use loop_::{validate_observation, Engine, EnginePhase, TurnOutcome};
