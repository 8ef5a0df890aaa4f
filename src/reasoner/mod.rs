//! 推理层：非确定性「提议下一步动作」的窄接口与脚本化实现

pub mod mock;
pub mod traits;

pub use mock::ScriptedReasoner;
pub use traits::{ProposedAction, Reasoner};
