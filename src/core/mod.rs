//! 核心层：错误类型与恢复动作

pub mod error;

pub use error::{EngineError, RecoveryAction};
