//! Hive - 对话智能体的计划 / 记忆 / 执行编排引擎
//!
//! 模块划分：
//! - **config**: 引擎配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复动作
//! - **routing**: 意图分类（快速规则 + 推理方语义分类）
//! - **plan**: Plan / Step 数据模型、依赖图调度与计划管理器
//! - **capability**: 能力注册表、选择策略与带超时的执行器
//! - **memory**: 有界工作记忆、会话状态文档与持久化存储
//! - **reasoner**: 非确定性推理调用的窄接口（可 Mock）
//! - **engine**: 可恢复的执行主循环与进度事件
//! - **observability**: 日志初始化

pub mod capability;
pub mod config;
pub mod core;
pub mod engine;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod reasoner;
pub mod routing;

pub use crate::config::{load_config, AgentConfig};
pub use crate::core::{EngineError, RecoveryAction};
pub use crate::engine::{Engine, EnginePhase, TurnOutcome};
