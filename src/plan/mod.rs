//! 计划层：数据模型、依赖图与计划管理器

pub mod graph;
pub mod manager;
pub mod types;

pub use manager::{apply_replan, PlanManager, ReplanStrategy};
pub use types::{Plan, PlanStatus, Step, StepId, StepSpec, StepStatus};
