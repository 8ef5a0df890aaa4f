//! 能力层：注册表、选择器与带超时的执行器

pub mod executor;
pub mod registry;
pub mod selector;

pub use executor::CapabilityExecutor;
pub use registry::{Capability, CapabilityRegistry};
pub use selector::{SelectionStrategy, ToolSelector};
