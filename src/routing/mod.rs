//! 路由层：意图分类与路由记录

pub mod classifier;
pub mod types;

pub use classifier::{parse_routing_record, IntentClassifier};
pub use types::{Complexity, RoutingRecord};
