//! 能力注册表
//!
//! 所有外部能力实现 Capability trait（name / description / groups / execute），
//! 统一契约 (name, input) -> (output | error)，引擎对实现方式不做任何假设。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// 能力 trait：名称、描述、分组标签、优先级、异步执行（input 为 JSON）
#[async_trait]
pub trait Capability: Send + Sync {
    /// 能力名称（注册与调用的 key）
    fn name(&self) -> &str;

    /// 能力描述（供推理方理解功能）
    fn description(&self) -> &str;

    /// 所属分组标签，供 capability_based 策略做精确匹配
    fn groups(&self) -> &[String];

    /// priority_based 策略的排序依据，越大越靠前
    fn priority(&self) -> i32 {
        0
    }

    /// 执行能力
    async fn execute(&self, input: Value) -> Result<Value, String>;
}

impl std::fmt::Debug for dyn Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability").field("name", &self.name()).finish()
    }
}

/// 能力注册表：按名称存储 Arc<dyn Capability>
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    /// 注册顺序，保证遍历确定性
    order: Vec<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) {
        self.register_arc(Arc::new(capability));
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        if !self.capabilities.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.capabilities.insert(name, capability);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// 按注册顺序返回全部能力
    pub fn all(&self) -> Vec<Arc<dyn Capability>> {
        self.order
            .iter()
            .filter_map(|name| self.capabilities.get(name).cloned())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// (name, description) 列表，用于生成提示词中的能力段落
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.all()
            .iter()
            .map(|c| (c.name().to_string(), c.description().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
