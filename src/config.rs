//! 引擎配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__PLAN_MANAGER__MAX_STEPS=20`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 引擎配置根（对应 config/default.toml 的顶层，亦即入站请求携带的 Agent 配置）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub intent_analyzer: IntentAnalyzerSection,
    pub plan_manager: PlanManagerSection,
    pub tool_selector: ToolSelectorSection,
    pub memory_manager: MemoryManagerSection,
    pub engine: EngineSection,
}

/// [intent_analyzer] 段：意图分析开关与任务类型
#[derive(Debug, Clone, Deserialize)]
pub struct IntentAnalyzerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 可识别的任务类型（注入到分类提示词，空则用推理方默认）
    #[serde(default)]
    pub task_types: Vec<String>,
    /// 期望的输出形态（同样注入到分类提示词）
    #[serde(default)]
    pub output_formats: Vec<String>,
}

impl Default for IntentAnalyzerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            task_types: Vec::new(),
            output_formats: Vec::new(),
        }
    }
}

/// [plan_manager] 段：步骤上限、重规划策略与失败阈值
#[derive(Debug, Clone, Deserialize)]
pub struct PlanManagerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 单个 Plan 允许的最大步骤数
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// 分解粒度提示（coarse / medium / fine），透传给推理方
    #[serde(default = "default_granularity")]
    pub granularity: String,
    #[serde(default = "default_true")]
    pub replan_enabled: bool,
    #[serde(default = "default_max_replan_attempts")]
    pub max_replan_attempts: u32,
    /// 重规划策略：full / incremental
    #[serde(default = "default_replan_strategy")]
    pub replan_strategy: String,
    /// failed / attempted 超过该比例时触发重规划
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// 单步默认最大重试次数（不含首次执行）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for PlanManagerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_steps: default_max_steps(),
            granularity: default_granularity(),
            replan_enabled: true,
            max_replan_attempts: default_max_replan_attempts(),
            replan_strategy: default_replan_strategy(),
            failure_threshold: default_failure_threshold(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_max_steps() -> usize {
    20
}

fn default_granularity() -> String {
    "medium".to_string()
}

fn default_max_replan_attempts() -> u32 {
    2
}

fn default_replan_strategy() -> String {
    "incremental".to_string()
}

fn default_failure_threshold() -> f64 {
    0.3
}

fn default_max_retries() -> u32 {
    2
}

/// [tool_selector] 段：选择策略与并行度
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSelectorSection {
    /// 策略：capability_based / priority_based / all
    #[serde(default = "default_selection_strategy")]
    pub selection_strategy: String,
    #[serde(default)]
    pub allow_parallel: bool,
    /// 并行上限；就绪步骤多于该值时按创建顺序截断
    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,
    /// 无论何种策略都附加的基础工具（如取消检查）
    #[serde(default)]
    pub base_tools: Vec<String>,
    /// priority_based 策略下保留的能力数上限
    #[serde(default = "default_max_selected")]
    pub max_selected: usize,
}

impl Default for ToolSelectorSection {
    fn default() -> Self {
        Self {
            selection_strategy: default_selection_strategy(),
            allow_parallel: false,
            max_parallel_tools: default_max_parallel_tools(),
            base_tools: Vec::new(),
            max_selected: default_max_selected(),
        }
    }
}

fn default_selection_strategy() -> String {
    "capability_based".to_string()
}

fn default_max_parallel_tools() -> usize {
    3
}

fn default_max_selected() -> usize {
    5
}

/// [memory_manager] 段：保留策略与工作记忆容量
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryManagerSection {
    /// session / user / persistent
    #[serde(default = "default_retention_policy")]
    pub retention_policy: String,
    #[serde(default = "default_working_memory_limit")]
    pub working_memory_limit: usize,
    /// 满时压缩最旧条目而非直接丢弃
    #[serde(default)]
    pub auto_compress: bool,
}

impl Default for MemoryManagerSection {
    fn default() -> Self {
        Self {
            retention_policy: default_retention_policy(),
            working_memory_limit: default_working_memory_limit(),
            auto_compress: false,
        }
    }
}

fn default_retention_policy() -> String {
    "session".to_string()
}

fn default_working_memory_limit() -> usize {
    50
}

/// [engine] 段：循环轮数与单步超时
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// 单次请求内执行循环的最大迭代数，防止死循环
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// 单次能力调用超时（秒）
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

fn default_max_turns() -> usize {
    30
}

fn default_step_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AgentConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
