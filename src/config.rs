//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `JOBHOUND__*` 覆盖（双下划线表示嵌套，如 `JOBHOUND__ENGINE__MAX_RETRIES=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub memory: MemorySection,
}

/// [orchestrator] 段：并发上限、默认执行时长、发现跳过策略、推荐数量、模式持久化
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    /// 请求未指定时的最大执行时间（秒）
    #[serde(default = "default_max_execution_secs")]
    pub default_max_execution_secs: u64,
    /// 公司已有职业页且未要求强制刷新时，跳过发现阶段
    #[serde(default = "default_skip_known_career_pages")]
    pub skip_known_career_pages: bool,
    #[serde(default = "default_top_recommendations")]
    pub top_recommendations: usize,
    /// 设置后，工作流结束时把高重要度模式写入该文件
    pub pattern_store_path: Option<PathBuf>,
    /// 只持久化 importance 严格大于该值的模式
    #[serde(default = "default_pattern_persist_min_importance")]
    pub pattern_persist_min_importance: f64,
    /// 保留的终态结果数量，超出时丢弃最早完成的
    #[serde(default = "default_completed_capacity")]
    pub completed_capacity: usize,
}

fn default_max_concurrent_workflows() -> usize {
    4
}

fn default_max_execution_secs() -> u64 {
    300
}

fn default_skip_known_career_pages() -> bool {
    true
}

fn default_top_recommendations() -> usize {
    10
}

fn default_pattern_persist_min_importance() -> f64 {
    0.7
}

fn default_completed_capacity() -> usize {
    256
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            default_max_execution_secs: default_max_execution_secs(),
            skip_known_career_pages: default_skip_known_career_pages(),
            top_recommendations: default_top_recommendations(),
            pattern_store_path: None,
            pattern_persist_min_importance: default_pattern_persist_min_importance(),
            completed_capacity: default_completed_capacity(),
        }
    }
}

/// [engine] 段：控制循环重试与步数预算
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 指数退避基数（毫秒）：delay = base * 2^attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 单次尝试内最多执行的动作数，防止死循环
    #[serde(default = "default_max_steps_per_attempt")]
    pub max_steps_per_attempt: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_steps_per_attempt() -> u32 {
    20
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_steps_per_attempt: default_max_steps_per_attempt(),
        }
    }
}

/// [memory] 段：各分区容量
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_short_term_capacity")]
    pub short_term_capacity: usize,
    #[serde(default = "default_working_capacity")]
    pub working_capacity: usize,
    #[serde(default = "default_conversation_capacity")]
    pub conversation_capacity: usize,
}

fn default_short_term_capacity() -> usize {
    100
}

fn default_working_capacity() -> usize {
    50
}

fn default_conversation_capacity() -> usize {
    200
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            short_term_capacity: default_short_term_capacity(),
            working_capacity: default_working_capacity(),
            conversation_capacity: default_conversation_capacity(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 JOBHOUND__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 JOBHOUND__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
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
        config::Environment::with_prefix("JOBHOUND")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.max_retries, 3);
        assert_eq!(cfg.engine.base_delay_ms, 1000);
        assert_eq!(cfg.orchestrator.top_recommendations, 10);
        assert!(cfg.orchestrator.skip_known_career_pages);
        assert_eq!(cfg.memory.short_term_capacity, 100);
        assert_eq!(cfg.orchestrator.completed_capacity, 256);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[engine]\nmax_retries = 7\n\n[orchestrator]\nskip_known_career_pages = false\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.engine.max_retries, 7);
        assert_eq!(cfg.engine.max_steps_per_attempt, 20);
        assert!(!cfg.orchestrator.skip_known_career_pages);
        assert_eq!(cfg.memory.working_capacity, 50);
    }
}
