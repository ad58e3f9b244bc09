//! 能力 Agent 边界
//!
//! 编排器只看到 CapabilityAgent：每个 Agent 一个顶层异步操作，返回 AgentOutcome（至少含 success 与领域载荷）。
//! Agent 内部的任何失败都在这一边界转换为 `success=false` + error 字符串，不向编排器抛出。
//!
//! - **loop_agent**：把任意 ControlLoop 实现适配为 CapabilityAgent
//! - **matcher**：内置的偏好匹配 Agent
//! - **replay**：基于固定站点数据的发现 / 验证 / 提取 Agent（演示与测试用）

pub mod loop_agent;
pub mod matcher;
pub mod payload;
pub mod replay;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::engine::AgentTask;
use crate::memory::MemoryStats;

pub use loop_agent::LoopAgent;
pub use matcher::{matching_agent, PreferenceMatcher};
pub use payload::{keys, DiscoveredPage, JobListing, JobMatch, MatchSummary, UserPreferences};
pub use replay::{ReplayCatalog, ReplaySite};

/// 单个 Agent 一次运行的统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent: String,
    pub success: bool,
    pub attempts: u32,
    pub retries: u32,
    pub actions_taken: u32,
    pub elapsed_secs: f64,
    #[serde(default)]
    pub memory: Option<MemoryStats>,
}

/// 顶层操作的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub payload: Map<String, Value>,
    pub stats: AgentStats,
}

impl AgentOutcome {
    pub fn succeeded(payload: Map<String, Value>, stats: AgentStats) -> Self {
        Self {
            success: true,
            error: None,
            payload,
            stats,
        }
    }

    pub fn failed(error: impl Into<String>, stats: AgentStats) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            payload: Map::new(),
            stats,
        }
    }

    /// 取出载荷中的某个键并反序列化
    pub fn take<T: serde::de::DeserializeOwned>(&mut self, key: &str) -> Option<Result<T, serde_json::Error>> {
        self.payload.remove(key).map(serde_json::from_value)
    }
}

/// 能力 Agent：一个流水线阶段的工作
#[async_trait]
pub trait CapabilityAgent: Send + Sync {
    fn name(&self) -> &str;

    /// 顶层操作；不得 panic 外抛错误，失败以 `success=false` 表达
    async fn run(&self, task: AgentTask, cancel: CancellationToken) -> AgentOutcome;
}

/// 各阶段对应的能力 Agent
#[derive(Clone)]
pub struct AgentSet {
    pub discovery: Arc<dyn CapabilityAgent>,
    pub verification: Arc<dyn CapabilityAgent>,
    pub extraction: Arc<dyn CapabilityAgent>,
    pub matching: Arc<dyn CapabilityAgent>,
}
