//! 控制循环过程事件与 Agent 状态快照

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::AgentState;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// 状态推进
    StateChanged { agent: String, state: AgentState },
    /// 执行了一个动作
    ActionTaken {
        agent: String,
        kind: String,
        confidence: f64,
        step: u32,
    },
    /// 动作返回 success=false（不是异常，循环继续）
    ActionUnsuccessful { agent: String, error: String },
    /// 某阶段失败，进入 Error
    PhaseFailed {
        agent: String,
        state: AgentState,
        error: String,
    },
    /// 整轮重试
    Retrying {
        agent: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// 正常完成
    Completed { agent: String, attempts: u32, steps: u32 },
    /// 放弃（重试用尽 / 取消 / 步数预算）
    Aborted { agent: String, error: String },
}

/// 每个 Agent 的状态报告
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent: String,
    pub state: AgentState,
    /// 当前是第几次尝试（从 1 开始，未开始为 0）
    pub attempt: u32,
    /// 累计执行动作数（跨尝试）
    pub actions_taken: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentStatus {
    pub fn idle(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            state: AgentState::Idle,
            attempt: 0,
            actions_taken: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}
