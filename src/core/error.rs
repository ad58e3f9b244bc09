//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：控制循环中任意阶段的 AgentError 决定 Retry（指数退避）或 Abort。
//! 工作流层面的错误以结构化数据（StageError）记录，不以 panic / Err 向上传播。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::WorkflowStage;

/// 控制循环各阶段（perceive / analyze / decide / act / compile）可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Perception failed: {0}")]
    Perception(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Decision failed: {0}")]
    Decision(String),

    #[error("Action failed: {0}")]
    Action(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Result compilation failed: {0}")]
    Compilation(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// 目标确定不存在（如找不到职业页），重试无意义
    #[error("Not found: {0}")]
    NotFound(String),

    /// 单次尝试内的动作步数用尽（不重试）
    #[error("Step budget exhausted after {0} actions")]
    StepBudgetExhausted(u32),

    #[error("Cancelled")]
    Cancelled,
}

/// 数据访问协作方（外部存储）的失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataAccessError {
    #[error("Data store unavailable: {0}")]
    Unavailable(String),

    #[error("Entity rejected: {0}")]
    Rejected(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待 delay 后从 Observing 重新开始整个循环
    Retry { delay: Duration },
    /// 终止，返回失败结果
    Abort,
}

/// 工作流错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 请求无法解析（实体不存在等），不进入任何阶段
    Validation,
    /// 数据访问协作方失败
    DataAccess,
    /// 能力 Agent 返回 success=false
    Agent,
    /// 显式取消
    Cancelled,
    /// 超过最大执行时间（按取消处理）
    Timeout,
}

/// 记录在 WorkflowProgress 中的结构化错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: WorkflowStage,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StageError {
    pub fn new(stage: WorkflowStage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// 是否由取消 / 超时产生（调用方据此区分 "cancelled" 与 "failed"）
    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled | ErrorKind::Timeout)
    }
}
