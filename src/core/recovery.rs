//! 错误恢复引擎
//!
//! 根据 AgentError 与当前尝试次数返回 RecoveryAction：重试（delay = base * 2^attempt）或终止。
//! 重试是循环级的（整轮重启），不是阶段级的。

use std::time::Duration;

use crate::config::EngineSection;
use crate::core::{AgentError, RecoveryAction};

/// 重试上限封顶，避免 2^attempt 溢出
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// 循环级重试策略：最大重试次数与退避基数
#[derive(Debug, Clone, Copy)]
pub struct RecoveryEngine {
    max_retries: u32,
    base_delay: Duration,
}

impl RecoveryEngine {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(cfg: &EngineSection) -> Self {
        Self::new(cfg.max_retries, Duration::from_millis(cfg.base_delay_ms))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 第 attempt 次重试（从 0 开始）前的等待时长
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.min(MAX_BACKOFF_EXPONENT))
    }

    /// retries_used：已经用掉的重试次数
    pub fn handle(&self, err: &AgentError, retries_used: u32) -> RecoveryAction {
        let retryable = match err {
            AgentError::Cancelled | AgentError::StepBudgetExhausted(_) => false,
            AgentError::InvalidTask(_) | AgentError::NotFound(_) => false,
            AgentError::Perception(_)
            | AgentError::Analysis(_)
            | AgentError::Decision(_)
            | AgentError::Action(_)
            | AgentError::Network(_)
            | AgentError::Compilation(_) => true,
        };
        if retryable && retries_used < self.max_retries {
            RecoveryAction::Retry {
                delay: self.backoff(retries_used),
            }
        } else {
            RecoveryAction::Abort
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::from_config(&EngineSection::default())
    }
}
