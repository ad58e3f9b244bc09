//! 工作流监管：取消令牌与取消原因
//!
//! 每个工作流实例持有一个 SessionSupervisor；cancel / 超时都走同一条路径，
//! 控制循环在每轮迭代开始处观察 token（协作式，不抢占进行中的 I/O）。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::core::ErrorKind;

/// 取消原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// 调用方显式 cancel
    Requested,
    /// 超过最大执行时间
    TimedOut,
}

impl CancelReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CancelReason::Requested => ErrorKind::Cancelled,
            CancelReason::TimedOut => ErrorKind::Timeout,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CancelReason::Requested => "workflow cancelled by request",
            CancelReason::TimedOut => "workflow timed out (cancelled at deadline)",
        }
    }
}

/// 工作流级生命周期管理：取消令牌与首次取消的原因
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消；只记录第一次的原因。返回是否为首次取消
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        };
        self.cancel_token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 创建子 token（传给单个 Agent 调用）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
