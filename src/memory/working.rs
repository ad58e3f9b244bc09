//! 工作记忆键：任务范围内的草稿状态
//!
//! 键是封闭集合（WorkingKey），值是 JSON（serde_json::Value），保留灵活性又不丢类型安全。

use serde::{Deserialize, Serialize};

/// 工作记忆可识别的键
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingKey {
    /// 当前任务参数（AgentTask）
    Task,
    /// 当前目标描述
    Goal,
    /// 最近一次观察
    LastObservation,
    /// 最近一次动作
    LastAction,
    /// 最近一次动作结果
    LastResult,
    /// 遍历游标（如下一个待处理条目下标）
    Cursor,
    /// 候选集合（候选页面、待匹配职位等）
    Candidates,
    /// 累计产出（匹配记录等）
    Collected,
}

impl WorkingKey {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkingKey::Task => "task",
            WorkingKey::Goal => "goal",
            WorkingKey::LastObservation => "last_observation",
            WorkingKey::LastAction => "last_action",
            WorkingKey::LastResult => "last_result",
            WorkingKey::Cursor => "cursor",
            WorkingKey::Candidates => "candidates",
            WorkingKey::Collected => "collected",
        }
    }
}

impl std::fmt::Display for WorkingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
