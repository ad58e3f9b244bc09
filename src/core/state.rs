//! 状态定义：Agent 控制循环状态与工作流阶段
//!
//! AgentState 由驱动循环推进（每次迭代恰好前进一步）；WorkflowStage 由编排器严格按枚举顺序推进。

use serde::{Deserialize, Serialize};

/// 控制循环状态：Idle → Observing → Orienting → Deciding → Acting → {Completed | Error}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Observing,
    Orienting,
    Deciding,
    Acting,
    Completed,
    Error,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Error)
    }

    /// 确定性推进：Acting 之后若未完成回到 Observing，否则 Completed
    pub fn advance(self, complete: bool) -> AgentState {
        match self {
            AgentState::Idle => AgentState::Observing,
            AgentState::Observing => AgentState::Orienting,
            AgentState::Orienting => AgentState::Deciding,
            AgentState::Deciding => AgentState::Acting,
            AgentState::Acting if complete => AgentState::Completed,
            AgentState::Acting => AgentState::Observing,
            terminal => terminal,
        }
    }
}

/// 流水线阶段（有序）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Initialization,
    CareerDiscovery,
    CareerVerification,
    JobExtraction,
    JobMatching,
    ResultCompilation,
    Completed,
    Error,
}

impl WorkflowStage {
    /// 规范执行顺序（不含终态）
    pub const PIPELINE: [WorkflowStage; 6] = [
        WorkflowStage::Initialization,
        WorkflowStage::CareerDiscovery,
        WorkflowStage::CareerVerification,
        WorkflowStage::JobExtraction,
        WorkflowStage::JobMatching,
        WorkflowStage::ResultCompilation,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStage::Completed | WorkflowStage::Error)
    }

    /// 进入该阶段前发布的进度百分比
    pub fn progress_percentage(self) -> f64 {
        match self {
            WorkflowStage::Initialization => 10.0,
            WorkflowStage::CareerDiscovery => 30.0,
            WorkflowStage::CareerVerification => 40.0,
            WorkflowStage::JobExtraction => 70.0,
            WorkflowStage::JobMatching => 80.0,
            WorkflowStage::ResultCompilation => 95.0,
            WorkflowStage::Completed => 100.0,
            // 出错时保持当前百分比，由调用方处理
            WorkflowStage::Error => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStage::Initialization => "initialization",
            WorkflowStage::CareerDiscovery => "career_discovery",
            WorkflowStage::CareerVerification => "career_verification",
            WorkflowStage::JobExtraction => "job_extraction",
            WorkflowStage::JobMatching => "job_matching",
            WorkflowStage::ResultCompilation => "result_compilation",
            WorkflowStage::Completed => "completed",
            WorkflowStage::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_state_cycle() {
        let mut s = AgentState::Idle;
        let mut seen = vec![];
        for _ in 0..5 {
            s = s.advance(false);
            seen.push(s);
        }
        assert_eq!(
            seen,
            vec![
                AgentState::Observing,
                AgentState::Orienting,
                AgentState::Deciding,
                AgentState::Acting,
                AgentState::Observing
            ]
        );
        assert_eq!(AgentState::Acting.advance(true), AgentState::Completed);
        assert_eq!(AgentState::Completed.advance(false), AgentState::Completed);
    }

    #[test]
    fn test_pipeline_order_and_percentages() {
        let mut last = 0.0;
        for stage in WorkflowStage::PIPELINE {
            assert!(stage.progress_percentage() > last);
            last = stage.progress_percentage();
        }
        assert!(WorkflowStage::PIPELINE.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(WorkflowStage::Completed.progress_percentage(), 100.0);
    }
}
