//! 工作流类型：请求、进度快照、终态结果

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::{AgentStats, DiscoveredPage, JobListing, JobMatch};
use crate::core::{StageError, WorkflowStage};

pub type WorkflowId = String;

/// 一次职位发现请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub company_id: String,
    pub user_id: String,
    /// 毫秒；未设置时使用 `orchestrator.default_max_execution_secs`
    #[serde(default)]
    pub max_execution_ms: Option<u64>,
    /// 即使公司记录里已有职业页也重新发现
    #[serde(default)]
    pub force_refresh: bool,
}

impl DiscoveryRequest {
    pub fn new(company_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            company_id: company_id.into(),
            user_id: user_id.into(),
            max_execution_ms: None,
            force_refresh: false,
        }
    }

    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_ms = Some(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn max_execution_time(&self) -> Option<Duration> {
        self.max_execution_ms.map(Duration::from_millis)
    }

    pub fn with_force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }
}

/// 进度快照；发布给订阅者的是拷贝
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub workflow_id: WorkflowId,
    pub stage: WorkflowStage,
    pub progress_percentage: f64,
    pub current_operation: String,
    pub stages_completed: Vec<WorkflowStage>,
    /// 阶段 → 耗时（秒）
    pub stage_durations: BTreeMap<WorkflowStage, f64>,
    pub errors: Vec<StageError>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl WorkflowProgress {
    pub fn new(workflow_id: impl Into<WorkflowId>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            stage: WorkflowStage::Initialization,
            progress_percentage: 0.0,
            current_operation: "waiting for a workflow slot".to_string(),
            stages_completed: Vec::new(),
            stage_durations: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// 进入阶段，百分比取阶段表中的值（只增不减）
    pub fn enter(&mut self, stage: WorkflowStage, operation: impl Into<String>) {
        self.stage = stage;
        self.advance_to(stage.progress_percentage(), operation);
    }

    /// 阶段内的进度推进
    pub fn advance_to(&mut self, percentage: f64, operation: impl Into<String>) {
        self.progress_percentage = self.progress_percentage.max(percentage.clamp(0.0, 100.0));
        self.current_operation = operation.into();
    }

    pub fn complete_stage(&mut self, stage: WorkflowStage, elapsed: Duration) {
        self.stages_completed.push(stage);
        self.stage_durations.insert(stage, elapsed.as_secs_f64());
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// 终态：出错（百分比保持不变）
    pub fn fail(&mut self, error: StageError) {
        self.current_operation = error.message.clone();
        self.stage = WorkflowStage::Error;
        self.errors.push(error);
    }

    /// 终态：完成
    pub fn finish(&mut self) {
        self.stage = WorkflowStage::Completed;
        self.advance_to(WorkflowStage::Completed.progress_percentage(), "completed");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total_pages: usize,
    pub total_jobs: usize,
    pub total_matches: usize,
    pub average_score: f64,
}

/// 终态结果；每个工作流恰好产生一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDiscoveryResult {
    pub workflow_id: WorkflowId,
    pub success: bool,
    /// 失败时出错的阶段
    pub failed_stage: Option<WorkflowStage>,
    pub progress: WorkflowProgress,
    pub career_pages: Vec<DiscoveredPage>,
    pub jobs: Vec<JobListing>,
    pub matches: Vec<JobMatch>,
    pub summary: ResultSummary,
    pub execution_time_secs: f64,
    /// Agent 名称 → 统计
    pub agent_stats: BTreeMap<String, AgentStats>,
    /// 按总分降序的前 N 个匹配
    pub recommendations: Vec<JobMatch>,
}

impl JobDiscoveryResult {
    pub fn first_error(&self) -> Option<&StageError> {
        self.progress.errors.first()
    }

    /// 由取消 / 超时终止
    pub fn was_cancelled(&self) -> bool {
        self.progress.errors.iter().any(StageError::is_cancellation)
    }
}

/// 按 overall_score 降序取前 n 个；稳定排序，同分保持输入顺序
pub fn rank_recommendations(matches: &[JobMatch], n: usize) -> Vec<JobMatch> {
    let mut ranked = matches.to_vec();
    ranked.sort_by(|a, b| b.overall_score.total_cmp(&a.overall_score));
    ranked.truncate(n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    fn m(index: usize, score: f64) -> JobMatch {
        JobMatch {
            job_index: index,
            job_title: format!("job {index}"),
            job_id: None,
            overall_score: score,
            keyword_score: score,
            location_score: score,
            seniority_score: score,
            matched_keywords: vec![],
        }
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut p = WorkflowProgress::new("wf");
        p.enter(WorkflowStage::JobMatching, "matching");
        p.enter(WorkflowStage::CareerDiscovery, "rewind");
        assert_eq!(p.progress_percentage, 80.0);
        p.fail(StageError::new(WorkflowStage::JobMatching, ErrorKind::Agent, "boom"));
        assert_eq!(p.stage, WorkflowStage::Error);
        assert_eq!(p.progress_percentage, 80.0);
    }

    #[test]
    fn test_recommendations_stable_on_ties() {
        let matches: Vec<JobMatch> = (0..12)
            .map(|i| m(i, if i % 2 == 0 { 0.5 } else { 0.9 }))
            .collect();
        let top = rank_recommendations(&matches, 10);
        assert_eq!(top.len(), 10);
        let order: Vec<usize> = top.iter().map(|m| m.job_index).collect();
        assert_eq!(order, vec![1, 3, 5, 7, 9, 11, 0, 2, 4, 6]);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: DiscoveryRequest =
            serde_json::from_str(r#"{"company_id": "acme", "user_id": "u1"}"#).unwrap();
        assert_eq!(req, DiscoveryRequest::new("acme", "u1"));
        assert_eq!(req.max_execution_time(), None);
    }

    #[test]
    fn test_execution_budget_keeps_sub_second_precision() {
        let req = DiscoveryRequest::new("acme", "u1").with_max_execution_time(Duration::from_millis(2900));
        assert_eq!(req.max_execution_time(), Some(Duration::from_millis(2900)));
        let req = req.with_max_execution_time(Duration::from_millis(500));
        assert_eq!(req.max_execution_ms, Some(500));

        let parsed: DiscoveryRequest = serde_json::from_str(
            r#"{"company_id": "acme", "user_id": "u1", "max_execution_ms": 1500}"#,
        )
        .unwrap();
        assert_eq!(parsed.max_execution_time(), Some(Duration::from_millis(1500)));
    }
}
