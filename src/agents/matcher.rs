//! 偏好匹配 Agent
//!
//! 逐个职位执行一轮控制循环：perceive 取游标处的职位，analyze 计算各分项得分，
//! decide 产出 Analyze 动作（置信度即总分），act 记录匹配并推进游标。职位耗尽后以 finish 动作结束。
//!
//! 总分 = 0.5 * 关键词 + 0.3 * 地点 + 0.2 * 职级；命中排除词的职位不产生匹配记录。
//! 偏好为空的分项取中性值 0.5。

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crate::agents::payload::{keys, JobListing, JobMatch, MatchSummary, UserPreferences};
use crate::agents::LoopAgent;
use crate::config::{EngineSection, MemorySection};
use crate::core::AgentError;
use crate::engine::{ActionKind, ActionResult, AgentAction, AgentObservation, AgentTask, ControlLoop};
use crate::memory::item::clamp_unit;
use crate::memory::{tokenize_to_tags, MemoryManager, WorkingKey};

pub const MATCHER_NAME: &str = "preference_matcher";

const KEYWORD_WEIGHT: f64 = 0.5;
const LOCATION_WEIGHT: f64 = 0.3;
const SENIORITY_WEIGHT: f64 = 0.2;
/// 偏好未设置时的中性分
const NEUTRAL_SCORE: f64 = 0.5;

/// 标题中可识别的职级词
const SENIORITY_MARKERS: &[&str] = &[
    "intern", "junior", "mid", "senior", "staff", "lead", "principal", "head", "director",
];

const FINISH_ACTION: &str = "finish";

pub type MatcherFactory = fn(&AgentTask) -> Result<PreferenceMatcher, AgentError>;

/// 内置的匹配能力 Agent
pub type MatchingAgent = LoopAgent<PreferenceMatcher, MatcherFactory>;

pub fn matching_agent(engine: EngineSection, limits: MemorySection) -> MatchingAgent {
    LoopAgent::new(MATCHER_NAME, PreferenceMatcher::from_task as MatcherFactory)
        .with_engine(engine)
        .with_memory_limits(limits)
}

/// analyze → decide 的上下文
#[derive(Debug)]
pub enum MatchStep {
    Score(JobMatch),
    /// 命中排除词，只推进游标
    Exclude { job_index: usize },
    Finish,
}

#[derive(Debug, Serialize)]
pub struct MatchOutput {
    pub matches: Vec<JobMatch>,
    pub summary: MatchSummary,
}

pub struct PreferenceMatcher {
    jobs: Vec<JobListing>,
    preferences: UserPreferences,
    cursor: usize,
    matches: Vec<JobMatch>,
}

impl PreferenceMatcher {
    pub fn new(jobs: Vec<JobListing>, preferences: UserPreferences) -> Self {
        Self {
            jobs,
            preferences,
            cursor: 0,
            matches: Vec::new(),
        }
    }

    /// 任务参数：`jobs`（必填，职位数组）、`preferences`（可选）
    pub fn from_task(task: &AgentTask) -> Result<Self, AgentError> {
        let jobs = task
            .get(keys::JOBS)
            .cloned()
            .ok_or_else(|| AgentError::InvalidTask("missing jobs".to_string()))
            .and_then(|v| {
                serde_json::from_value::<Vec<JobListing>>(v)
                    .map_err(|e| AgentError::InvalidTask(format!("malformed jobs: {e}")))
            })?;
        let preferences = match task.get(keys::PREFERENCES) {
            None | Some(serde_json::Value::Null) => UserPreferences::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| AgentError::InvalidTask(format!("malformed preferences: {e}")))?,
        };
        Ok(Self::new(jobs, preferences))
    }

    fn summary(&self) -> MatchSummary {
        let total_matches = self.matches.len();
        let average_score = if total_matches == 0 {
            0.0
        } else {
            self.matches.iter().map(|m| m.overall_score).sum::<f64>() / total_matches as f64
        };
        MatchSummary {
            total_jobs: self.jobs.len(),
            total_matches,
            average_score,
        }
    }
}

/// 对单个职位打分；命中排除词时返回 None
pub fn score_job(index: usize, job: &JobListing, prefs: &UserPreferences) -> Option<JobMatch> {
    let job_tags = tokenize_to_tags(&job.searchable_text());

    if prefs
        .excluded_keywords
        .iter()
        .any(|kw| keyword_hit(kw, &job_tags))
    {
        return None;
    }

    let matched_keywords: Vec<String> = prefs
        .keywords
        .iter()
        .filter(|kw| keyword_hit(kw, &job_tags))
        .cloned()
        .collect();
    let keyword_score = if prefs.keywords.is_empty() {
        NEUTRAL_SCORE
    } else {
        matched_keywords.len() as f64 / prefs.keywords.len() as f64
    };

    let location_score = location_score(job, prefs);
    let seniority_score = seniority_score(job, prefs);
    let overall_score = clamp_unit(
        KEYWORD_WEIGHT * keyword_score
            + LOCATION_WEIGHT * location_score
            + SENIORITY_WEIGHT * seniority_score,
    );

    Some(JobMatch {
        job_index: index,
        job_title: job.title.clone(),
        job_id: job.id.clone(),
        overall_score,
        keyword_score,
        location_score,
        seniority_score,
        matched_keywords,
    })
}

/// 关键词分词后全部出现在职位文本中才算命中
fn keyword_hit(keyword: &str, job_tags: &BTreeSet<String>) -> bool {
    let kw_tags = tokenize_to_tags(keyword);
    !kw_tags.is_empty() && kw_tags.is_subset(job_tags)
}

fn location_score(job: &JobListing, prefs: &UserPreferences) -> f64 {
    if prefs.remote_ok && job.remote == Some(true) {
        return 1.0;
    }
    if prefs.locations.is_empty() {
        return NEUTRAL_SCORE;
    }
    let Some(location) = job.location.as_deref().map(str::to_lowercase) else {
        return 0.0;
    };
    let hit = prefs
        .locations
        .iter()
        .map(|l| l.trim().to_lowercase())
        .any(|l| !l.is_empty() && location.contains(&l));
    if hit {
        1.0
    } else {
        0.0
    }
}

fn seniority_score(job: &JobListing, prefs: &UserPreferences) -> f64 {
    let Some(wanted) = prefs.seniority.as_deref().map(|s| s.trim().to_lowercase()) else {
        return NEUTRAL_SCORE;
    };
    let title = tokenize_to_tags(&job.title);
    if title.contains(&wanted) {
        return 1.0;
    }
    if SENIORITY_MARKERS.iter().any(|m| title.contains(*m)) {
        0.0
    } else {
        NEUTRAL_SCORE
    }
}

#[async_trait]
impl ControlLoop for PreferenceMatcher {
    type Context = MatchStep;
    type Output = MatchOutput;

    fn name(&self) -> &str {
        MATCHER_NAME
    }

    async fn perceive(&mut self, _memory: &MemoryManager) -> Result<AgentObservation, AgentError> {
        match self.jobs.get(self.cursor) {
            Some(job) => {
                let job = serde_json::to_value(job)
                    .map_err(|e| AgentError::Perception(e.to_string()))?;
                Ok(AgentObservation::new("job", 1.0)
                    .with("index", self.cursor)
                    .with("job", job))
            }
            None => Ok(AgentObservation::new("exhausted", 1.0).with("total", self.jobs.len())),
        }
    }

    fn analyze(
        &self,
        observation: &AgentObservation,
        memory: &mut MemoryManager,
    ) -> Result<MatchStep, AgentError> {
        if observation.kind == "exhausted" {
            return Ok(MatchStep::Finish);
        }
        let index = observation
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .ok_or_else(|| AgentError::Analysis("observation without job index".into()))?;
        let job = self
            .jobs
            .get(index)
            .ok_or_else(|| AgentError::Analysis(format!("job index {index} out of range")))?;
        memory.set_working(WorkingKey::Cursor, json!(index), 0.3, [MATCHER_NAME]);

        Ok(match score_job(index, job, &self.preferences) {
            Some(m) => MatchStep::Score(m),
            None => MatchStep::Exclude { job_index: index },
        })
    }

    fn decide(&self, context: MatchStep) -> Result<AgentAction, AgentError> {
        match context {
            MatchStep::Finish => Ok(AgentAction::new(ActionKind::Custom(FINISH_ACTION.into()), 1.0)
                .with_reasoning("all jobs scored")),
            MatchStep::Score(m) => {
                let confidence = m.overall_score;
                let record =
                    serde_json::to_value(&m).map_err(|e| AgentError::Decision(e.to_string()))?;
                Ok(AgentAction::new(ActionKind::Analyze, confidence)
                    .with_param("job_index", m.job_index)
                    .with_param("match", record))
            }
            MatchStep::Exclude { job_index } => Ok(AgentAction::new(ActionKind::Analyze, 1.0)
                .with_param("job_index", job_index)
                .with_param("excluded", true)
                .with_reasoning("excluded keyword in listing")),
        }
    }

    async fn act(
        &mut self,
        action: &AgentAction,
        _memory: &mut MemoryManager,
    ) -> Result<ActionResult, AgentError> {
        match &action.kind {
            ActionKind::Custom(name) if name == FINISH_ACTION => Ok(ActionResult::ok(json!({ "done": true }))),
            ActionKind::Analyze => {
                if action.params.get("excluded").and_then(|v| v.as_bool()) == Some(true) {
                    let index = action
                        .params
                        .get("job_index")
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| AgentError::Action("exclusion without job_index".into()))?
                        as usize;
                    self.cursor = index + 1;
                    return Ok(ActionResult::ok(
                        json!({ "done": false, "job_index": index, "kept": false }),
                    ));
                }
                let record = action
                    .params
                    .get("match")
                    .cloned()
                    .ok_or_else(|| AgentError::Action("analyze action without match".into()))?;
                let m: JobMatch =
                    serde_json::from_value(record).map_err(|e| AgentError::Action(e.to_string()))?;
                let index = m.job_index;
                self.matches.push(m);
                self.cursor = index + 1;
                Ok(ActionResult::ok(json!({ "done": false, "job_index": index, "kept": true })))
            }
            other => Err(AgentError::Action(format!(
                "unsupported action: {}",
                other.label()
            ))),
        }
    }

    fn is_complete(&self, result: &ActionResult) -> bool {
        result.data.get("done").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    fn compile_result(&mut self) -> Result<MatchOutput, AgentError> {
        let summary = self.summary();
        Ok(MatchOutput {
            matches: std::mem::take(&mut self.matches),
            summary,
        })
    }

    /// 每个职位一个动作，外加一个结束动作
    fn step_budget(&self) -> Option<u32> {
        Some(self.jobs.len() as u32 + 1)
    }

    fn on_restart(&mut self) {
        self.cursor = 0;
        self.matches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::CapabilityAgent;
    use tokio_util::sync::CancellationToken;

    fn prefs() -> UserPreferences {
        UserPreferences {
            keywords: vec!["rust".into(), "distributed systems".into()],
            excluded_keywords: vec!["php".into()],
            locations: vec!["Berlin".into()],
            remote_ok: true,
            seniority: Some("senior".into()),
        }
    }

    #[test]
    fn test_full_match_scores_one() {
        let job = JobListing::new("Senior Rust Engineer")
            .with_location("Berlin, DE")
            .with_description("Build distributed systems");
        let m = score_job(0, &job, &prefs()).unwrap();
        assert_eq!(m.keyword_score, 1.0);
        assert_eq!(m.location_score, 1.0);
        assert_eq!(m.seniority_score, 1.0);
        assert!((m.overall_score - 1.0).abs() < 1e-9);
        assert_eq!(m.matched_keywords.len(), 2);
    }

    #[test]
    fn test_remote_counts_as_location_hit() {
        let job = JobListing::new("Junior Rust Developer")
            .with_location("Lisbon")
            .with_remote(true);
        let m = score_job(3, &job, &prefs()).unwrap();
        assert_eq!(m.job_index, 3);
        assert_eq!(m.location_score, 1.0);
        assert_eq!(m.seniority_score, 0.0);
        assert_eq!(m.keyword_score, 0.5);
    }

    #[test]
    fn test_excluded_keyword_drops_job() {
        let job = JobListing::new("Senior PHP Engineer").with_location("Berlin");
        assert!(score_job(0, &job, &prefs()).is_none());
    }

    #[test]
    fn test_empty_preferences_are_neutral() {
        let job = JobListing::new("Backend Engineer");
        let m = score_job(0, &job, &UserPreferences::default()).unwrap();
        assert!((m.overall_score - 0.5).abs() < 1e-9);
    }

    fn fast_engine() -> EngineSection {
        EngineSection {
            max_retries: 0,
            base_delay_ms: 1,
            max_steps_per_attempt: 2,
        }
    }

    #[tokio::test]
    async fn test_agent_scores_every_job_beyond_session_budget() {
        let jobs = vec![
            JobListing::new("Senior Rust Engineer").with_location("Berlin"),
            JobListing::new("PHP Developer"),
            JobListing::new("Rust Intern").with_location("Paris"),
        ];
        let task = AgentTask::new()
            .with(keys::JOBS, serde_json::to_value(&jobs).unwrap())
            .with(keys::PREFERENCES, serde_json::to_value(prefs()).unwrap());
        let agent = matching_agent(fast_engine(), MemorySection::default());
        let mut outcome = agent.run(task, CancellationToken::new()).await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.stats.actions_taken, 4);

        let matches: Vec<JobMatch> = outcome.take(keys::MATCHES).unwrap().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].job_index, 0);
        assert_eq!(matches[1].job_index, 2);
        let summary: MatchSummary = outcome.take(keys::SUMMARY).unwrap().unwrap();
        assert_eq!(summary.total_jobs, 3);
        assert_eq!(summary.total_matches, 2);
    }

    #[tokio::test]
    async fn test_zero_score_job_is_kept_but_excluded_job_is_not() {
        // 关键词、地点都未命中，职级不符：总分 0，但不是排除
        let jobs = vec![
            JobListing::new("Junior Go Developer").with_location("Paris"),
            JobListing::new("Senior PHP Engineer").with_location("Berlin"),
        ];
        let zero = score_job(0, &jobs[0], &prefs()).unwrap();
        assert_eq!(zero.overall_score, 0.0);

        let task = AgentTask::new()
            .with(keys::JOBS, serde_json::to_value(&jobs).unwrap())
            .with(keys::PREFERENCES, serde_json::to_value(prefs()).unwrap());
        let agent = matching_agent(fast_engine(), MemorySection::default());
        let mut outcome = agent.run(task, CancellationToken::new()).await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.stats.actions_taken, 3);

        let matches: Vec<JobMatch> = outcome.take(keys::MATCHES).unwrap().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].job_index, 0);
        assert_eq!(matches[0].overall_score, 0.0);
    }

    #[tokio::test]
    async fn test_zero_jobs_yields_empty_matches() {
        let task = AgentTask::new().with(keys::JOBS, json!([]));
        let agent = matching_agent(fast_engine(), MemorySection::default());
        let mut outcome = agent.run(task, CancellationToken::new()).await;
        assert!(outcome.success);
        let matches: Vec<JobMatch> = outcome.take(keys::MATCHES).unwrap().unwrap();
        assert!(matches.is_empty());
        let summary: MatchSummary = outcome.take(keys::SUMMARY).unwrap().unwrap();
        assert_eq!(summary.total_jobs, 0);
        assert_eq!(summary.average_score, 0.0);
    }

    #[tokio::test]
    async fn test_malformed_task_fails_without_panicking() {
        let task = AgentTask::new().with(keys::JOBS, json!("not a list"));
        let agent = matching_agent(fast_engine(), MemorySection::default());
        let outcome = agent.run(task, CancellationToken::new()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("malformed jobs"));
    }
}
