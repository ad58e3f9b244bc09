//! 工作流编排器
//!
//! 按固定顺序驱动各能力 Agent：
//! Initialization → CareerDiscovery → CareerVerification → JobExtraction → JobMatching → ResultCompilation。
//! 每个阶段开始前发布进度快照；任一阶段失败即短路到 Error。
//!
//! 注册表（active / completed）由一把互斥锁保护，锁从不跨 await 持有。
//! 工作流从 active 移入 completed 恰好一次：正常结束、失败、cancel 或超时，谁先到谁折叠，
//! 之后的折叠请求直接返回已有结果。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::agents::{
    keys, AgentOutcome, AgentSet, AgentStats, CapabilityAgent, DiscoveredPage, JobListing, JobMatch,
    MatchSummary, UserPreferences,
};
use crate::config::AppConfig;
use crate::core::{CancelReason, ErrorKind, SessionSupervisor, StageError, WorkflowStage};
use crate::engine::AgentTask;
use crate::memory::{MemoryKind, MemoryManager, PatternStore, Role};
use crate::store::{DataAccess, DerivedLink, EntityKind, Record};
use crate::workflow::progress::{subscriber_fn, ProgressHub, ProgressSubscriber};
use crate::workflow::types::rank_recommendations;
use crate::workflow::{
    DiscoveryRequest, JobDiscoveryResult, ResultSummary, WorkflowId, WorkflowProgress,
};

const ORCHESTRATOR_NAME: &str = "orchestrator";
/// 匹配完成后、持久化匹配关系前发布的百分比
const PERSIST_MATCHES_PERCENTAGE: f64 = 90.0;
const STAGE_SUCCESS_IMPORTANCE: f64 = 0.5;
const STAGE_FAILURE_IMPORTANCE: f64 = 0.85;
const CAREER_PAGE_PATTERN_IMPORTANCE: f64 = 0.9;

/// 单个工作流的可变状态（只在注册表锁内修改）
struct ActiveWorkflow {
    progress: WorkflowProgress,
    supervisor: SessionSupervisor,
    started: Instant,
    _permit: Option<OwnedSemaphorePermit>,
    artifacts: Artifacts,
}

#[derive(Default)]
struct Artifacts {
    career_pages: Vec<DiscoveredPage>,
    jobs: Vec<JobListing>,
    matches: Vec<JobMatch>,
    match_summary: Option<MatchSummary>,
    agent_stats: BTreeMap<String, AgentStats>,
    recommendations: Vec<JobMatch>,
}

impl ActiveWorkflow {
    fn new(workflow_id: &str, supervisor: SessionSupervisor) -> Self {
        Self {
            progress: WorkflowProgress::new(workflow_id),
            supervisor,
            started: Instant::now(),
            _permit: None,
            artifacts: Artifacts::default(),
        }
    }

    fn into_result(self, outcome: Result<(), StageError>) -> JobDiscoveryResult {
        let ActiveWorkflow {
            mut progress,
            started,
            artifacts,
            ..
        } = self;

        let failed_stage = match outcome {
            Ok(()) => {
                progress.finish();
                None
            }
            Err(e) => {
                let stage = e.stage;
                progress.fail(e);
                Some(stage)
            }
        };

        let summary = ResultSummary {
            total_pages: artifacts.career_pages.len(),
            total_jobs: artifacts.jobs.len(),
            total_matches: artifacts.matches.len(),
            average_score: artifacts
                .match_summary
                .as_ref()
                .map(|s| s.average_score)
                .unwrap_or(0.0),
        };

        JobDiscoveryResult {
            workflow_id: progress.workflow_id.clone(),
            success: failed_stage.is_none(),
            failed_stage,
            progress,
            career_pages: artifacts.career_pages,
            jobs: artifacts.jobs,
            matches: artifacts.matches,
            summary,
            execution_time_secs: started.elapsed().as_secs_f64(),
            agent_stats: artifacts.agent_stats,
            recommendations: artifacts.recommendations,
        }
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<WorkflowId, ActiveWorkflow>,
    completed: HashMap<WorkflowId, JobDiscoveryResult>,
    /// completed 的插入顺序
    completed_order: VecDeque<WorkflowId>,
}

impl Registry {
    /// 记录终态结果；超出容量时丢弃最早完成的
    fn retire(&mut self, workflow_id: &str, result: JobDiscoveryResult, capacity: usize) {
        if self
            .completed
            .insert(workflow_id.to_string(), result)
            .is_none()
        {
            self.completed_order.push_back(workflow_id.to_string());
        }
        while self.completed.len() > capacity.max(1) {
            let Some(oldest) = self.completed_order.pop_front() else {
                break;
            };
            self.completed.remove(&oldest);
        }
    }

    fn take(&mut self, workflow_id: &str) -> Option<JobDiscoveryResult> {
        let result = self.completed.remove(workflow_id)?;
        self.completed_order.retain(|id| id != workflow_id);
        Some(result)
    }
}

/// 阶段间传递的解析结果
struct Resolved {
    company: Record,
    preferences: UserPreferences,
}

pub struct WorkflowOrchestrator {
    config: AppConfig,
    store: Arc<dyn DataAccess>,
    agents: AgentSet,
    registry: Mutex<Registry>,
    progress: ProgressHub,
    slots: Arc<Semaphore>,
    pattern_store: Option<PatternStore>,
    pattern_lock: AsyncMutex<()>,
}

impl WorkflowOrchestrator {
    pub fn new(config: AppConfig, store: Arc<dyn DataAccess>, agents: AgentSet) -> Self {
        let slots = Arc::new(Semaphore::new(config.orchestrator.max_concurrent_workflows.max(1)));
        let pattern_store = config
            .orchestrator
            .pattern_store_path
            .as_ref()
            .map(PatternStore::new);
        Self {
            config,
            store,
            agents,
            registry: Mutex::new(Registry::default()),
            progress: ProgressHub::new(),
            slots,
            pattern_store,
            pattern_lock: AsyncMutex::new(()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_progress_subscriber(&self, subscriber: Arc<dyn ProgressSubscriber>) {
        self.progress.register(subscriber);
    }

    /// 同步闭包形式的订阅
    pub fn on_progress<F>(&self, f: F)
    where
        F: Fn(WorkflowProgress) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.progress.register(subscriber_fn(f));
    }

    /// 运行中的工作流快照；终态后返回 None
    pub async fn get_status(&self, workflow_id: &str) -> Option<WorkflowProgress> {
        self.registry()
            .active
            .get(workflow_id)
            .map(|w| w.progress.clone())
    }

    /// 终态结果；多次调用返回同一结果（直到被 take_result 取走或按容量淘汰）
    pub async fn get_result(&self, workflow_id: &str) -> Option<JobDiscoveryResult> {
        self.registry().completed.get(workflow_id).cloned()
    }

    /// 取走终态结果，之后 get_result 返回 None
    pub async fn take_result(&self, workflow_id: &str) -> Option<JobDiscoveryResult> {
        self.registry().take(workflow_id)
    }

    pub async fn active_workflows(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self.registry().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 取消运行中的工作流：记录取消错误、折叠为终态、释放并发槽位。未知 id 返回 false
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        self.abort(workflow_id, CancelReason::Requested).await
    }

    async fn abort(&self, workflow_id: &str, reason: CancelReason) -> bool {
        let (snapshot, reason) = {
            let mut registry = self.registry();
            let Some(entry) = registry.active.remove(workflow_id) else {
                return false;
            };
            entry.supervisor.cancel(reason.clone());
            let reason = entry.supervisor.reason().unwrap_or(reason);
            let error = StageError::new(entry.progress.stage, reason.kind(), reason.message());
            let result = entry.into_result(Err(error));
            let snapshot = result.progress.clone();
            registry.retire(workflow_id, result, self.config.orchestrator.completed_capacity);
            (snapshot, reason)
        };
        tracing::info!(workflow_id, reason = ?reason, "Workflow cancelled");
        self.progress.publish(snapshot).await;
        true
    }

    /// 在调用方任务中运行到终态
    pub async fn start_workflow(&self, request: DiscoveryRequest) -> JobDiscoveryResult {
        let workflow_id = uuid::Uuid::new_v4().to_string();
        let supervisor = self.register(&workflow_id);
        self.run(workflow_id, request, supervisor).await
    }

    /// 后台运行；返回时工作流已在 active 注册表中，可立即 get_status / cancel
    pub fn spawn_workflow(
        self: &Arc<Self>,
        request: DiscoveryRequest,
    ) -> (WorkflowId, JoinHandle<JobDiscoveryResult>) {
        let workflow_id = uuid::Uuid::new_v4().to_string();
        let supervisor = self.register(&workflow_id);
        let this = Arc::clone(self);
        let id = workflow_id.clone();
        let handle = tokio::spawn(async move { this.run(id, request, supervisor).await });
        (workflow_id, handle)
    }

    fn register(&self, workflow_id: &str) -> SessionSupervisor {
        let supervisor = SessionSupervisor::new();
        self.registry().active.insert(
            workflow_id.to_string(),
            ActiveWorkflow::new(workflow_id, supervisor.clone()),
        );
        supervisor
    }

    async fn run(
        &self,
        workflow_id: WorkflowId,
        request: DiscoveryRequest,
        supervisor: SessionSupervisor,
    ) -> JobDiscoveryResult {
        let token = supervisor.cancel_token();
        let limit = request.max_execution_time().unwrap_or_else(|| {
            Duration::from_secs(self.config.orchestrator.default_max_execution_secs)
        });
        tracing::info!(
            workflow_id = %workflow_id,
            company_id = %request.company_id,
            user_id = %request.user_id,
            max_execution_ms = limit.as_millis() as u64,
            "Workflow started"
        );

        // 截止时间覆盖排队等待与全部阶段
        let pipeline = async {
            let permit = Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|_| {
                    StageError::new(
                        WorkflowStage::Initialization,
                        ErrorKind::Validation,
                        "orchestrator is shutting down",
                    )
                })?;
            self.with_active(&workflow_id, |w| w._permit = Some(permit));

            let mut memory = MemoryManager::new(&self.config.memory).with_owner(ORCHESTRATOR_NAME);
            self.restore_patterns(&workflow_id, &mut memory).await;
            let outcome = self
                .run_pipeline(&workflow_id, &request, &supervisor, &mut memory)
                .await;
            if outcome.is_ok() {
                memory.consolidate();
                self.persist_patterns(&workflow_id, &memory).await;
            }
            outcome
        };

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(self.cancellation_error(&workflow_id, &supervisor)),
            r = tokio::time::timeout(limit, pipeline) => match r {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(workflow_id = %workflow_id, "Workflow deadline exceeded");
                    self.abort(&workflow_id, CancelReason::TimedOut).await;
                    Err(self.cancellation_error(&workflow_id, &supervisor))
                }
            },
        };

        self.finish(&workflow_id, outcome).await
    }

    fn cancellation_error(&self, workflow_id: &str, supervisor: &SessionSupervisor) -> StageError {
        let reason = supervisor.reason().unwrap_or(CancelReason::Requested);
        let stage = self
            .with_active(workflow_id, |w| w.progress.stage)
            .unwrap_or(WorkflowStage::Initialization);
        StageError::new(stage, reason.kind(), reason.message())
    }

    /// 折叠为终态（若已被 cancel / 超时折叠则返回已有结果）
    async fn finish(&self, workflow_id: &str, outcome: Result<(), StageError>) -> JobDiscoveryResult {
        let result = {
            let mut registry = self.registry();
            if let Some(existing) = registry.completed.get(workflow_id) {
                return existing.clone();
            }
            match registry.active.remove(workflow_id) {
                Some(entry) => {
                    let result = entry.into_result(outcome);
                    registry.retire(
                        workflow_id,
                        result.clone(),
                        self.config.orchestrator.completed_capacity,
                    );
                    result
                }
                // 已被 cancel / 超时折叠，且结果已被取走或淘汰
                None => {
                    return ActiveWorkflow::new(workflow_id, SessionSupervisor::new())
                        .into_result(outcome);
                }
            }
        };

        match result.first_error() {
            None => tracing::info!(
                workflow_id,
                jobs = result.summary.total_jobs,
                matches = result.summary.total_matches,
                elapsed_secs = result.execution_time_secs,
                "Workflow completed"
            ),
            Some(e) => tracing::warn!(
                workflow_id,
                stage = %e.stage,
                kind = ?e.kind,
                error = %e.message,
                "Workflow failed"
            ),
        }
        self.progress.publish(result.progress.clone()).await;
        result
    }

    fn with_active<R>(&self, workflow_id: &str, f: impl FnOnce(&mut ActiveWorkflow) -> R) -> Option<R> {
        self.registry().active.get_mut(workflow_id).map(f)
    }

    /// 进入阶段并发布快照；工作流已不在 active 中时返回取消错误
    async fn enter_stage(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        operation: &str,
    ) -> Result<(), StageError> {
        self.advance(workflow_id, stage, |p| p.enter(stage, operation))
            .await
    }

    async fn advance(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        f: impl FnOnce(&mut WorkflowProgress),
    ) -> Result<(), StageError> {
        let snapshot = self
            .with_active(workflow_id, |w| {
                f(&mut w.progress);
                w.progress.clone()
            })
            .ok_or_else(|| {
                StageError::new(stage, ErrorKind::Cancelled, "workflow is no longer active")
            })?;
        tracing::info!(
            workflow_id,
            stage = %snapshot.stage,
            progress = snapshot.progress_percentage,
            operation = %snapshot.current_operation,
            "Workflow progress"
        );
        self.progress.publish(snapshot).await;
        Ok(())
    }

    fn complete_stage(&self, workflow_id: &str, stage: WorkflowStage, started: Instant) {
        self.with_active(workflow_id, |w| w.progress.complete_stage(stage, started.elapsed()));
    }

    fn warn(&self, workflow_id: &str, warning: String) {
        tracing::warn!(workflow_id, warning = %warning, "Workflow warning");
        self.with_active(workflow_id, |w| w.progress.warn(warning));
    }

    async fn run_pipeline(
        &self,
        workflow_id: &str,
        request: &DiscoveryRequest,
        supervisor: &SessionSupervisor,
        memory: &mut MemoryManager,
    ) -> Result<(), StageError> {
        // Initialization
        let stage = WorkflowStage::Initialization;
        let t = Instant::now();
        self.enter_stage(workflow_id, stage, "resolving company and user records")
            .await?;
        let resolved = self.resolve(request).await?;
        memory.add_conversation(
            Role::System,
            format!(
                "discovering jobs at {} for user {}",
                request.company_id, request.user_id
            ),
        );
        self.complete_stage(workflow_id, stage, t);

        // CareerDiscovery
        let stage = WorkflowStage::CareerDiscovery;
        let t = Instant::now();
        self.enter_stage(workflow_id, stage, "locating career page").await?;
        let page = self
            .discover_career_page(workflow_id, request, &resolved, supervisor, memory)
            .await?;
        let url = page.url.clone();
        self.with_active(workflow_id, |w| w.artifacts.career_pages.push(page));
        self.complete_stage(workflow_id, stage, t);

        // CareerVerification
        let stage = WorkflowStage::CareerVerification;
        let t = Instant::now();
        self.enter_stage(workflow_id, stage, "verifying career page").await?;
        let task = AgentTask::new()
            .with(keys::COMPANY_ID, request.company_id.as_str())
            .with(keys::CAREER_PAGE_URL, url.as_str());
        self.call_stage_agent(workflow_id, stage, &self.agents.verification, task, supervisor, memory)
            .await?;
        self.complete_stage(workflow_id, stage, t);

        // JobExtraction
        let stage = WorkflowStage::JobExtraction;
        let t = Instant::now();
        self.enter_stage(workflow_id, stage, "extracting job listings").await?;
        let task = AgentTask::new()
            .with(keys::COMPANY_ID, request.company_id.as_str())
            .with(keys::CAREER_PAGE_URL, url.as_str());
        let mut outcome = self
            .call_stage_agent(workflow_id, stage, &self.agents.extraction, task, supervisor, memory)
            .await?;
        let mut jobs: Vec<JobListing> = take_payload(&mut outcome, keys::JOBS, stage)?.unwrap_or_default();
        self.persist_jobs(&request.company_id, &mut jobs, stage).await?;
        self.with_active(workflow_id, |w| w.artifacts.jobs = jobs.clone());
        self.complete_stage(workflow_id, stage, t);

        // JobMatching
        let stage = WorkflowStage::JobMatching;
        let t = Instant::now();
        self.enter_stage(workflow_id, stage, "matching jobs against preferences")
            .await?;
        let task = AgentTask::new()
            .with(keys::USER_ID, request.user_id.as_str())
            .with(keys::JOBS, to_value(&jobs, stage)?)
            .with(keys::PREFERENCES, to_value(&resolved.preferences, stage)?);
        let mut outcome = self
            .call_stage_agent(workflow_id, stage, &self.agents.matching, task, supervisor, memory)
            .await?;
        let mut matches: Vec<JobMatch> =
            take_payload(&mut outcome, keys::MATCHES, stage)?.unwrap_or_default();
        let match_summary: Option<MatchSummary> = take_payload(&mut outcome, keys::SUMMARY, stage)?;
        for m in matches.iter_mut() {
            if m.job_id.is_none() {
                m.job_id = jobs.get(m.job_index).and_then(|j| j.id.clone());
            }
        }
        self.advance(workflow_id, stage, |p| {
            p.advance_to(PERSIST_MATCHES_PERCENTAGE, "saving matches")
        })
        .await?;
        self.persist_matches(request, &matches, stage).await?;
        self.with_active(workflow_id, |w| {
            w.artifacts.matches = matches.clone();
            w.artifacts.match_summary = match_summary;
        });
        self.complete_stage(workflow_id, stage, t);

        // ResultCompilation
        let stage = WorkflowStage::ResultCompilation;
        let t = Instant::now();
        self.enter_stage(workflow_id, stage, "ranking recommendations").await?;
        let recommendations =
            rank_recommendations(&matches, self.config.orchestrator.top_recommendations);
        memory.add_conversation(
            Role::System,
            format!(
                "{} jobs, {} matches, {} recommended",
                jobs.len(),
                matches.len(),
                recommendations.len()
            ),
        );
        self.with_active(workflow_id, |w| w.artifacts.recommendations = recommendations);
        self.complete_stage(workflow_id, stage, t);

        Ok(())
    }

    /// 校验请求：公司与用户都必须存在
    async fn resolve(&self, request: &DiscoveryRequest) -> Result<Resolved, StageError> {
        let stage = WorkflowStage::Initialization;
        let company = self
            .fetch_required(EntityKind::Company, &request.company_id)
            .await?;
        let user = self.fetch_required(EntityKind::User, &request.user_id).await?;
        let preferences = match user.get(keys::PREFERENCES) {
            None | Some(Value::Null) => UserPreferences::default(),
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
                StageError::new(
                    stage,
                    ErrorKind::Validation,
                    format!("user {} has malformed preferences: {e}", request.user_id),
                )
            })?,
        };
        Ok(Resolved {
            company,
            preferences,
        })
    }

    async fn fetch_required(&self, kind: EntityKind, id: &str) -> Result<Record, StageError> {
        let stage = WorkflowStage::Initialization;
        match self.store.fetch_entity(kind, id).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(StageError::new(
                stage,
                ErrorKind::Validation,
                format!("{kind} {id} not found"),
            )),
            Err(e) => Err(StageError::new(
                stage,
                ErrorKind::DataAccess,
                format!("failed to fetch {kind} {id}: {e}"),
            )),
        }
    }

    /// 已知职业页（公司记录或已学到的模式）且策略允许时跳过发现 Agent
    async fn discover_career_page(
        &self,
        workflow_id: &str,
        request: &DiscoveryRequest,
        resolved: &Resolved,
        supervisor: &SessionSupervisor,
        memory: &mut MemoryManager,
    ) -> Result<DiscoveredPage, StageError> {
        let stage = WorkflowStage::CareerDiscovery;
        let pattern_name = format!("career_page:{}", request.company_id);
        let on_file = resolved
            .company
            .get(keys::CAREER_PAGE_URL)
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let learned = memory
            .pattern(&pattern_name)
            .and_then(|p| p.content.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let skip = self.config.orchestrator.skip_known_career_pages && !request.force_refresh;
        if skip {
            if let Some(url) = on_file.or(learned) {
                tracing::info!(workflow_id, url = %url, "Career page on file, skipping discovery");
                self.with_active(workflow_id, |w| {
                    w.progress.current_operation = "using career page on file".to_string()
                });
                return Ok(DiscoveredPage {
                    url,
                    confidence: 1.0,
                    from_record: true,
                });
            }
        }

        let mut task = AgentTask::new()
            .with(keys::COMPANY_ID, request.company_id.as_str())
            .with(keys::FORCE_REFRESH, request.force_refresh);
        if let Some(name) = resolved.company.get("name") {
            task = task.with("company_name", name.clone());
        }
        let mut outcome = self
            .call_stage_agent(workflow_id, stage, &self.agents.discovery, task, supervisor, memory)
            .await?;
        let url: String = take_payload(&mut outcome, keys::CAREER_PAGE_URL, stage)?.ok_or_else(|| {
            StageError::new(stage, ErrorKind::Agent, "discovery agent returned no career page")
        })?;
        let confidence: f64 = take_payload(&mut outcome, keys::CONFIDENCE, stage)?.unwrap_or(0.5);

        memory.learn_pattern(
            pattern_name,
            json!({ "url": url, "company_id": request.company_id }),
            CAREER_PAGE_PATTERN_IMPORTANCE,
            confidence,
        );

        let mut patch = Map::new();
        patch.insert(keys::CAREER_PAGE_URL.to_string(), Value::String(url.clone()));
        self.store
            .update_entity(EntityKind::Company, &request.company_id, patch)
            .await
            .map_err(|e| {
                StageError::new(
                    stage,
                    ErrorKind::DataAccess,
                    format!("failed to save career page: {e}"),
                )
            })?;

        Ok(DiscoveredPage {
            url,
            confidence,
            from_record: false,
        })
    }

    /// 调用阶段 Agent；success=false 转为该阶段的 StageError
    async fn call_stage_agent(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        agent: &Arc<dyn CapabilityAgent>,
        task: AgentTask,
        supervisor: &SessionSupervisor,
        memory: &mut MemoryManager,
    ) -> Result<AgentOutcome, StageError> {
        let name = agent.name().to_string();
        tracing::debug!(workflow_id, %stage, agent = %name, "Invoking capability agent");

        let runner = Arc::clone(agent);
        let token = supervisor.child_token();
        let handle = tokio::spawn(async move { runner.run(task, token).await });
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => AgentOutcome::failed(
                format!("agent {name} panicked: {e}"),
                AgentStats {
                    agent: name.clone(),
                    ..AgentStats::default()
                },
            ),
        };

        let stats = outcome.stats.clone();
        self.with_active(workflow_id, |w| {
            w.artifacts.agent_stats.insert(name.clone(), stats);
        });

        if outcome.success {
            memory.add_observation(
                json!({ "stage": stage, "agent": name, "success": true }),
                MemoryKind::Result,
                STAGE_SUCCESS_IMPORTANCE,
                [stage.as_str(), name.as_str()],
                1.0,
            );
            Ok(outcome)
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "agent reported failure without error".to_string());
            memory.add_observation(
                json!({ "stage": stage, "agent": name, "success": false, "error": error }),
                MemoryKind::Failure,
                STAGE_FAILURE_IMPORTANCE,
                [stage.as_str(), name.as_str(), "failure"],
                1.0,
            );
            Err(StageError::new(stage, ErrorKind::Agent, format!("{name}: {error}")))
        }
    }

    /// 保存职位并回填分配的 id
    async fn persist_jobs(
        &self,
        company_id: &str,
        jobs: &mut [JobListing],
        stage: WorkflowStage,
    ) -> Result<(), StageError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut records = Vec::with_capacity(jobs.len());
        for job in jobs.iter() {
            let mut record = match to_value(job, stage)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            record.insert(keys::COMPANY_ID.to_string(), Value::String(company_id.to_string()));
            records.push(record);
        }
        let ids = self
            .store
            .save_results(EntityKind::JobListing, records)
            .await
            .map_err(|e| {
                StageError::new(stage, ErrorKind::DataAccess, format!("failed to save jobs: {e}"))
            })?;
        for (job, id) in jobs.iter_mut().zip(ids) {
            job.id = Some(id);
        }
        Ok(())
    }

    async fn persist_matches(
        &self,
        request: &DiscoveryRequest,
        matches: &[JobMatch],
        stage: WorkflowStage,
    ) -> Result<(), StageError> {
        if matches.is_empty() {
            return Ok(());
        }
        let mut links = Vec::with_capacity(matches.len());
        for m in matches {
            links.push(DerivedLink {
                user_id: request.user_id.clone(),
                company_id: request.company_id.clone(),
                job_id: m.job_id.clone(),
                score: m.overall_score,
                detail: to_value(m, stage)?,
            });
        }
        self.store.save_derived_links(links).await.map_err(|e| {
            StageError::new(stage, ErrorKind::DataAccess, format!("failed to save matches: {e}"))
        })?;
        Ok(())
    }

    async fn restore_patterns(&self, workflow_id: &str, memory: &mut MemoryManager) {
        let Some(store) = self.pattern_store.as_ref() else {
            return;
        };
        let restored = {
            let _guard = self.pattern_lock.lock().await;
            store.restore_into(memory).await
        };
        match restored {
            Ok(n) => tracing::debug!(workflow_id, restored = n, "Restored learned patterns"),
            Err(e) => self.warn(workflow_id, format!("failed to load learned patterns: {e}")),
        }
    }

    async fn persist_patterns(&self, workflow_id: &str, memory: &MemoryManager) {
        let Some(store) = self.pattern_store.as_ref() else {
            return;
        };
        let saved = {
            let _guard = self.pattern_lock.lock().await;
            store
                .save(memory, self.config.orchestrator.pattern_persist_min_importance)
                .await
        };
        match saved {
            Ok(n) => tracing::debug!(workflow_id, saved = n, "Persisted learned patterns"),
            Err(e) => self.warn(workflow_id, format!("failed to persist learned patterns: {e}")),
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T, stage: WorkflowStage) -> Result<Value, StageError> {
    serde_json::to_value(value)
        .map_err(|e| StageError::new(stage, ErrorKind::Agent, format!("serialization failed: {e}")))
}

/// 取出 Agent 载荷中的键；键缺失返回 Ok(None)，格式错误是该阶段的 Agent 错误
fn take_payload<T: serde::de::DeserializeOwned>(
    outcome: &mut AgentOutcome,
    key: &str,
    stage: WorkflowStage,
) -> Result<Option<T>, StageError> {
    outcome.take(key).transpose().map_err(|e| {
        StageError::new(
            stage,
            ErrorKind::Agent,
            format!("agent returned malformed {key}: {e}"),
        )
    })
}
