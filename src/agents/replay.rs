//! 基于固定站点数据的能力 Agent（发现 / 验证 / 提取）
//!
//! 每个公司对应一份 ReplaySite：职业页地址、可见职位、前若干次分页加载的瞬时失败与模拟延迟。
//! 三个 Agent 都实现完整的控制循环，因此重试、步数预算、取消与记忆记录的行为与真实 Agent 一致。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agents::payload::{keys, JobListing};
use crate::agents::{matching_agent, AgentSet, CapabilityAgent, LoopAgent};
use crate::config::{EngineSection, MemorySection};
use crate::core::AgentError;
use crate::engine::{ActionKind, ActionResult, AgentAction, AgentObservation, AgentTask, ControlLoop};
use crate::memory::{MemoryManager, WorkingKey};

pub const DISCOVERY_NAME: &str = "replay_discovery";
pub const VERIFICATION_NAME: &str = "replay_verifier";
pub const EXTRACTION_NAME: &str = "replay_extractor";

/// 每次提取动作读取的职位数
pub const PAGE_SIZE: usize = 5;

const FINISH_ACTION: &str = "finish";

/// 一个公司的站点数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaySite {
    #[serde(default)]
    pub career_page_url: Option<String>,
    #[serde(default)]
    pub jobs: Vec<JobListing>,
    /// 前 N 次分页加载返回网络错误
    #[serde(default)]
    pub transient_failures: u32,
    /// 每个动作的模拟耗时（毫秒）
    #[serde(default)]
    pub latency_ms: u64,
}

impl ReplaySite {
    pub fn new(career_page_url: Option<&str>, jobs: Vec<JobListing>) -> Self {
        Self {
            career_page_url: career_page_url.map(str::to_string),
            jobs,
            transient_failures: 0,
            latency_ms: 0,
        }
    }

    pub fn with_transient_failures(mut self, n: u32) -> Self {
        self.transient_failures = n;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

#[derive(Debug)]
struct ReplayEntry {
    site: ReplaySite,
    remaining_failures: AtomicU32,
}

impl ReplayEntry {
    /// 消耗一次瞬时失败额度；返回本次是否应失败
    fn take_failure(&self) -> bool {
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// company_id → 站点数据
#[derive(Debug, Clone, Default)]
pub struct ReplayCatalog {
    sites: HashMap<String, Arc<ReplayEntry>>,
}

impl ReplayCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(mut self, company_id: impl Into<String>, site: ReplaySite) -> Self {
        self.insert(company_id, site);
        self
    }

    pub fn insert(&mut self, company_id: impl Into<String>, site: ReplaySite) {
        let remaining_failures = AtomicU32::new(site.transient_failures);
        self.sites.insert(
            company_id.into(),
            Arc::new(ReplayEntry {
                site,
                remaining_failures,
            }),
        );
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    fn entry_for(&self, task: &AgentTask) -> Result<Arc<ReplayEntry>, AgentError> {
        let company = task
            .get_str(keys::COMPANY_ID)
            .ok_or_else(|| AgentError::InvalidTask("missing company_id".to_string()))?;
        self.sites
            .get(company)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("no site data for company {company}")))
    }

    pub fn discovery_agent(&self, engine: EngineSection, limits: MemorySection) -> Arc<dyn CapabilityAgent> {
        let catalog = self.clone();
        Arc::new(
            LoopAgent::new(DISCOVERY_NAME, move |task: &AgentTask| -> Result<ReplayDiscovery, AgentError> {
                Ok(ReplayDiscovery::new(catalog.entry_for(task)?))
            })
            .with_engine(engine)
            .with_memory_limits(limits),
        )
    }

    /// require_listings：只有看到至少一个职位才判定验证通过
    pub fn verification_agent(
        &self,
        engine: EngineSection,
        limits: MemorySection,
        require_listings: bool,
    ) -> Arc<dyn CapabilityAgent> {
        let catalog = self.clone();
        Arc::new(
            LoopAgent::new(VERIFICATION_NAME, move |task: &AgentTask| -> Result<ReplayVerifier, AgentError> {
                let url = task
                    .get_str(keys::CAREER_PAGE_URL)
                    .ok_or_else(|| AgentError::InvalidTask("missing career_page_url".to_string()))?
                    .to_string();
                Ok(ReplayVerifier::new(catalog.entry_for(task)?, url, require_listings))
            })
            .with_engine(engine)
            .with_memory_limits(limits),
        )
    }

    pub fn extraction_agent(&self, engine: EngineSection, limits: MemorySection) -> Arc<dyn CapabilityAgent> {
        let catalog = self.clone();
        Arc::new(
            LoopAgent::new(EXTRACTION_NAME, move |task: &AgentTask| -> Result<ReplayExtractor, AgentError> {
                Ok(ReplayExtractor::new(catalog.entry_for(task)?))
            })
            .with_engine(engine)
            .with_memory_limits(limits),
        )
    }

    /// 三个回放 Agent + 内置匹配 Agent
    pub fn agent_set(&self, engine: &EngineSection, limits: &MemorySection) -> AgentSet {
        AgentSet {
            discovery: self.discovery_agent(engine.clone(), limits.clone()),
            verification: self.verification_agent(engine.clone(), limits.clone(), true),
            extraction: self.extraction_agent(engine.clone(), limits.clone()),
            matching: Arc::new(matching_agent(engine.clone(), limits.clone())),
        }
    }
}

async fn simulate_latency(entry: &ReplayEntry) {
    let latency = entry.site.latency();
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

// ---------- 发现 ----------

#[derive(Debug, Serialize)]
pub struct DiscoveryOutput {
    pub career_page_url: String,
    pub confidence: f64,
}

pub struct ReplayDiscovery {
    entry: Arc<ReplayEntry>,
    found: Option<(String, f64)>,
}

impl ReplayDiscovery {
    fn new(entry: Arc<ReplayEntry>) -> Self {
        Self { entry, found: None }
    }
}

#[async_trait]
impl ControlLoop for ReplayDiscovery {
    type Context = String;
    type Output = DiscoveryOutput;

    fn name(&self) -> &str {
        DISCOVERY_NAME
    }

    async fn perceive(&mut self, _memory: &MemoryManager) -> Result<AgentObservation, AgentError> {
        let url = self
            .entry
            .site
            .career_page_url
            .clone()
            .ok_or_else(|| AgentError::NotFound("no career page found".to_string()))?;
        Ok(AgentObservation::new("candidate_link", 0.9).with("url", url))
    }

    fn analyze(
        &self,
        observation: &AgentObservation,
        memory: &mut MemoryManager,
    ) -> Result<String, AgentError> {
        let url = observation
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Analysis("candidate without url".into()))?;
        memory.set_working(WorkingKey::Candidates, json!([url]), 0.6, [DISCOVERY_NAME]);
        Ok(url.to_string())
    }

    fn decide(&self, url: String) -> Result<AgentAction, AgentError> {
        Ok(AgentAction::new(ActionKind::Navigate, 0.9)
            .with_param("url", url)
            .with_reasoning("career link found on landing page"))
    }

    async fn act(
        &mut self,
        action: &AgentAction,
        _memory: &mut MemoryManager,
    ) -> Result<ActionResult, AgentError> {
        simulate_latency(&self.entry).await;
        let url = action
            .param_str("url")
            .ok_or_else(|| AgentError::Action("navigate without url".into()))?;
        self.found = Some((url.to_string(), action.confidence));
        Ok(ActionResult::ok(json!({ "url": url, "status": 200 })))
    }

    fn is_complete(&self, result: &ActionResult) -> bool {
        result.success
    }

    fn compile_result(&mut self) -> Result<DiscoveryOutput, AgentError> {
        let (career_page_url, confidence) = self
            .found
            .take()
            .ok_or_else(|| AgentError::Compilation("no page navigated".into()))?;
        Ok(DiscoveryOutput {
            career_page_url,
            confidence,
        })
    }

    fn on_restart(&mut self) {
        self.found = None;
    }
}

// ---------- 验证 ----------

#[derive(Debug)]
pub enum VerifyStep {
    Confirm { visible_jobs: usize },
    WaitForListings,
}

#[derive(Debug, Serialize)]
pub struct VerificationOutput {
    pub career_page_url: String,
    pub verified: bool,
    pub visible_jobs: usize,
}

pub struct ReplayVerifier {
    entry: Arc<ReplayEntry>,
    url: String,
    require_listings: bool,
    visible_jobs: Option<usize>,
}

impl ReplayVerifier {
    fn new(entry: Arc<ReplayEntry>, url: String, require_listings: bool) -> Self {
        Self {
            entry,
            url,
            require_listings,
            visible_jobs: None,
        }
    }
}

#[async_trait]
impl ControlLoop for ReplayVerifier {
    type Context = VerifyStep;
    type Output = VerificationOutput;

    fn name(&self) -> &str {
        VERIFICATION_NAME
    }

    async fn perceive(&mut self, _memory: &MemoryManager) -> Result<AgentObservation, AgentError> {
        Ok(AgentObservation::new("career_page", 1.0)
            .with("url", self.url.clone())
            .with("visible_jobs", self.entry.site.jobs.len()))
    }

    fn analyze(
        &self,
        observation: &AgentObservation,
        _memory: &mut MemoryManager,
    ) -> Result<VerifyStep, AgentError> {
        let visible_jobs = observation
            .get("visible_jobs")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        if visible_jobs > 0 || !self.require_listings {
            Ok(VerifyStep::Confirm { visible_jobs })
        } else {
            Ok(VerifyStep::WaitForListings)
        }
    }

    fn decide(&self, context: VerifyStep) -> Result<AgentAction, AgentError> {
        match context {
            VerifyStep::Confirm { visible_jobs } => Ok(AgentAction::new(ActionKind::Analyze, 0.95)
                .with_param("visible_jobs", visible_jobs)
                .with_reasoning("page lists job openings")),
            VerifyStep::WaitForListings => Ok(AgentAction::new(ActionKind::Wait, 0.3)
                .with_reasoning("no listings visible yet")),
        }
    }

    async fn act(
        &mut self,
        action: &AgentAction,
        _memory: &mut MemoryManager,
    ) -> Result<ActionResult, AgentError> {
        simulate_latency(&self.entry).await;
        match action.kind {
            ActionKind::Analyze => {
                let visible_jobs = action
                    .params
                    .get("visible_jobs")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
                self.visible_jobs = Some(visible_jobs);
                Ok(ActionResult::ok(json!({ (keys::VERIFIED): true, "visible_jobs": visible_jobs })))
            }
            ActionKind::Wait => Ok(ActionResult::ok(json!({ (keys::VERIFIED): false }))),
            ref other => Err(AgentError::Action(format!("unsupported action: {}", other.label()))),
        }
    }

    fn is_complete(&self, result: &ActionResult) -> bool {
        result
            .data
            .get(keys::VERIFIED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn compile_result(&mut self) -> Result<VerificationOutput, AgentError> {
        let visible_jobs = self
            .visible_jobs
            .ok_or_else(|| AgentError::Compilation("page never confirmed".into()))?;
        Ok(VerificationOutput {
            career_page_url: self.url.clone(),
            verified: true,
            visible_jobs,
        })
    }

    fn on_restart(&mut self) {
        self.visible_jobs = None;
    }
}

// ---------- 提取 ----------

#[derive(Debug)]
pub enum ExtractStep {
    Page(usize),
    Finish,
}

#[derive(Debug, Serialize)]
pub struct ExtractionOutput {
    pub jobs: Vec<JobListing>,
}

pub struct ReplayExtractor {
    entry: Arc<ReplayEntry>,
    next_page: usize,
    collected: Vec<JobListing>,
}

impl ReplayExtractor {
    fn new(entry: Arc<ReplayEntry>) -> Self {
        Self {
            entry,
            next_page: 0,
            collected: Vec::new(),
        }
    }

    fn page_count(&self) -> usize {
        self.entry.site.jobs.len().div_ceil(PAGE_SIZE)
    }
}

#[async_trait]
impl ControlLoop for ReplayExtractor {
    type Context = ExtractStep;
    type Output = ExtractionOutput;

    fn name(&self) -> &str {
        EXTRACTION_NAME
    }

    async fn perceive(&mut self, _memory: &MemoryManager) -> Result<AgentObservation, AgentError> {
        Ok(AgentObservation::new("listing_index", 1.0)
            .with("next_page", self.next_page)
            .with("pages", self.page_count())
            .with("collected", self.collected.len()))
    }

    fn analyze(
        &self,
        observation: &AgentObservation,
        memory: &mut MemoryManager,
    ) -> Result<ExtractStep, AgentError> {
        let next = observation
            .get("next_page")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| AgentError::Analysis("observation without page cursor".into()))?
            as usize;
        memory.set_working(WorkingKey::Cursor, json!(next), 0.3, [EXTRACTION_NAME]);
        if next < self.page_count() {
            Ok(ExtractStep::Page(next))
        } else {
            Ok(ExtractStep::Finish)
        }
    }

    fn decide(&self, context: ExtractStep) -> Result<AgentAction, AgentError> {
        match context {
            ExtractStep::Page(page) => Ok(AgentAction::new(ActionKind::Extract, 0.85).with_param("page", page)),
            ExtractStep::Finish => Ok(AgentAction::new(ActionKind::Custom(FINISH_ACTION.into()), 1.0)
                .with_reasoning("all listing pages read")),
        }
    }

    async fn act(
        &mut self,
        action: &AgentAction,
        memory: &mut MemoryManager,
    ) -> Result<ActionResult, AgentError> {
        match &action.kind {
            ActionKind::Extract => {
                simulate_latency(&self.entry).await;
                let page = action
                    .params
                    .get("page")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| AgentError::Action("extract without page".into()))?
                    as usize;
                if self.entry.take_failure() {
                    return Err(AgentError::Network(format!(
                        "connection reset while loading page {page}"
                    )));
                }
                let jobs: Vec<JobListing> = self
                    .entry
                    .site
                    .jobs
                    .iter()
                    .skip(page * PAGE_SIZE)
                    .take(PAGE_SIZE)
                    .cloned()
                    .collect();
                let count = jobs.len();
                self.collected.extend(jobs);
                self.next_page = page + 1;
                memory.set_working(
                    WorkingKey::Collected,
                    json!(self.collected.len()),
                    0.4,
                    [EXTRACTION_NAME],
                );
                Ok(ActionResult::ok(json!({ "page": page, "count": count, "done": false })))
            }
            ActionKind::Custom(name) if name == FINISH_ACTION => Ok(ActionResult::ok(json!({ "done": true }))),
            other => Err(AgentError::Action(format!("unsupported action: {}", other.label()))),
        }
    }

    fn is_complete(&self, result: &ActionResult) -> bool {
        result.data.get("done").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    fn compile_result(&mut self) -> Result<ExtractionOutput, AgentError> {
        Ok(ExtractionOutput {
            jobs: std::mem::take(&mut self.collected),
        })
    }

    fn step_budget(&self) -> Option<u32> {
        Some(self.page_count() as u32 + 1)
    }

    fn on_restart(&mut self) {
        self.next_page = 0;
        self.collected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn jobs(n: usize) -> Vec<JobListing> {
        (0..n).map(|i| JobListing::new(format!("Engineer {i}"))).collect()
    }

    fn engine(max_retries: u32) -> EngineSection {
        EngineSection {
            max_retries,
            base_delay_ms: 10,
            max_steps_per_attempt: 5,
        }
    }

    fn task(company: &str) -> AgentTask {
        AgentTask::new().with(keys::COMPANY_ID, company)
    }

    #[tokio::test]
    async fn test_discovery_finds_known_page() {
        let catalog = ReplayCatalog::new().with_site("acme", ReplaySite::new(Some("https://acme.test/careers"), vec![]));
        let agent = catalog.discovery_agent(engine(0), MemorySection::default());
        let mut outcome = agent.run(task("acme"), CancellationToken::new()).await;
        assert!(outcome.success);
        let url: String = outcome.take(keys::CAREER_PAGE_URL).unwrap().unwrap();
        assert_eq!(url, "https://acme.test/careers");
    }

    #[tokio::test]
    async fn test_discovery_without_page_is_not_retried() {
        let catalog = ReplayCatalog::new().with_site("acme", ReplaySite::new(None, vec![]));
        let agent = catalog.discovery_agent(engine(3), MemorySection::default());
        let outcome = agent.run(task("acme"), CancellationToken::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.stats.attempts, 1);
        assert!(outcome.error.unwrap().contains("no career page found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extraction_recovers_from_transient_failures() {
        let catalog = ReplayCatalog::new()
            .with_site("acme", ReplaySite::new(Some("https://acme.test/jobs"), jobs(12)).with_transient_failures(2));
        let agent = catalog.extraction_agent(engine(3), MemorySection::default());
        let mut outcome = agent.run(task("acme"), CancellationToken::new()).await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.stats.retries, 2);
        let extracted: Vec<JobListing> = outcome.take(keys::JOBS).unwrap().unwrap();
        assert_eq!(extracted.len(), 12);
        assert_eq!(extracted[11].title, "Engineer 11");
    }

    #[tokio::test]
    async fn test_extraction_of_empty_site() {
        let catalog = ReplayCatalog::new().with_site("acme", ReplaySite::new(Some("https://acme.test/jobs"), vec![]));
        let agent = catalog.extraction_agent(engine(0), MemorySection::default());
        let mut outcome = agent.run(task("acme"), CancellationToken::new()).await;
        assert!(outcome.success);
        let extracted: Vec<JobListing> = outcome.take(keys::JOBS).unwrap().unwrap();
        assert!(extracted.is_empty());
    }

    #[tokio::test]
    async fn test_verifier_waits_for_listings_until_budget_runs_out() {
        let catalog = ReplayCatalog::new().with_site("acme", ReplaySite::new(Some("https://acme.test/jobs"), vec![]));
        let t = task("acme").with(keys::CAREER_PAGE_URL, "https://acme.test/jobs");

        let strict = catalog.verification_agent(engine(2), MemorySection::default(), true);
        let outcome = strict.run(t.clone(), CancellationToken::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.stats.attempts, 1);
        assert_eq!(outcome.stats.actions_taken, 5);
        assert!(outcome.error.unwrap().contains("Step budget exhausted"));

        let lenient = catalog.verification_agent(engine(2), MemorySection::default(), false);
        let outcome = lenient.run(t, CancellationToken::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.payload[keys::VERIFIED], json!(true));
    }

    #[tokio::test]
    async fn test_unknown_company_is_rejected() {
        let agent = ReplayCatalog::new().extraction_agent(engine(3), MemorySection::default());
        let outcome = agent.run(task("ghost"), CancellationToken::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.stats.attempts, 0);
    }
}
