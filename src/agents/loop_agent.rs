//! ControlLoop → CapabilityAgent 适配器
//!
//! 每次 run：用工厂按任务构造一个新的 ControlLoop 实例与一个独占的 MemoryManager，
//! 交给驱动循环执行，再把 LoopReport 转换为 AgentOutcome。

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentOutcome, AgentStats, CapabilityAgent};
use crate::config::{EngineSection, MemorySection};
use crate::core::{AgentError, RecoveryEngine};
use crate::engine::{run_control_loop, AgentStatus, AgentTask, ControlLoop, LoopEvent, LoopSession};
use crate::memory::{MemoryManager, WorkingKey};

/// 以 ControlLoop 实现为内核的能力 Agent
pub struct LoopAgent<A, F> {
    name: String,
    factory: F,
    engine: EngineSection,
    memory_limits: MemorySection,
    event_tx: Option<mpsc::UnboundedSender<LoopEvent>>,
    status_tx: watch::Sender<AgentStatus>,
    _agent: PhantomData<fn() -> A>,
}

impl<A, F> LoopAgent<A, F>
where
    A: ControlLoop + 'static,
    A::Output: Serialize,
    F: Fn(&AgentTask) -> Result<A, AgentError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, factory: F) -> Self {
        let name = name.into();
        let (status_tx, _) = watch::channel(AgentStatus::idle(name.clone()));
        Self {
            name,
            factory,
            engine: EngineSection::default(),
            memory_limits: MemorySection::default(),
            event_tx: None,
            status_tx,
            _agent: PhantomData,
        }
    }

    pub fn with_engine(mut self, engine: EngineSection) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_memory_limits(mut self, limits: MemorySection) -> Self {
        self.memory_limits = limits;
        self
    }

    /// 推送循环过程事件
    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 最近一次运行的状态
    pub fn status(&self) -> watch::Receiver<AgentStatus> {
        self.status_tx.subscribe()
    }

    fn stats_for<T>(&self, report: &crate::engine::LoopReport<T>, memory: &MemoryManager) -> AgentStats {
        AgentStats {
            agent: self.name.clone(),
            success: report.success(),
            attempts: report.attempts,
            retries: report.retries,
            actions_taken: report.actions_taken,
            elapsed_secs: report.elapsed.as_secs_f64(),
            memory: Some(memory.stats()),
        }
    }
}

#[async_trait]
impl<A, F> CapabilityAgent for LoopAgent<A, F>
where
    A: ControlLoop + 'static,
    A::Output: Serialize,
    F: Fn(&AgentTask) -> Result<A, AgentError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, task: AgentTask, cancel: CancellationToken) -> AgentOutcome {
        let mut agent = match (self.factory)(&task) {
            Ok(agent) => agent,
            Err(e) => {
                tracing::warn!(agent = %self.name, error = %e, "Rejected task");
                return AgentOutcome::failed(
                    e.to_string(),
                    AgentStats {
                        agent: self.name.clone(),
                        ..AgentStats::default()
                    },
                );
            }
        };

        let mut memory = MemoryManager::new(&self.memory_limits).with_owner(self.name.clone());
        memory.set_working(
            WorkingKey::Task,
            Value::Object(task.params().clone()),
            1.0,
            ["task"],
        );

        let mut session = LoopSession::new(
            RecoveryEngine::from_config(&self.engine),
            self.engine.max_steps_per_attempt,
            cancel,
        )
        .with_status_tx(&self.status_tx);
        if let Some(tx) = self.event_tx.as_ref() {
            session = session.with_event_tx(tx);
        }

        let report = run_control_loop(&session, &mut agent, &mut memory).await;
        let stats = self.stats_for(&report, &memory);

        match report.output {
            Some(output) => match serde_json::to_value(output) {
                Ok(Value::Object(payload)) => AgentOutcome::succeeded(payload, stats),
                Ok(other) => {
                    let mut payload = Map::new();
                    payload.insert("result".to_string(), other);
                    AgentOutcome::succeeded(payload, stats)
                }
                Err(e) => AgentOutcome::failed(format!("Failed to serialize result: {e}"), stats),
            },
            None => {
                let error = report
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "agent produced no result".to_string());
                AgentOutcome::failed(
                    format!("{error} (after {} retries)", report.retries),
                    stats,
                )
            }
        }
    }
}
