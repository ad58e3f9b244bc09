//! 控制循环驱动
//!
//! Observing -> Orienting -> Deciding -> Acting ->（未完成则回到 Observing，否则 Completed）。
//! 任一阶段返回 Err 即进入 Error 并记录失败；重试预算未用尽时按 base * 2^attempt 退避后整轮重启，
//! 否则返回带重试次数的失败报告。每个动作与每次失败都自动写入短期记忆。
//! 取消在每轮迭代开始处检查，进行中的 I/O 允许完成。

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, AgentState, RecoveryAction, RecoveryEngine};
use crate::engine::{AgentAction, AgentObservation, AgentStatus, ControlLoop, LoopEvent};
use crate::memory::{MemoryKind, MemoryManager, WorkingKey};

/// 写入短期记忆时动作条目的重要度
const ACTION_IMPORTANCE: f64 = 0.4;
/// 写入短期记忆时失败条目的重要度
const FAILURE_IMPORTANCE: f64 = 0.7;

/// 单次驱动的配置：重试策略、步数预算、取消令牌与可选的事件 / 状态通道
pub struct LoopSession<'a> {
    pub recovery: RecoveryEngine,
    /// 单次尝试内最多执行的动作数
    pub max_steps: u32,
    pub cancel_token: CancellationToken,
    pub event_tx: Option<&'a mpsc::UnboundedSender<LoopEvent>>,
    pub status_tx: Option<&'a watch::Sender<AgentStatus>>,
}

impl<'a> LoopSession<'a> {
    pub fn new(recovery: RecoveryEngine, max_steps: u32, cancel_token: CancellationToken) -> Self {
        Self {
            recovery,
            max_steps,
            cancel_token,
            event_tx: None,
            status_tx: None,
        }
    }

    pub fn with_event_tx(mut self, tx: &'a mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_status_tx(mut self, tx: &'a watch::Sender<AgentStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    fn send_event(&self, ev: LoopEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn update_status(&self, f: impl FnOnce(&mut AgentStatus)) {
        if let Some(tx) = self.status_tx {
            tx.send_modify(|status| {
                f(status);
                status.updated_at = chrono::Utc::now();
            });
        }
    }

    fn enter(&self, agent: &str, state: AgentState) {
        tracing::debug!(agent, ?state, "Control loop state");
        self.update_status(|s| s.state = state);
        self.send_event(LoopEvent::StateChanged {
            agent: agent.to_string(),
            state,
        });
    }
}

/// 一次驱动的最终报告
#[derive(Debug)]
pub struct LoopReport<T> {
    pub agent: String,
    pub output: Option<T>,
    pub error: Option<AgentError>,
    /// 总尝试次数（= 重试次数 + 1）
    pub attempts: u32,
    pub retries: u32,
    /// 跨尝试累计的动作数
    pub actions_taken: u32,
    pub final_state: AgentState,
    pub elapsed: Duration,
}

impl<T> LoopReport<T> {
    pub fn success(&self) -> bool {
        self.output.is_some()
    }
}

/// 驱动任意 ControlLoop 实现直到完成或放弃
pub async fn run_control_loop<A: ControlLoop>(
    session: &LoopSession<'_>,
    agent: &mut A,
    memory: &mut MemoryManager,
) -> LoopReport<A::Output> {
    let started = Instant::now();
    let name = agent.name().to_string();
    let mut attempts = 0u32;
    let mut retries = 0u32;
    let mut actions_taken = 0u32;

    loop {
        attempts += 1;
        session.update_status(|s| {
            s.attempt = attempts;
            s.last_error = None;
        });

        let (failed_state, err) =
            match run_attempt(session, agent, memory, &name, &mut actions_taken).await {
                Ok(output) => {
                    session.send_event(LoopEvent::Completed {
                        agent: name.clone(),
                        attempts,
                        steps: actions_taken,
                    });
                    tracing::info!(agent = %name, attempts, actions = actions_taken, "Control loop completed");
                    return LoopReport {
                        agent: name,
                        output: Some(output),
                        error: None,
                        attempts,
                        retries,
                        actions_taken,
                        final_state: AgentState::Completed,
                        elapsed: started.elapsed(),
                    };
                }
                Err(failure) => failure,
            };

        session.enter(&name, AgentState::Error);
        session.update_status(|s| s.last_error = Some(err.to_string()));
        session.send_event(LoopEvent::PhaseFailed {
            agent: name.clone(),
            state: failed_state,
            error: err.to_string(),
        });
        memory.add_observation(
            json!({ "error": err.to_string(), "state": failed_state, "attempt": attempts }),
            MemoryKind::Failure,
            FAILURE_IMPORTANCE,
            [name.as_str(), "failure"],
            1.0,
        );

        let abort_with = match session.recovery.handle(&err, retries) {
            RecoveryAction::Retry { delay } => {
                retries += 1;
                tracing::warn!(
                    agent = %name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Control loop attempt failed, retrying"
                );
                session.send_event(LoopEvent::Retrying {
                    agent: name.clone(),
                    attempt: attempts + 1,
                    delay_ms: delay.as_millis() as u64,
                });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => None,
                    _ = session.cancel_token.cancelled() => Some(AgentError::Cancelled),
                }
            }
            RecoveryAction::Abort => Some(err),
        };

        match abort_with {
            None => agent.on_restart(),
            Some(err) => {
                tracing::warn!(agent = %name, attempts, error = %err, "Control loop aborted");
                session.send_event(LoopEvent::Aborted {
                    agent: name.clone(),
                    error: err.to_string(),
                });
                return LoopReport {
                    agent: name,
                    output: None,
                    error: Some(err),
                    attempts,
                    retries,
                    actions_taken,
                    final_state: AgentState::Error,
                    elapsed: started.elapsed(),
                };
            }
        }
    }
}

/// 单次尝试：失败时返回出错所在状态与错误
async fn run_attempt<A: ControlLoop>(
    session: &LoopSession<'_>,
    agent: &mut A,
    memory: &mut MemoryManager,
    name: &str,
    actions_taken: &mut u32,
) -> Result<A::Output, (AgentState, AgentError)> {
    let mut state = AgentState::Idle.advance(false);
    session.enter(name, state);

    let mut observation: Option<AgentObservation> = None;
    let mut context: Option<A::Context> = None;
    let mut action: Option<AgentAction> = None;
    let mut steps = 0u32;
    let max_steps = agent.step_budget().unwrap_or(session.max_steps);

    while !state.is_terminal() {
        if session.cancel_token.is_cancelled() {
            return Err((state, AgentError::Cancelled));
        }

        let mut complete = false;
        match state {
            AgentState::Observing => {
                let obs = agent.perceive(memory).await.map_err(|e| (state, e))?;
                memory.set_working(
                    WorkingKey::LastObservation,
                    serde_json::to_value(&obs).unwrap_or_default(),
                    obs.confidence,
                    [name],
                );
                observation = Some(obs);
            }
            AgentState::Orienting => {
                let obs = observation
                    .take()
                    .ok_or_else(|| (state, AgentError::Analysis("no observation to analyze".into())))?;
                context = Some(agent.analyze(&obs, memory).map_err(|e| (state, e))?);
            }
            AgentState::Deciding => {
                let ctx = context
                    .take()
                    .ok_or_else(|| (state, AgentError::Decision("no context to decide on".into())))?;
                action = Some(agent.decide(ctx).map_err(|e| (state, e))?);
            }
            AgentState::Acting => {
                let next = action
                    .take()
                    .ok_or_else(|| (state, AgentError::Action("no action to execute".into())))?;
                if steps >= max_steps {
                    return Err((state, AgentError::StepBudgetExhausted(steps)));
                }
                steps += 1;
                *actions_taken += 1;
                let taken = *actions_taken;
                session.update_status(|s| s.actions_taken = taken);

                memory.add_observation(
                    next.to_value(),
                    MemoryKind::Action,
                    ACTION_IMPORTANCE,
                    [name, "action", next.kind.label()],
                    next.confidence,
                );
                session.send_event(LoopEvent::ActionTaken {
                    agent: name.to_string(),
                    kind: next.kind.label().to_string(),
                    confidence: next.confidence,
                    step: steps,
                });

                let result = agent.act(&next, memory).await.map_err(|e| (state, e))?;
                if !result.success {
                    let error = result.error.clone().unwrap_or_default();
                    tracing::debug!(agent = name, %error, "Action returned unsuccessful result");
                    session.send_event(LoopEvent::ActionUnsuccessful {
                        agent: name.to_string(),
                        error,
                    });
                }
                memory.set_working(
                    WorkingKey::LastResult,
                    serde_json::to_value(&result).unwrap_or_default(),
                    0.5,
                    [name],
                );
                complete = agent.is_complete(&result);
            }
            AgentState::Idle | AgentState::Completed | AgentState::Error => {}
        }

        state = state.advance(complete);
        session.enter(name, state);
    }

    agent
        .compile_result()
        .map_err(|e| (AgentState::Completed, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ActionKind, ActionResult};
    use async_trait::async_trait;

    /// 数到 target 后完成；act 可配置为始终失败
    struct Counter {
        target: u32,
        count: u32,
        fail_act: bool,
        perceived: u32,
        restarts: u32,
    }

    impl Counter {
        fn new(target: u32) -> Self {
            Self {
                target,
                count: 0,
                fail_act: false,
                perceived: 0,
                restarts: 0,
            }
        }
    }

    #[async_trait]
    impl ControlLoop for Counter {
        type Context = u32;
        type Output = u32;

        fn name(&self) -> &str {
            "counter"
        }

        async fn perceive(&mut self, _memory: &MemoryManager) -> Result<AgentObservation, AgentError> {
            self.perceived += 1;
            Ok(AgentObservation::new("count", 1.0).with("count", self.count))
        }

        fn analyze(
            &self,
            observation: &AgentObservation,
            _memory: &mut MemoryManager,
        ) -> Result<u32, AgentError> {
            observation
                .get("count")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .ok_or_else(|| AgentError::Analysis("missing count".into()))
        }

        fn decide(&self, context: u32) -> Result<AgentAction, AgentError> {
            Ok(AgentAction::new(ActionKind::Custom("increment".into()), 0.9).with_param("from", context))
        }

        async fn act(
            &mut self,
            _action: &AgentAction,
            _memory: &mut MemoryManager,
        ) -> Result<ActionResult, AgentError> {
            if self.fail_act {
                return Err(AgentError::Network("connection reset".into()));
            }
            self.count += 1;
            Ok(ActionResult::ok(self.count))
        }

        fn is_complete(&self, _result: &ActionResult) -> bool {
            self.count >= self.target
        }

        fn compile_result(&mut self) -> Result<u32, AgentError> {
            Ok(self.count)
        }

        fn on_restart(&mut self) {
            self.restarts += 1;
        }
    }

    fn session(max_retries: u32, max_steps: u32) -> LoopSession<'static> {
        LoopSession::new(
            RecoveryEngine::new(max_retries, Duration::from_millis(100)),
            max_steps,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_completes_and_records_actions() {
        let mut agent = Counter::new(3);
        let mut memory = MemoryManager::default();
        let report = run_control_loop(&session(2, 20), &mut agent, &mut memory).await;
        assert!(report.success());
        assert_eq!(report.output, Some(3));
        assert_eq!(report.attempts, 1);
        assert_eq!(report.actions_taken, 3);
        assert_eq!(report.final_state, AgentState::Completed);
        let actions = memory
            .short_term()
            .iter()
            .filter(|i| i.kind == MemoryKind::Action)
            .count();
        assert_eq!(actions, 3);
        assert!(memory.peek_working(WorkingKey::LastResult).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_act_stops_after_max_retries_plus_one() {
        let mut agent = Counter::new(3);
        agent.fail_act = true;
        let mut memory = MemoryManager::default();
        let started = tokio::time::Instant::now();
        let report = run_control_loop(&session(2, 20), &mut agent, &mut memory).await;

        assert!(!report.success());
        assert_eq!(report.attempts, 3);
        assert_eq!(report.retries, 2);
        assert_eq!(agent.perceived, 3);
        assert_eq!(agent.restarts, 2);
        assert!(matches!(report.error, Some(AgentError::Network(_))));
        // 100ms + 200ms 退避
        assert!(started.elapsed() >= Duration::from_millis(300));
        let failures = memory
            .short_term()
            .iter()
            .filter(|i| i.kind == MemoryKind::Failure)
            .count();
        assert_eq!(failures, 3);
    }

    #[tokio::test]
    async fn test_step_budget_is_not_retried() {
        let mut agent = Counter::new(100);
        let mut memory = MemoryManager::default();
        let report = run_control_loop(&session(3, 5), &mut agent, &mut memory).await;
        assert_eq!(report.attempts, 1);
        assert_eq!(report.actions_taken, 5);
        assert_eq!(report.error, Some(AgentError::StepBudgetExhausted(5)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut agent = Counter::new(3);
        let mut memory = MemoryManager::default();
        let s = session(3, 20);
        s.cancel_token.cancel();
        let report = run_control_loop(&s, &mut agent, &mut memory).await;
        assert_eq!(report.error, Some(AgentError::Cancelled));
        assert_eq!(agent.perceived, 0);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_events_follow_phase_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(AgentStatus::idle("counter"));
        let s = session(0, 20).with_event_tx(&tx).with_status_tx(&status_tx);
        let mut agent = Counter::new(1);
        let mut memory = MemoryManager::default();
        run_control_loop(&s, &mut agent, &mut memory).await;
        drop(s);
        drop(tx);

        let mut states = vec![];
        while let Some(ev) = rx.recv().await {
            if let LoopEvent::StateChanged { state, .. } = ev {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                AgentState::Observing,
                AgentState::Orienting,
                AgentState::Deciding,
                AgentState::Acting,
                AgentState::Completed
            ]
        );
        let status = status_rx.borrow();
        assert_eq!(status.state, AgentState::Completed);
        assert_eq!(status.actions_taken, 1);
    }
}
