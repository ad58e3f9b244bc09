//! 控制循环契约：每个能力 Agent 实现的四阶段周期
//!
//! Perceive -> Analyze -> Decide -> Act，之后由 is_complete 决定是否结束并 compile_result。
//! 驱动循环（engine::driver）负责状态推进、重试、取消与记忆记录，Agent 只实现各阶段本身。

use async_trait::async_trait;

use crate::core::AgentError;
use crate::engine::{ActionResult, AgentAction, AgentObservation};
use crate::memory::MemoryManager;

#[async_trait]
pub trait ControlLoop: Send {
    /// analyze 产出、decide 消费的决策上下文
    type Context: Send;
    /// 循环结束时的最终产出
    type Output: Send;

    /// Agent 名称（日志、记忆来源、统计）
    fn name(&self) -> &str;

    /// 从环境收集输入；可能挂起在 I/O 上
    async fn perceive(&mut self, memory: &MemoryManager) -> Result<AgentObservation, AgentError>;

    /// 观察（+ 记忆）→ 决策上下文；纯计算，不挂起
    fn analyze(
        &self,
        observation: &AgentObservation,
        memory: &mut MemoryManager,
    ) -> Result<Self::Context, AgentError>;

    /// 选择恰好一个动作，必须给出置信度
    fn decide(&self, context: Self::Context) -> Result<AgentAction, AgentError>;

    /// 执行动作（网络 / 浏览器 / 模型调用），返回带 success 标志的结果
    async fn act(
        &mut self,
        action: &AgentAction,
        memory: &mut MemoryManager,
    ) -> Result<ActionResult, AgentError>;

    /// 循环是否应在本次动作后结束
    fn is_complete(&self, result: &ActionResult) -> bool;

    /// is_complete 返回 true 后产出最终结果
    fn compile_result(&mut self) -> Result<Self::Output, AgentError>;

    /// 覆盖会话级的单次尝试步数预算（如按待处理条目数计算）
    fn step_budget(&self) -> Option<u32> {
        None
    }

    /// 整轮重试前调用，Agent 可在此丢弃本轮累积的中间状态
    fn on_restart(&mut self) {}
}
