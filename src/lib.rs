//! Jobhound - 职位发现智能体编排
//!
//! 模块划分：
//! - **agents**: 能力 Agent 边界、ControlLoop 适配器、内置匹配 Agent、回放 Agent
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复、状态机、工作流监管（取消）
//! - **engine**: 控制循环契约（Perceive / Analyze / Decide / Act）与驱动
//! - **memory**: 短期 / 工作 / 对话 / 模式记忆与持久化
//! - **observability**: 日志初始化
//! - **store**: 数据访问协作方（实体读取、产物持久化）
//! - **workflow**: 分阶段工作流编排、进度订阅

pub mod agents;
pub mod config;
pub mod core;
pub mod engine;
pub mod memory;
pub mod observability;
pub mod store;
pub mod workflow;

pub use agents::{AgentOutcome, AgentSet, CapabilityAgent};
pub use workflow::{DiscoveryRequest, JobDiscoveryResult, WorkflowOrchestrator, WorkflowProgress};
