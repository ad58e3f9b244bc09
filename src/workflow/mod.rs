//! 工作流层：请求 / 进度 / 结果类型、进度订阅、编排器

pub mod orchestrator;
pub mod progress;
pub mod types;

pub use orchestrator::WorkflowOrchestrator;
pub use progress::{subscriber_fn, FnSubscriber, ProgressHub, ProgressSubscriber};
pub use types::{
    rank_recommendations, DiscoveryRequest, JobDiscoveryResult, ResultSummary, WorkflowId,
    WorkflowProgress,
};
