//! 核心层：错误分类与恢复、状态机定义、工作流监管（取消）

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{AgentError, DataAccessError, ErrorKind, RecoveryAction, StageError};
pub use recovery::RecoveryEngine;
pub use session_supervisor::{CancelReason, SessionSupervisor};
pub use state::{AgentState, WorkflowStage};
