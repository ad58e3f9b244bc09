//! 执行引擎：控制循环契约（Perceive / Analyze / Decide / Act）、驱动循环、过程事件与状态报告

pub mod control;
pub mod driver;
pub mod events;
pub mod types;

pub use control::ControlLoop;
pub use driver::{run_control_loop, LoopReport, LoopSession};
pub use events::{AgentStatus, LoopEvent};
pub use types::{ActionKind, ActionResult, AgentAction, AgentObservation, AgentTask};
