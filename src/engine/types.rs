//! 控制循环数据类型：任务、观察、动作、动作结果
//!
//! 观察与动作一经产生即不可变；任务在循环开始后只读。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::item::clamp_unit;

/// 任务描述：自由键值参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    params: Map<String, Value>,
}

impl AgentTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构建期追加参数（执行开始后任务只以 &AgentTask 形式暴露）
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }
}

/// 动作类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Extract,
    Click,
    Wait,
    Analyze,
    Custom(String),
}

impl ActionKind {
    pub fn label(&self) -> &str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Extract => "extract",
            ActionKind::Click => "click",
            ActionKind::Wait => "wait",
            ActionKind::Analyze => "analyze",
            ActionKind::Custom(name) => name,
        }
    }
}

/// decide 阶段产出的唯一动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    pub kind: ActionKind,
    pub params: Map<String, Value>,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentAction {
    pub fn new(kind: ActionKind, confidence: f64) -> Self {
        Self {
            kind,
            params: Map::new(),
            confidence: clamp_unit(confidence),
            reasoning: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// perceive 阶段产出的观察
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentObservation {
    pub kind: String,
    pub content: Map<String, Value>,
    pub confidence: f64,
    pub observed_at: DateTime<Utc>,
}

impl AgentObservation {
    pub fn new(kind: impl Into<String>, confidence: f64) -> Self {
        Self {
            kind: kind.into(),
            content: Map::new(),
            confidence: clamp_unit(confidence),
            observed_at: Utc::now(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.content.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }
}

/// act 阶段的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
        }
    }
}
