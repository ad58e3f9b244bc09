//! 能力 Agent 之间传递的领域载荷：职业页、职位、匹配记录、用户偏好
//!
//! Agent 的结果以 JSON 对象返回，编排器按固定键（`keys`）取出并反序列化为这些类型。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 结果对象中的约定键
pub mod keys {
    pub const CAREER_PAGE_URL: &str = "career_page_url";
    pub const CONFIDENCE: &str = "confidence";
    pub const VERIFIED: &str = "verified";
    pub const JOBS: &str = "jobs";
    pub const MATCHES: &str = "matches";
    pub const SUMMARY: &str = "summary";
    pub const COMPANY_ID: &str = "company_id";
    pub const USER_ID: &str = "user_id";
    pub const PREFERENCES: &str = "preferences";
    pub const FORCE_REFRESH: &str = "force_refresh";
}

/// 发现的职业页
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPage {
    pub url: String,
    pub confidence: f64,
    /// 来自公司记录（跳过发现阶段）而非 Agent
    #[serde(default)]
    pub from_record: bool,
}

/// 提取出的职位
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListing {
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub remote: Option<bool>,
    /// 持久化后由数据访问层分配
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobListing {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            location: None,
            url: None,
            description: None,
            department: None,
            remote: None,
            id: None,
            extra: Map::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = Some(remote);
        self
    }

    /// 标题 + 描述 + 部门，用于关键词匹配
    pub fn searchable_text(&self) -> String {
        [
            Some(self.title.as_str()),
            self.description.as_deref(),
            self.department.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// 用户偏好记录（用户实体的 `preferences` 字段）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub keywords: Vec<String>,
    pub excluded_keywords: Vec<String>,
    pub locations: Vec<String>,
    pub remote_ok: bool,
    pub seniority: Option<String>,
}

/// 职位与用户偏好的匹配记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMatch {
    /// 在本次提取结果中的下标
    pub job_index: usize,
    pub job_title: String,
    #[serde(default)]
    pub job_id: Option<String>,
    pub overall_score: f64,
    pub keyword_score: f64,
    pub location_score: f64,
    pub seniority_score: f64,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
}

/// 匹配摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub total_jobs: usize,
    pub total_matches: usize,
    pub average_score: f64,
}
